//! Process configuration, read once from `NIMBUS_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use nimbus_driver::CallMethod;
use nimbus_ops::DEFAULT_CONCURRENCY;

pub const DEFAULT_DRIVER_REST_URL: &str = "http://localhost:1024/spider";
pub const DEFAULT_MONITORING_URL: &str = "http://localhost:9090/dragonfly";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Empty means the in-process KV store.
    pub etcd_endpoints: Vec<String>,
    pub etcd_dial_timeout: Duration,
    /// On-disk mirror; only used together with etcd (see [`Config::mirror_path`]).
    pub db_path: String,
    pub driver_call_method: CallMethod,
    pub driver_rest_url: String,
    pub driver_rpc_conf: PathBuf,
    pub driver_timeout: Duration,
    pub monitoring_url: String,
    pub monitoring_timeout: Duration,
    pub fleet_concurrency: usize,
    pub lock_timeout: Duration,
    pub session_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Where the mirror lives. The mirror is a projection of the canonical store,
    /// so it never outlives it: with the in-process KV store it is in memory too.
    pub fn mirror_path(&self) -> &str {
        if self.etcd_endpoints.is_empty() {
            ":memory:"
        } else {
            &self.db_path
        }
    }

    /// Build from an arbitrary variable source; unparsable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |k: &str, d: u64| Duration::from_secs(get(k).and_then(|s| s.trim().parse::<u64>().ok()).unwrap_or(d));
        let etcd_endpoints = get("NIMBUS_ETCD_ENDPOINTS")
            .map(|s| s.split(',').map(|e| e.trim().to_string()).filter(|e| !e.is_empty()).collect())
            .unwrap_or_default();
        let root = get("NIMBUS_ROOT").unwrap_or_else(|| ".".to_string());
        Self {
            etcd_endpoints,
            etcd_dial_timeout: secs("NIMBUS_ETCD_DIAL_TIMEOUT_SECS", 5),
            db_path: get("NIMBUS_DB_PATH").unwrap_or_else(nimbus_persist::default_db_path),
            driver_call_method: get("NIMBUS_DRIVER_CALL_METHOD")
                .and_then(|s| CallMethod::from_str(&s).ok())
                .unwrap_or(CallMethod::Rest),
            driver_rest_url: get("NIMBUS_DRIVER_REST_URL").unwrap_or_else(|| DEFAULT_DRIVER_REST_URL.to_string()),
            driver_rpc_conf: get("NIMBUS_DRIVER_RPC_CONF")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(root).join("conf").join("driver_rpc.yaml")),
            driver_timeout: secs("NIMBUS_DRIVER_TIMEOUT_SECS", 120),
            monitoring_url: get("NIMBUS_MONITORING_URL").unwrap_or_else(|| DEFAULT_MONITORING_URL.to_string()),
            monitoring_timeout: secs("NIMBUS_MONITORING_TIMEOUT_SECS", 480),
            fleet_concurrency: get("NIMBUS_FLEET_CONCURRENCY")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_CONCURRENCY),
            lock_timeout: secs("NIMBUS_LOCK_TIMEOUT_SECS", 30),
            session_ttl: secs("NIMBUS_SESSION_TTL_SECS", 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_unset() {
        let c = Config::from_lookup(|k| (k == "NIMBUS_DB_PATH").then(|| ":memory:".to_string()));
        assert!(c.etcd_endpoints.is_empty());
        assert_eq!(c.driver_call_method, CallMethod::Rest);
        assert_eq!(c.driver_rest_url, DEFAULT_DRIVER_REST_URL);
        assert_eq!(c.driver_rpc_conf, PathBuf::from("./conf/driver_rpc.yaml"));
        assert_eq!(c.monitoring_timeout, Duration::from_secs(480));
        assert_eq!(c.fleet_concurrency, 16);
        assert_eq!(c.db_path, ":memory:");
    }

    #[test]
    fn values_are_parsed_and_garbage_ignored() {
        let env: HashMap<&str, &str> = [
            ("NIMBUS_ETCD_ENDPOINTS", "10.0.0.1:2379, 10.0.0.2:2379,"),
            ("NIMBUS_DRIVER_CALL_METHOD", "grpc"),
            ("NIMBUS_ROOT", "/opt/nimbus"),
            ("NIMBUS_FLEET_CONCURRENCY", "0"),
            ("NIMBUS_LOCK_TIMEOUT_SECS", "soon"),
            ("NIMBUS_DRIVER_TIMEOUT_SECS", "7"),
        ]
        .into_iter()
        .collect();
        let c = Config::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.etcd_endpoints, vec!["10.0.0.1:2379".to_string(), "10.0.0.2:2379".to_string()]);
        assert_eq!(c.driver_call_method, CallMethod::Rpc);
        assert_eq!(c.driver_rpc_conf, PathBuf::from("/opt/nimbus/conf/driver_rpc.yaml"));
        assert_eq!(c.fleet_concurrency, 16);
        assert_eq!(c.lock_timeout, Duration::from_secs(30));
        assert_eq!(c.driver_timeout, Duration::from_secs(7));
    }

    #[test]
    fn mirror_follows_the_canonical_store() {
        let c = Config::from_lookup(|k| (k == "NIMBUS_DB_PATH").then(|| "/var/lib/nimbus/nimbus.db".to_string()));
        assert_eq!(c.mirror_path(), ":memory:");

        let c = Config::from_lookup(|k| match k {
            "NIMBUS_DB_PATH" => Some("/var/lib/nimbus/nimbus.db".to_string()),
            "NIMBUS_ETCD_ENDPOINTS" => Some("10.0.0.1:2379".to_string()),
            _ => None,
        });
        assert_eq!(c.mirror_path(), "/var/lib/nimbus/nimbus.db");
    }
}
