//! Nimbus control plane façade (in-process).
//!
//! Wires the canonical store, the mirror, the driver and monitoring gateways
//! and the fleet executor from one [`Config`], and hands out the resource
//! services frontends call.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::histogram;
use nimbus_core::identity::kind_prefix;
use nimbus_core::{NimbusResult, ResourceKind};
use nimbus_driver::DriverGateway;
use nimbus_persist::{Mirror, SqliteMirror};
use nimbus_registry::Registry;
use nimbus_store::{KvStore, MemoryKv, WatchEvent};
use tokio::sync::mpsc;
use tracing::info;

pub mod config;
pub mod securitygroup;
pub mod spec;
pub mod subnet;

pub use config::Config;
pub use nimbus_ops::{FleetExecutor, FleetOps, MonitoringOps};
pub use securitygroup::{FirewallRule, SecurityGroupReq, SecurityGroupService};
pub use spec::{convert_driver_spec, SpecReq, SpecService};
pub use subnet::{SubnetReq, SubnetService};

#[derive(Clone)]
pub struct ControlPlane {
    registry: Registry,
    driver: DriverGateway,
    fleet: Arc<MonitoringOps>,
}

impl ControlPlane {
    /// Build every component from `cfg`. Connects to etcd when endpoints are configured.
    pub async fn open(cfg: &Config) -> Result<Self> {
        let t0 = Instant::now();
        let kv = open_kv(cfg).await?;
        let db = cfg.mirror_path();
        if db != cfg.db_path {
            info!(db = %cfg.db_path, "controlplane: in-process KV store; keeping the mirror in memory");
        }
        let mirror: Arc<dyn Mirror> =
            Arc::new(SqliteMirror::open(db).with_context(|| format!("opening mirror at {}", db))?);
        let driver = DriverGateway::from_method(
            cfg.driver_call_method,
            &cfg.driver_rest_url,
            cfg.driver_rpc_conf.clone(),
            cfg.driver_timeout,
        )
        .context("building driver gateway")?;
        let monitoring =
            DriverGateway::rest(&cfg.monitoring_url, cfg.monitoring_timeout).context("building monitoring gateway")?;
        let registry = Registry::new(kv, mirror).with_lock_timeout(cfg.lock_timeout).with_session_ttl(cfg.session_ttl);
        let cp = Self::from_parts(registry, driver, monitoring, cfg.fleet_concurrency);
        histogram!("controlplane_open_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            kv = if cfg.etcd_endpoints.is_empty() { "memory" } else { "etcd" },
            db = %db,
            driver = cp.driver.transport_kind(),
            took_ms = %t0.elapsed().as_millis(),
            "controlplane: ready"
        );
        Ok(cp)
    }

    pub fn from_parts(registry: Registry, driver: DriverGateway, monitoring: DriverGateway, concurrency: usize) -> Self {
        let executor = FleetExecutor::new(registry.clone(), concurrency);
        Self { fleet: Arc::new(MonitoringOps::new(executor, monitoring)), registry, driver }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn security_groups(&self) -> SecurityGroupService {
        SecurityGroupService::new(self.registry.clone(), self.driver.clone())
    }

    pub fn specs(&self) -> SpecService {
        SpecService::new(self.registry.clone(), self.driver.clone())
    }

    pub fn subnets(&self) -> SubnetService {
        SubnetService::new(self.registry.clone(), self.driver.clone())
    }

    pub fn fleet(&self) -> Arc<dyn FleetOps> {
        self.fleet.clone()
    }

    /// Changes to records of `kind` in `namespace`, until the receiver is dropped.
    pub async fn watch(&self, namespace: &str, kind: ResourceKind) -> NimbusResult<mpsc::Receiver<WatchEvent>> {
        nimbus_core::identity::check_string(namespace)?;
        self.registry
            .kv()
            .watch(&kind_prefix(namespace, kind), true)
            .await
            .map_err(|e| nimbus_core::Error::Persistence(e.to_string()))
    }
}

async fn open_kv(cfg: &Config) -> Result<Arc<dyn KvStore>> {
    if cfg.etcd_endpoints.is_empty() {
        return Ok(Arc::new(MemoryKv::new()));
    }
    connect_etcd(cfg).await
}

#[cfg(feature = "etcd")]
async fn connect_etcd(cfg: &Config) -> Result<Arc<dyn KvStore>> {
    let kv = nimbus_store::EtcdKv::connect(&cfg.etcd_endpoints, cfg.etcd_dial_timeout)
        .await
        .with_context(|| format!("connecting to etcd at {}", cfg.etcd_endpoints.join(",")))?;
    Ok(Arc::new(kv))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_cfg: &Config) -> Result<Arc<dyn KvStore>> {
    anyhow::bail!("NIMBUS_ETCD_ENDPOINTS is set but this build lacks the `etcd` feature")
}
