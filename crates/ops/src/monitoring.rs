use std::time::Instant;

use nimbus_core::{Error, NimbusResult, ResourceKind};
use nimbus_driver::{DriverGateway, Operation};
use nimbus_registry::Registry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::fleet::{AggregateResult, FleetExecutor, Gate};
use crate::member::{resolve_credentials, working_set, FleetMember, MON_AGENT_STATUS};
use crate::FleetOps;

pub const AGENT_INSTALLING: &str = "installing";
pub const AGENT_INSTALLED: &str = "installed";
pub const AGENT_FAILED: &str = "failed";
pub const DEFAULT_SERVICE_TYPE: &str = "mcis";

/// Gate for agent installation: members already installing or installed are left alone.
pub fn agent_gate() -> Gate {
    Gate {
        field: MON_AGENT_STATUS.to_string(),
        skip: vec![AGENT_INSTALLING.to_string(), AGENT_INSTALLED.to_string()],
        in_progress: AGENT_INSTALLING.to_string(),
        success: AGENT_INSTALLED.to_string(),
        failure: AGENT_FAILED.to_string(),
    }
}

/// Body of the monitoring service's agent install call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInstallRequest {
    #[serde(rename = "ns_id")]
    pub namespace: String,
    #[serde(rename = "mcis_id")]
    pub group: String,
    pub vm_id: String,
    pub public_ip: String,
    pub user_name: String,
    pub ssh_key: String,
    #[serde(rename = "cspType")]
    pub csp_type: String,
    pub service_type: String,
    pub port: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub metric: String,
    pub vm_id: String,
    pub value: Value,
    #[serde(default)]
    pub err: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringReport {
    #[serde(rename = "nsId")]
    pub namespace: String,
    #[serde(rename = "mcisId")]
    pub group: String,
    #[serde(rename = "mcisMonitoring")]
    pub samples: Vec<MetricSample>,
}

/// Pull the headline value for `metric` out of an on-demand telemetry payload.
/// Unknown metric names yield the payload unchanged.
pub fn extract_metric(metric: &str, raw: &Value) -> Value {
    let path = match metric {
        "cpu" => "cpu_utilization",
        "mem" | "memory" => "mem_utilization",
        "disk" => "disk_utilization",
        "net" | "network" => "bytes_out",
        _ => return raw.clone(),
    };
    raw.get("values").and_then(|v| v.get(path)).cloned().unwrap_or(Value::Null)
}

#[derive(Clone)]
pub struct MonitoringOps {
    registry: Registry,
    executor: FleetExecutor,
    monitoring: DriverGateway,
}

impl MonitoringOps {
    pub fn new(executor: FleetExecutor, monitoring: DriverGateway) -> Self {
        Self { registry: executor.registry().clone(), executor, monitoring }
    }

    async fn members(&self, namespace: &str, group: &str) -> NimbusResult<Vec<FleetMember>> {
        if group.is_empty() {
            return Err(Error::invalid("group id must not be empty"));
        }
        working_set(&self.registry, namespace, group).await
    }
}

#[async_trait::async_trait]
impl FleetOps for MonitoringOps {
    async fn install_agent(
        &self,
        namespace: &str,
        group: &str,
        user_name: &str,
        service_type: &str,
    ) -> NimbusResult<AggregateResult> {
        let t0 = Instant::now();
        let members = self.members(namespace, group).await?;
        info!(ns = %namespace, group = %group, members = members.len(), "monitoring: install agent");
        let registry = self.registry.clone();
        let gateway = self.monitoring.clone();
        let ns = namespace.to_string();
        let grp = group.to_string();
        let user = user_name.to_string();
        let service = if service_type.is_empty() { DEFAULT_SERVICE_TYPE.to_string() } else { service_type.to_string() };

        let out = self
            .executor
            .run(namespace, members, Some(agent_gate()), move |member| {
                let registry = registry.clone();
                let gateway = gateway.clone();
                let ns = ns.clone();
                let grp = grp.clone();
                let user = user.clone();
                let service = service.clone();
                async move {
                    if member.public_ip.is_empty() {
                        return Err(Error::invalid(format!("vm {} has no public ip", member.id)));
                    }
                    let creds = resolve_credentials(&registry, &ns, &member, &user).await?;
                    let req = AgentInstallRequest {
                        namespace: ns,
                        group: grp,
                        vm_id: member.id.clone(),
                        public_ip: member.public_ip.clone(),
                        user_name: creds.user_name,
                        ssh_key: creds.private_key,
                        csp_type: member.provider_name.clone(),
                        service_type: service,
                        port: member.ssh_port.clone(),
                    };
                    let body = serde_json::to_value(&req)?;
                    Ok::<Value, Error>(gateway.invoke(Operation::InstallMonitoringAgent, "", body).await?)
                }
            })
            .await?;
        info!(
            ns = %namespace,
            group = %group,
            entries = out.entries.len(),
            skipped = out.skipped.len(),
            took_ms = %t0.elapsed().as_millis(),
            "monitoring: install agent done"
        );
        Ok(out)
    }

    async fn get_monitoring_data(&self, namespace: &str, group: &str, metric: &str) -> NimbusResult<MonitoringReport> {
        if metric.is_empty() {
            return Err(Error::invalid("metric must not be empty"));
        }
        let members = self.members(namespace, group).await?;
        let gateway = self.monitoring.clone();
        let (ns, grp, m) = (namespace.to_string(), group.to_string(), metric.to_string());

        let out = self
            .executor
            .run(namespace, members, None, move |member| {
                let gateway = gateway.clone();
                let op = Operation::OnDemandMetric {
                    namespace: ns.clone(),
                    group: grp.clone(),
                    vm: member.id.clone(),
                    ip: member.public_ip.clone(),
                    metric: m.clone(),
                };
                async move { Ok::<Value, Error>(gateway.invoke(op, "", Value::Null).await?) }
            })
            .await?;

        let samples = out
            .entries
            .into_iter()
            .map(|e| MetricSample {
                metric: metric.to_string(),
                vm_id: e.member_id,
                value: e.result.map(|raw| extract_metric(metric, &raw)).unwrap_or(Value::Null),
                err: e.error.unwrap_or_default(),
            })
            .collect();
        Ok(MonitoringReport { namespace: namespace.to_string(), group: group.to_string(), samples })
    }

    async fn set_agent_status(&self, namespace: &str, vm_id: &str, status: &str) -> NimbusResult<()> {
        let mut patch = Map::new();
        patch.insert(MON_AGENT_STATUS.to_string(), Value::String(status.to_string()));
        self.registry.update(namespace, ResourceKind::Vm, vm_id, &patch).await?;
        info!(ns = %namespace, vm = %vm_id, status = %status, "monitoring: agent status set");
        Ok(())
    }

    async fn check_monitoring_endpoint(&self) -> NimbusResult<Value> {
        Ok(self.monitoring.invoke(Operation::CheckMonitoringEndpoint, "", Value::Null).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_metrics_follow_their_path() {
        let raw = json!({"values": {"cpu_utilization": 12.5, "mem_utilization": "40", "bytes_out": 7}});
        assert_eq!(extract_metric("cpu", &raw), json!(12.5));
        assert_eq!(extract_metric("mem", &raw), json!("40"));
        assert_eq!(extract_metric("net", &raw), json!(7));
        assert_eq!(extract_metric("disk", &raw), Value::Null);
    }

    #[test]
    fn unknown_metric_returns_raw_payload() {
        let raw = json!({"values": {"custom": 1}, "tags": ["a"]});
        assert_eq!(extract_metric("gpu", &raw), raw);
    }

    #[test]
    fn install_request_uses_agent_field_names() {
        let req = AgentInstallRequest {
            namespace: "ns1".into(),
            group: "g1".into(),
            vm_id: "vm-1".into(),
            public_ip: "10.0.0.1".into(),
            user_name: "cb-user".into(),
            ssh_key: "KEY".into(),
            csp_type: "aws".into(),
            service_type: DEFAULT_SERVICE_TYPE.into(),
            port: "22".into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["ns_id"], "ns1");
        assert_eq!(v["mcis_id"], "g1");
        assert_eq!(v["cspType"], "aws");
        assert_eq!(v["service_type"], "mcis");
    }

    #[test]
    fn gate_skips_busy_and_done_members() {
        let g = agent_gate();
        assert_eq!(g.skip, vec!["installing".to_string(), "installed".to_string()]);
        assert_eq!(g.failure, "failed");
    }
}
