//! Nimbus Ops: fleet-wide operations over the VMs of one deployed group.

#![forbid(unsafe_code)]

use nimbus_core::NimbusResult;
use serde_json::Value;

pub mod fleet;
pub mod member;
pub mod monitoring;

pub use fleet::{AggregateResult, FleetExecutor, Gate, MemberOutcome, DEFAULT_CONCURRENCY};
pub use member::{resolve_credentials, working_set, Credentials, FleetMember};
pub use monitoring::{
    agent_gate, extract_metric, AgentInstallRequest, MetricSample, MonitoringOps, MonitoringReport,
};

#[async_trait::async_trait]
pub trait FleetOps: Send + Sync {
    /// Install the monitoring agent on every eligible VM of `group`.
    async fn install_agent(
        &self,
        namespace: &str,
        group: &str,
        user_name: &str,
        service_type: &str,
    ) -> NimbusResult<AggregateResult>;

    /// Poll one metric from every VM of `group`.
    async fn get_monitoring_data(&self, namespace: &str, group: &str, metric: &str) -> NimbusResult<MonitoringReport>;

    async fn set_agent_status(&self, namespace: &str, vm_id: &str, status: &str) -> NimbusResult<()>;

    /// Reachability probe of the monitoring service.
    async fn check_monitoring_endpoint(&self) -> NimbusResult<Value>;
}
