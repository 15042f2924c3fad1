use std::fmt;

use serde_json::{json, Value};

/// Which remote service an operation is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Driver,
    Monitoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// Every remote call the control plane makes, with its REST route and RPC method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateSecurityGroup,
    GetSecurityGroup { name: String },
    ListVmSpecs,
    GetVmSpec { name: String },
    ListConnectionConfigs,
    AddSubnet { vpc: String },
    InstallMonitoringAgent,
    OnDemandMetric { namespace: String, group: String, vm: String, ip: String, metric: String },
    CheckMonitoringEndpoint,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateSecurityGroup => "create_security_group",
            Operation::GetSecurityGroup { .. } => "get_security_group",
            Operation::ListVmSpecs => "list_vm_specs",
            Operation::GetVmSpec { .. } => "get_vm_spec",
            Operation::ListConnectionConfigs => "list_connection_configs",
            Operation::AddSubnet { .. } => "add_subnet",
            Operation::InstallMonitoringAgent => "install_monitoring_agent",
            Operation::OnDemandMetric { .. } => "on_demand_metric",
            Operation::CheckMonitoringEndpoint => "check_monitoring_endpoint",
        }
    }

    pub fn service(&self) -> Service {
        match self {
            Operation::InstallMonitoringAgent
            | Operation::OnDemandMetric { .. }
            | Operation::CheckMonitoringEndpoint => Service::Monitoring,
            _ => Service::Driver,
        }
    }

    /// Method and path segments relative to the service base URL. Segments
    /// are raw; the transport escapes them.
    pub fn rest_route(&self) -> (HttpMethod, Vec<String>) {
        match self {
            Operation::CreateSecurityGroup => (HttpMethod::Post, segments(&["securitygroup"])),
            Operation::GetSecurityGroup { name } => (HttpMethod::Get, segments(&["securitygroup", name.as_str()])),
            Operation::ListVmSpecs => (HttpMethod::Get, segments(&["vmspec"])),
            Operation::GetVmSpec { name } => (HttpMethod::Get, segments(&["vmspec", name.as_str()])),
            Operation::ListConnectionConfigs => (HttpMethod::Get, segments(&["connectionconfig"])),
            Operation::AddSubnet { vpc } => (HttpMethod::Post, segments(&["vpc", vpc.as_str(), "subnet"])),
            Operation::InstallMonitoringAgent => (HttpMethod::Post, segments(&["agent"])),
            Operation::OnDemandMetric { namespace, group, vm, ip, metric } => (
                HttpMethod::Get,
                segments(&[
                    "ns",
                    namespace.as_str(),
                    "mcis",
                    group.as_str(),
                    "vm",
                    vm.as_str(),
                    "agent_ip",
                    ip.as_str(),
                    "metric",
                    metric.as_str(),
                    "ondemand-monitoring-info",
                ]),
            ),
            Operation::CheckMonitoringEndpoint => (HttpMethod::Get, segments(&["config"])),
        }
    }

    /// Method name on the RPC channel; monitoring calls are REST only.
    pub fn rpc_method(&self) -> Option<&'static str> {
        match self {
            Operation::CreateSecurityGroup => Some("CreateSecurity"),
            Operation::GetSecurityGroup { .. } => Some("GetSecurity"),
            Operation::ListVmSpecs => Some("ListVMSpec"),
            Operation::GetVmSpec { .. } => Some("GetVMSpec"),
            Operation::ListConnectionConfigs => Some("ListConnectionConfig"),
            Operation::AddSubnet { .. } => Some("AddSubnet"),
            Operation::InstallMonitoringAgent
            | Operation::OnDemandMetric { .. }
            | Operation::CheckMonitoringEndpoint => None,
        }
    }

    /// Request body as sent on the wire.
    ///
    /// Driver calls carry `{ConnectionName, ReqInfo}` (ReqInfo omitted when the
    /// payload is null); monitoring calls send the payload as is.
    pub fn envelope(&self, connection_name: &str, payload: Value) -> Option<Value> {
        match self.service() {
            Service::Monitoring => (!payload.is_null()).then_some(payload),
            Service::Driver => {
                if connection_name.is_empty() && payload.is_null() {
                    return None;
                }
                let mut body = json!({ "ConnectionName": connection_name });
                if !payload.is_null() {
                    body["ReqInfo"] = payload;
                }
                Some(body)
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn segments(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
