use std::time::Instant;

use nimbus_core::identity::check_string;
use nimbus_core::{CspIdentity, Error, NimbusResult, ResourceKind, ResourceRecord};
use nimbus_driver::model::{SecurityGroupInfo, SecurityGroupReq as DriverSecurityGroupReq, SecurityRule};
use nimbus_driver::{DriverGateway, Operation};
use nimbus_registry::Registry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

pub const REGISTERED_LABEL: &str = "Registered from CSP resource";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    #[serde(default)]
    pub from_port: String,
    #[serde(default)]
    pub to_port: String,
    #[serde(default)]
    pub ip_protocol: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub cidr: String,
}

impl From<FirewallRule> for SecurityRule {
    fn from(r: FirewallRule) -> Self {
        Self { from_port: r.from_port, to_port: r.to_port, ip_protocol: r.ip_protocol, direction: r.direction, cidr: r.cidr }
    }
}

impl From<SecurityRule> for FirewallRule {
    fn from(r: SecurityRule) -> Self {
        Self { from_port: r.from_port, to_port: r.to_port, ip_protocol: r.ip_protocol, direction: r.direction, cidr: r.cidr }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupReq {
    pub name: String,
    pub connection_name: String,
    pub v_net_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub firewall_rules: Vec<FirewallRule>,
    /// Name of an existing CSP security group; used by `register` only.
    #[serde(default)]
    pub csp_security_group_name: String,
}

#[derive(Clone)]
pub struct SecurityGroupService {
    registry: Registry,
    driver: DriverGateway,
}

impl SecurityGroupService {
    pub fn new(registry: Registry, driver: DriverGateway) -> Self {
        Self { registry, driver }
    }

    fn validate(namespace: &str, req: &SecurityGroupReq) -> NimbusResult<String> {
        check_string(namespace)?;
        check_string(&req.name)?;
        if req.connection_name.is_empty() || req.v_net_id.is_empty() {
            return Err(Error::invalid("connectionName and vNetId are required"));
        }
        Ok(req.name.clone())
    }

    /// CSP-side name of the vNet the group is attached to.
    async fn vpc_name(&self, namespace: &str, v_net_id: &str) -> NimbusResult<String> {
        let vnet = self.registry.get(namespace, ResourceKind::VNet, v_net_id).await?;
        Ok(if vnet.csp.name_id.is_empty() { vnet.id } else { vnet.csp.name_id })
    }

    fn to_record(req: &SecurityGroupReq, id: &str, info: SecurityGroupInfo) -> NimbusResult<ResourceRecord> {
        let rules: Vec<FirewallRule> = match info.security_rules {
            Some(r) => r.into_iter().map(FirewallRule::from).collect(),
            None => req.firewall_rules.clone(),
        };
        let mut rec = ResourceRecord::new(ResourceKind::SecurityGroup, &req.name)
            .with("vNetId", if info.vpc_iid.name_id.is_empty() { req.v_net_id.clone() } else { info.vpc_iid.name_id })
            .with("firewallRules", serde_json::to_value(rules)?)
            .with("keyValueList", serde_json::to_value(info.key_value_list.unwrap_or_default())?);
        rec.id = id.to_string();
        rec.connection_name = req.connection_name.clone();
        rec.description = req.description.clone();
        rec.csp = CspIdentity { name_id: info.iid.name_id, system_id: info.iid.system_id };
        Ok(rec)
    }

    /// Create the group on the provider and record it.
    pub async fn create(&self, namespace: &str, req: &SecurityGroupReq) -> NimbusResult<ResourceRecord> {
        let t0 = Instant::now();
        let id = Self::validate(namespace, req)?;
        if self.registry.exists(namespace, ResourceKind::SecurityGroup, &id).await? {
            return Err(Error::already_exists(namespace, ResourceKind::SecurityGroup, &id));
        }
        let body = DriverSecurityGroupReq {
            name: req.name.clone(),
            vpc_name: self.vpc_name(namespace, &req.v_net_id).await?,
            security_rules: req.firewall_rules.iter().cloned().map(SecurityRule::from).collect(),
        };
        let info: SecurityGroupInfo = self
            .driver
            .invoke_as(Operation::CreateSecurityGroup, &req.connection_name, serde_json::to_value(&body)?)
            .await?;
        let rec = self.registry.create(namespace, ResourceKind::SecurityGroup, Self::to_record(req, &id, info)?).await?;
        info!(ns = %namespace, id = %rec.id, csp_id = %rec.csp.system_id, took_ms = %t0.elapsed().as_millis(), "securitygroup: create ok");
        Ok(rec)
    }

    /// Import a group that already exists on the provider.
    pub async fn register(&self, namespace: &str, req: &SecurityGroupReq) -> NimbusResult<ResourceRecord> {
        let id = Self::validate(namespace, req)?;
        if self.registry.exists(namespace, ResourceKind::SecurityGroup, &id).await? {
            return Err(Error::already_exists(namespace, ResourceKind::SecurityGroup, &id));
        }
        // The driver only needs the vNet to exist here.
        self.vpc_name(namespace, &req.v_net_id).await?;
        let csp_name = if req.csp_security_group_name.is_empty() { &req.name } else { &req.csp_security_group_name };
        let info: SecurityGroupInfo = self
            .driver
            .invoke_as(Operation::GetSecurityGroup { name: csp_name.clone() }, &req.connection_name, Value::Null)
            .await?;
        let mut rec = Self::to_record(req, &id, info)?;
        rec.system_label = REGISTERED_LABEL.to_string();
        let rec = self.registry.create(namespace, ResourceKind::SecurityGroup, rec).await?;
        info!(ns = %namespace, id = %rec.id, csp_name = %csp_name, "securitygroup: register ok");
        Ok(rec)
    }
}
