use nimbus_core::identity::{check_string, to_naming_rule_compatible};
use nimbus_core::{CspIdentity, Error, NimbusResult, ResourceKind, ResourceRecord};
use nimbus_driver::model::{KeyValue, SubnetReq as DriverSubnetReq, VpcInfo};
use nimbus_driver::{DriverGateway, Operation};
use nimbus_registry::Registry;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const STATUS_AVAILABLE: &str = "Available";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubnetReq {
    pub name: String,
    #[serde(rename = "ipv4_CIDR")]
    pub ipv4_cidr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(rename = "tagList", default, skip_serializing_if = "Vec::is_empty")]
    pub tag_list: Vec<KeyValue>,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone)]
pub struct SubnetService {
    registry: Registry,
    driver: DriverGateway,
}

impl SubnetService {
    pub fn new(registry: Registry, driver: DriverGateway) -> Self {
        Self { registry, driver }
    }

    /// Add a subnet to an existing vNet on the provider and record it.
    pub async fn create(&self, namespace: &str, v_net_id: &str, req: &SubnetReq) -> NimbusResult<ResourceRecord> {
        check_string(namespace)?;
        if req.name.is_empty() || req.ipv4_cidr.is_empty() {
            return Err(Error::invalid("subnet name and ipv4_CIDR are required"));
        }
        let id = to_naming_rule_compatible(&req.name)?;
        if self.registry.exists(namespace, ResourceKind::Subnet, &id).await? {
            return Err(Error::already_exists(namespace, ResourceKind::Subnet, &id));
        }
        let vnet = self.registry.get(namespace, ResourceKind::VNet, v_net_id).await?;
        let vpc = if vnet.csp.name_id.is_empty() { vnet.id.clone() } else { vnet.csp.name_id.clone() };

        let body = DriverSubnetReq { name: req.name.clone(), ipv4_cidr: req.ipv4_cidr.clone(), zone: req.zone.clone() };
        let reply: VpcInfo = self
            .driver
            .invoke_as(Operation::AddSubnet { vpc: vpc.clone() }, &vnet.connection_name, serde_json::to_value(&body)?)
            .await?;
        let created = reply
            .subnet_info_list
            .into_iter()
            .find(|s| s.iid.name_id == req.name)
            .ok_or_else(|| Error::Persistence(format!("driver reply for vpc {} does not list subnet {}", vpc, req.name)))?;

        let mut rec = ResourceRecord::new(ResourceKind::Subnet, &req.name)
            .with("vNetId", vnet.id.clone())
            .with("cspVNetId", reply.iid.system_id)
            .with("cspVNetName", reply.iid.name_id)
            .with("ipv4_CIDR", if created.ipv4_cidr.is_empty() { req.ipv4_cidr.clone() } else { created.ipv4_cidr })
            .with("zone", if created.zone.is_empty() { req.zone.clone() } else { created.zone })
            .with("tagList", serde_json::to_value(&req.tag_list)?)
            .with("keyValueList", serde_json::to_value(created.key_value_list.unwrap_or_default())?)
            .with("status", STATUS_AVAILABLE);
        rec.id = id;
        rec.uid = uuid::Uuid::new_v4().to_string();
        rec.connection_name = vnet.connection_name.clone();
        rec.description = req.description.clone();
        rec.csp = CspIdentity { name_id: created.iid.name_id, system_id: created.iid.system_id };

        let rec = self.registry.create(namespace, ResourceKind::Subnet, rec).await?;
        info!(ns = %namespace, vnet = %v_net_id, id = %rec.id, csp_id = %rec.csp.system_id, "subnet: create ok");
        Ok(rec)
    }
}
