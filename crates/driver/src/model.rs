//! Wire shapes exchanged with the driver. Field names follow the driver's
//! PascalCase JSON.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Iid {
    #[serde(default)]
    pub name_id: String,
    #[serde(default)]
    pub system_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValue {
    #[serde(default, alias = "key")]
    pub key: String,
    #[serde(default, alias = "value")]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    #[serde(rename = "FromPort", alias = "fromPort", default)]
    pub from_port: String,
    #[serde(rename = "ToPort", alias = "toPort", default)]
    pub to_port: String,
    #[serde(rename = "IPProtocol", alias = "ipProtocol", default)]
    pub ip_protocol: String,
    #[serde(rename = "Direction", alias = "direction", default)]
    pub direction: String,
    #[serde(rename = "CIDR", alias = "cidr", default)]
    pub cidr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroupReq {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "VPCName")]
    pub vpc_name: String,
    #[serde(rename = "SecurityRules")]
    pub security_rules: Vec<SecurityRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroupInfo {
    #[serde(rename = "IId", default)]
    pub iid: Iid,
    #[serde(rename = "VpcIID", default)]
    pub vpc_iid: Iid,
    #[serde(rename = "SecurityRules", default)]
    pub security_rules: Option<Vec<SecurityRule>>,
    #[serde(rename = "KeyValueList", default)]
    pub key_value_list: Option<Vec<KeyValue>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VCpu {
    #[serde(default)]
    pub count: String,
    #[serde(default)]
    pub clock: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Gpu {
    #[serde(default)]
    pub count: String,
    #[serde(default)]
    pub mfr: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub mem: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmSpecInfo {
    #[serde(rename = "Region", default)]
    pub region: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "VCpu", default)]
    pub vcpu: VCpu,
    /// MiB, as a decimal string.
    #[serde(rename = "Mem", default)]
    pub mem: String,
    #[serde(rename = "Gpu", default)]
    pub gpu: Option<Vec<Gpu>>,
    #[serde(rename = "KeyValueList", default)]
    pub key_value_list: Option<Vec<KeyValue>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmSpecList {
    #[serde(default)]
    pub vmspec: Vec<VmSpecInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionConfig {
    #[serde(default)]
    pub config_name: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub driver_name: String,
    #[serde(default)]
    pub credential_name: String,
    #[serde(default)]
    pub region_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfigList {
    #[serde(default)]
    pub connectionconfig: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubnetReq {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "IPv4_CIDR")]
    pub ipv4_cidr: String,
    #[serde(rename = "Zone", default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubnetInfo {
    #[serde(rename = "IId", default)]
    pub iid: Iid,
    #[serde(rename = "Zone", default)]
    pub zone: String,
    #[serde(rename = "IPv4_CIDR", default)]
    pub ipv4_cidr: String,
    #[serde(rename = "KeyValueList", default)]
    pub key_value_list: Option<Vec<KeyValue>>,
}

/// Reply to AddSubnet: the enclosing VPC with its full subnet list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpcInfo {
    #[serde(rename = "IId", default)]
    pub iid: Iid,
    #[serde(rename = "IPv4_CIDR", default)]
    pub ipv4_cidr: String,
    #[serde(rename = "SubnetInfoList", default)]
    pub subnet_info_list: Vec<SubnetInfo>,
}
