//! Nimbus core types: canonical resource records, kinds, identity rules,
//! filter criteria and the shared error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod error;
pub mod filter;
pub mod identity;

pub use error::{DriverError, Error, NimbusResult};
pub use filter::{Criterion, FieldSpec, FieldType, FilterCriteria, Predicate, Range, SortDirection};

pub mod prelude {
    pub use super::{
        CspIdentity, DriverError, Error, FilterCriteria, NimbusResult, Range, ResourceKind, ResourceRecord,
        SortDirection,
    };
}

/// Resource kinds the registry keys records by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "namespace")]
    Namespace,
    #[serde(rename = "vNet")]
    VNet,
    #[serde(rename = "subnet")]
    Subnet,
    #[serde(rename = "securityGroup")]
    SecurityGroup,
    #[serde(rename = "spec")]
    Spec,
    #[serde(rename = "sshKey")]
    SshKey,
    #[serde(rename = "vm")]
    Vm,
    #[serde(rename = "vpn")]
    Vpn,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Namespace,
        ResourceKind::VNet,
        ResourceKind::Subnet,
        ResourceKind::SecurityGroup,
        ResourceKind::Spec,
        ResourceKind::SshKey,
        ResourceKind::Vm,
        ResourceKind::Vpn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::VNet => "vNet",
            ResourceKind::Subnet => "subnet",
            ResourceKind::SecurityGroup => "securityGroup",
            ResourceKind::Spec => "spec",
            ResourceKind::SshKey => "sshKey",
            ResourceKind::Vm => "vm",
            ResourceKind::Vpn => "vpn",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown resource kind: {}", s)))
    }
}

/// Identity of the object on the cloud provider side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CspIdentity {
    #[serde(default)]
    pub name_id: String,
    #[serde(default)]
    pub system_id: String,
}

/// Canonical resource record. Common fields are typed; everything kind-specific
/// lives in `payload` and is flattened into the same JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "resourceType")]
    pub kind: ResourceKind,
    #[serde(default)]
    pub connection_name: String,
    #[serde(default)]
    pub csp: CspIdentity,
    #[serde(default)]
    pub associated_object_list: Vec<String>,
    #[serde(default)]
    pub is_auto_generated: bool,
    #[serde(default)]
    pub system_label: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// JSON keys owned by the typed part of [`ResourceRecord`].
pub const RESERVED_KEYS: &[&str] = &[
    "namespace",
    "id",
    "uid",
    "name",
    "resourceType",
    "connectionName",
    "csp",
    "associatedObjectList",
    "isAutoGenerated",
    "systemLabel",
    "description",
];

/// Rank assigned by sorting a filtered result.
pub const ORDER_IN_FILTERED_RESULT: &str = "orderInFilteredResult";

impl ResourceRecord {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            id: String::new(),
            uid: String::new(),
            name: name.into(),
            kind,
            connection_name: String::new(),
            csp: CspIdentity::default(),
            associated_object_list: Vec::new(),
            is_auto_generated: false,
            system_label: String::new(),
            description: String::new(),
            payload: Map::new(),
        }
    }

    /// Builder-style payload setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.payload.insert(key.to_string(), value.into());
    }

    /// Look up an attribute by its JSON name, covering both typed and payload fields.
    pub fn attr(&self, field: &str) -> Option<Value> {
        match field {
            "namespace" => Some(Value::String(self.namespace.clone())),
            "id" => Some(Value::String(self.id.clone())),
            "uid" => Some(Value::String(self.uid.clone())),
            "name" => Some(Value::String(self.name.clone())),
            "resourceType" => Some(Value::String(self.kind.as_str().to_string())),
            "connectionName" => Some(Value::String(self.connection_name.clone())),
            "systemLabel" => Some(Value::String(self.system_label.clone())),
            "description" => Some(Value::String(self.description.clone())),
            "isAutoGenerated" => Some(Value::Bool(self.is_auto_generated)),
            _ => self.payload.get(field).cloned(),
        }
    }

    pub fn str_attr(&self, field: &str) -> Option<String> {
        match self.attr(field)? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Numeric view of an attribute; absent or non-numeric values read as zero.
    pub fn num_attr(&self, field: &str) -> f64 {
        match self.attr(field) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn order_in_filtered_result(&self) -> Option<u64> {
        self.payload.get(ORDER_IN_FILTERED_RESULT).and_then(|v| v.as_u64())
    }

    /// Drop payload keys that would shadow typed fields on serialization.
    pub fn strip_reserved_payload(&mut self) {
        for k in RESERVED_KEYS {
            self.payload.remove(*k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for k in ResourceKind::ALL {
            assert_eq!(k.as_str().parse::<ResourceKind>().unwrap(), k);
        }
        assert!("bogus".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn payload_is_flattened_next_to_common_fields() {
        let rec = ResourceRecord::new(ResourceKind::Spec, "t2-small")
            .with("vCPU", 2)
            .with("memoryGiB", 2.0);
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["resourceType"], "spec");
        assert_eq!(v["vCPU"], 2);
        assert_eq!(v["name"], "t2-small");
        let back: ResourceRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn num_attr_defaults_to_zero() {
        let rec = ResourceRecord::new(ResourceKind::Spec, "x").with("vCPU", "4");
        assert_eq!(rec.num_attr("vCPU"), 4.0);
        assert_eq!(rec.num_attr("memoryGiB"), 0.0);
    }
}
