//! Filter criteria and the per-kind field tables they compile against.
//!
//! A criteria object is sparse: each entry names a field and carries either a
//! substring to match (text fields) or a `{min, max}` bound (numeric fields).
//! Entries are ANDed. Empty strings and zero bounds impose no constraint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, NimbusResult};
use crate::{ResourceKind, ResourceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn text(name: &'static str) -> FieldSpec {
    FieldSpec { name, ty: FieldType::Text }
}

const fn num(name: &'static str) -> FieldSpec {
    FieldSpec { name, ty: FieldType::Numeric }
}

/// Fields every kind can be filtered on.
pub const COMMON_FIELDS: &[FieldSpec] = &[
    text("id"),
    text("name"),
    text("connectionName"),
    text("description"),
    text("systemLabel"),
];

pub const SPEC_FIELDS: &[FieldSpec] = &[
    text("id"),
    text("name"),
    text("connectionName"),
    text("description"),
    text("systemLabel"),
    text("providerName"),
    text("regionName"),
    text("cspSpecName"),
    text("infraType"),
    text("osType"),
    text("acceleratorModel"),
    text("acceleratorType"),
    text("evaluationStatus"),
    num("vCPU"),
    num("memoryGiB"),
    num("storageGiB"),
    num("maxTotalStorageTiB"),
    num("netBwGbps"),
    num("acceleratorCount"),
    num("acceleratorMemoryGB"),
    num("costPerHour"),
    num("evaluationScore01"),
    num("evaluationScore02"),
    num("evaluationScore03"),
    num("evaluationScore04"),
    num("evaluationScore05"),
    num("evaluationScore06"),
    num("evaluationScore07"),
    num("evaluationScore08"),
    num("evaluationScore09"),
    num("evaluationScore10"),
];

/// Fields a spec list may be ordered by.
pub const SPEC_SORT_FIELDS: &[&str] = &[
    "vCPU",
    "memoryGiB",
    "storageGiB",
    "evaluationScore01",
    "evaluationScore02",
    "evaluationScore03",
    "evaluationScore04",
    "evaluationScore05",
    "evaluationScore06",
    "evaluationScore07",
    "evaluationScore08",
    "evaluationScore09",
    "evaluationScore10",
];

pub fn fields_for(kind: ResourceKind) -> &'static [FieldSpec] {
    match kind {
        ResourceKind::Spec => SPEC_FIELDS,
        _ => COMMON_FIELDS,
    }
}

pub fn field(kind: ResourceKind, name: &str) -> Option<&'static FieldSpec> {
    fields_for(kind).iter().find(|f| f.name == name)
}

/// Resolve a field a list of `kind` can be sorted by.
pub fn sort_field(kind: ResourceKind, name: &str) -> NimbusResult<&'static str> {
    let allowed: &[&'static str] = match kind {
        ResourceKind::Spec => SPEC_SORT_FIELDS,
        _ => &[],
    };
    allowed
        .iter()
        .copied()
        .find(|f| *f == name)
        .ok_or_else(|| Error::invalid(format!("cannot order {} by '{}'", kind, name)))
}

/// Inclusive numeric bound. A zero end is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

impl Range {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_unbounded(&self) -> bool {
        self.min == 0.0 && self.max == 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Criterion {
    Contains(String),
    Range(Range),
}

impl Criterion {
    fn is_empty(&self) -> bool {
        match self {
            Criterion::Contains(s) => s.is_empty(),
            Criterion::Range(r) => r.is_unbounded(),
        }
    }
}

/// Sparse conjunction of criteria keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterCriteria(pub BTreeMap<String, Criterion>);

impl FilterCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(mut self, field: &str, needle: impl Into<String>) -> Self {
        self.0.insert(field.to_string(), Criterion::Contains(needle.into()));
        self
    }

    pub fn range(mut self, field: &str, min: f64, max: f64) -> Self {
        self.0.insert(field.to_string(), Criterion::Range(Range::new(min, max)));
        self
    }

    /// Translate into predicates checked against the field table of `kind`.
    pub fn compile(&self, kind: ResourceKind) -> NimbusResult<Vec<Predicate>> {
        let mut out = Vec::new();
        for (name, crit) in &self.0 {
            let spec = field(kind, name)
                .ok_or_else(|| Error::invalid(format!("unknown filter field '{}' for {}", name, kind)))?;
            if crit.is_empty() {
                continue;
            }
            match (spec.ty, crit) {
                (FieldType::Text, Criterion::Contains(s)) => {
                    out.push(Predicate::Like { field: spec.name, needle: s.clone() });
                }
                (FieldType::Numeric, Criterion::Range(r)) => {
                    if r.min != 0.0 {
                        out.push(Predicate::AtLeast { field: spec.name, value: r.min });
                    }
                    if r.max != 0.0 {
                        out.push(Predicate::AtMost { field: spec.name, value: r.max });
                    }
                }
                (FieldType::Text, _) => {
                    return Err(Error::invalid(format!("field '{}' expects a string", name)));
                }
                (FieldType::Numeric, _) => {
                    return Err(Error::invalid(format!("field '{}' expects a {{min, max}} range", name)));
                }
            }
        }
        Ok(out)
    }
}

/// One compiled constraint. Field names always come from a static table.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Case-insensitive substring match.
    Like { field: &'static str, needle: String },
    AtLeast { field: &'static str, value: f64 },
    AtMost { field: &'static str, value: f64 },
}

impl Predicate {
    pub fn field(&self) -> &'static str {
        match self {
            Predicate::Like { field, .. } | Predicate::AtLeast { field, .. } | Predicate::AtMost { field, .. } => {
                field
            }
        }
    }

    pub fn matches(&self, rec: &ResourceRecord) -> bool {
        match self {
            Predicate::Like { field, needle } => rec
                .str_attr(field)
                .map(|v| v.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
            Predicate::AtLeast { field, value } => rec.num_attr(field) >= *value,
            Predicate::AtMost { field, value } => rec.num_attr(field) <= *value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Only the exact words `ascending` and `descending` are accepted.
    pub fn parse(s: &str) -> NimbusResult<Self> {
        match s {
            "ascending" => Ok(SortDirection::Ascending),
            "descending" => Ok(SortDirection::Descending),
            other => Err(Error::invalid(format!(
                "direction must be 'ascending' or 'descending', got '{}'",
                other
            ))),
        }
    }
}
