//! Naming rules and storage keys.
//!
//! Every record lives under `<namespace>/<kind>/<id>` in the canonical store.
//! The id is derived from the caller-supplied name so that differently-cased
//! requests for the same name collide instead of producing duplicates.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, NimbusResult};
use crate::ResourceKind;

static NAMING_RULE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").ok());

/// Prefix under which distributed lock keys are kept, apart from records.
pub const LOCK_PREFIX: &str = "lock";

/// Validate a name that must already follow the naming rule (namespaces, explicit ids).
pub fn check_string(name: &str) -> NimbusResult<()> {
    if name.is_empty() {
        return Err(Error::invalid("name must not be empty"));
    }
    let ok = match NAMING_RULE.as_ref() {
        Some(re) => re.is_match(name),
        None => false,
    };
    if !ok {
        return Err(Error::invalid(format!(
            "'{}' must start with a lowercase letter and contain only lowercase letters, digits and '-'",
            name
        )));
    }
    Ok(())
}

/// Canonicalize a free-form name into a storage-safe id.
///
/// Lowercases, maps every character outside `[a-z0-9]` to `-`, collapses runs of
/// `-` and trims them from both ends.
pub fn to_naming_rule_compatible(name: &str) -> NimbusResult<String> {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars().flat_map(|c| c.to_lowercase()) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        return Err(Error::invalid(format!("name '{}' has no usable characters", name)));
    }
    Ok(out)
}

pub fn resource_key(namespace: &str, kind: ResourceKind, id: &str) -> String {
    format!("{}/{}/{}", namespace, kind, id)
}

/// Prefix covering every record of one kind in a namespace (trailing slash included).
pub fn kind_prefix(namespace: &str, kind: ResourceKind) -> String {
    format!("{}/{}/", namespace, kind)
}

pub fn lock_key(namespace: &str, kind: ResourceKind, id: &str) -> String {
    format!("{}/{}", LOCK_PREFIX, resource_key(namespace, kind, id))
}

/// Split a canonical key back into its parts.
pub fn parse_resource_key(key: &str) -> NimbusResult<(String, ResourceKind, String)> {
    let mut it = key.splitn(3, '/');
    match (it.next(), it.next(), it.next()) {
        (Some(ns), Some(kind), Some(id)) if !ns.is_empty() && !id.is_empty() => {
            Ok((ns.to_string(), kind.parse()?, id.to_string()))
        }
        _ => Err(Error::invalid(format!("malformed resource key: {}", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ids_collide_across_case() {
        assert_eq!(to_naming_rule_compatible("My_SG 01").unwrap(), "my-sg-01");
        assert_eq!(to_naming_rule_compatible("my-sg-01").unwrap(), "my-sg-01");
        assert_eq!(to_naming_rule_compatible("--A..b--").unwrap(), "a-b");
        assert!(to_naming_rule_compatible("___").is_err());
    }

    #[test]
    fn check_string_follows_rule() {
        assert!(check_string("ns01").is_ok());
        assert!(check_string("a").is_ok());
        assert!(check_string("01ns").is_err());
        assert!(check_string("ns-").is_err());
        assert!(check_string("NS").is_err());
        assert!(check_string("").is_err());
    }

    #[test]
    fn keys_round_trip() {
        let k = resource_key("ns01", ResourceKind::Spec, "aws-t2-small");
        assert_eq!(k, "ns01/spec/aws-t2-small");
        assert!(k.starts_with(&kind_prefix("ns01", ResourceKind::Spec)));
        let (ns, kind, id) = parse_resource_key(&k).unwrap();
        assert_eq!((ns.as_str(), kind, id.as_str()), ("ns01", ResourceKind::Spec, "aws-t2-small"));
        assert_eq!(lock_key("ns01", ResourceKind::Vm, "vm-1"), "lock/ns01/vm/vm-1");
        assert!(parse_resource_key("ns01/spec").is_err());
    }
}
