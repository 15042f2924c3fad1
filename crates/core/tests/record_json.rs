#![forbid(unsafe_code)]

use nimbus_core::prelude::*;
use serde_json::json;

#[test]
fn record_serializes_as_one_flat_object() {
    let mut rec = ResourceRecord::new(ResourceKind::SecurityGroup, "sg01")
        .with("vNetId", "vnet01")
        .with("firewallRules", json!([{"fromPort": "22"}, {"fromPort": "443"}]));
    rec.namespace = "ns01".into();
    rec.id = "sg01".into();
    rec.csp = CspIdentity { name_id: "sg01".into(), system_id: "sg-0123".into() };

    let v = serde_json::to_value(&rec).unwrap();
    assert_eq!(v["resourceType"], "securityGroup");
    assert_eq!(v["csp"]["systemId"], "sg-0123");
    assert_eq!(v["vNetId"], "vnet01");
    assert_eq!(v["firewallRules"][1]["fromPort"], "443");
    assert!(v.get("uid").is_none());
    assert!(v.get("payload").is_none());

    let back: ResourceRecord = serde_json::from_value(v).unwrap();
    assert_eq!(back, rec);
}

#[test]
fn sparse_stored_json_reads_with_defaults() {
    let raw = json!({
        "namespace": "ns01",
        "id": "aws-t3-small",
        "name": "aws-t3-small",
        "resourceType": "spec",
        "vCPU": "2",
        "memoryGiB": 2.0
    });
    let rec: ResourceRecord = serde_json::from_value(raw).unwrap();
    assert_eq!(rec.kind, ResourceKind::Spec);
    assert!(rec.connection_name.is_empty());
    assert_eq!(rec.num_attr("vCPU"), 2.0);
    assert_eq!(rec.num_attr("costPerHour"), 0.0);
}

#[test]
fn errors_carry_their_context() {
    let e = Error::already_exists("ns01", ResourceKind::Spec, "s1");
    assert_eq!(e.to_string(), "already exists: ns01/spec/s1");

    let d: Error = DriverError::Status { status: 500, body: "boom".into() }.into();
    assert!(d.to_string().contains("boom"));
    let wire = serde_json::to_string(&d).unwrap();
    assert_eq!(serde_json::from_str::<Error>(&wire).unwrap(), d);
}
