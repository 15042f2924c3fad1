#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nimbus_core::{Error, FilterCriteria, Predicate, ResourceKind, ResourceRecord};
use nimbus_persist::{Mirror, SqliteMirror};
use nimbus_registry::Registry;
use nimbus_store::{KvError, KvStore, MemoryKv};
use serde_json::{json, Map, Value};

fn registry() -> Registry {
    Registry::new(Arc::new(MemoryKv::new()), Arc::new(SqliteMirror::open_in_memory().unwrap()))
}

fn partial(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

fn spec(name: &str, vcpu: u64) -> ResourceRecord {
    ResourceRecord::new(ResourceKind::Spec, name).with("vCPU", vcpu).with("providerName", "aws")
}

/// Mirror that refuses every write.
struct BrokenMirror {
    attempts: AtomicUsize,
}

impl Mirror for BrokenMirror {
    fn upsert(&self, _rec: &ResourceRecord) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("disk full")
    }
    fn delete(&self, _: &str, _: ResourceKind, _: &str) -> anyhow::Result<bool> {
        anyhow::bail!("disk full")
    }
    fn query(&self, _: &str, _: ResourceKind, _: &[Predicate]) -> anyhow::Result<Vec<ResourceRecord>> {
        anyhow::bail!("disk full")
    }
    fn replace_all(&self, _: &str, _: ResourceKind, _: &[ResourceRecord]) -> anyhow::Result<usize> {
        anyhow::bail!("disk full")
    }
}

#[tokio::test]
async fn second_create_is_already_exists_and_first_is_untouched() {
    let reg = registry();
    let first = reg.create("ns01", ResourceKind::Spec, spec("T2 Small", 2)).await.unwrap();
    assert_eq!(first.id, "t2-small");

    let err = reg.create("ns01", ResourceKind::Spec, spec("t2 SMALL", 64)).await.unwrap_err();
    assert_eq!(err, Error::already_exists("ns01", ResourceKind::Spec, "t2-small"));

    let stored = reg.get("ns01", ResourceKind::Spec, "t2-small").await.unwrap();
    assert_eq!(stored, first);
    assert_eq!(stored.num_attr("vCPU"), 2.0);
}

#[tokio::test]
async fn explicit_ids_must_follow_the_naming_rule() {
    let reg = registry();
    for bad in ["Hot Spec", "hot spec", "a/b", "Upper"] {
        let mut rec = spec("hot spec", 2);
        rec.id = bad.into();
        let err = reg.create("ns01", ResourceKind::Spec, rec).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{bad}: {err:?}");
    }
    assert!(reg.list_ids("ns01", ResourceKind::Spec).await.unwrap().is_empty());

    let mut rec = spec("Hot Spec", 2);
    rec.id = "hot-spec".into();
    reg.upsert("ns01", ResourceKind::Spec, rec).await.unwrap();
    let err = reg.create("ns01", ResourceKind::Spec, spec("HOT spec", 4)).await.unwrap_err();
    assert_eq!(err, Error::already_exists("ns01", ResourceKind::Spec, "hot-spec"));
}

#[tokio::test]
async fn invalid_namespace_is_rejected_before_any_write() {
    let reg = registry();
    let err = reg.create("NS 01", ResourceKind::Spec, spec("a", 1)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(reg.kv().get_list("").await.unwrap().is_empty());
}

#[tokio::test]
async fn round_trip_preserves_nested_lists_in_order() {
    let reg = registry();
    let rules = json!([
        {"FromPort": "22", "ToPort": "22", "IPProtocol": "tcp", "Direction": "inbound", "CIDR": "0.0.0.0/0"},
        {"FromPort": "1", "ToPort": "65535", "IPProtocol": "udp", "Direction": "inbound", "CIDR": "10.0.0.0/8"},
        {"FromPort": "-1", "ToPort": "-1", "IPProtocol": "icmp", "Direction": "outbound", "CIDR": "0.0.0.0/0"}
    ]);
    let mut rec = ResourceRecord::new(ResourceKind::SecurityGroup, "web-sg").with("firewallRules", rules.clone());
    rec.connection_name = "aws-ap-northeast-2".into();
    rec.associated_object_list = vec!["vm-2".into(), "vm-1".into()];
    rec.csp.name_id = "web-sg".into();
    rec.csp.system_id = "sg-0abc".into();

    let created = reg.create("ns01", ResourceKind::SecurityGroup, rec).await.unwrap();
    let got = reg.get("ns01", ResourceKind::SecurityGroup, "web-sg").await.unwrap();
    assert_eq!(got, created);
    assert_eq!(got.payload["firewallRules"], rules);
    assert_eq!(got.associated_object_list, vec!["vm-2", "vm-1"]);
}

#[tokio::test]
async fn partial_update_omit_keeps_and_zero_overwrites() {
    let reg = registry();
    let rec = spec("m5", 4).with("memoryGiB", 16.0).with("costPerHour", 0.2);
    reg.create("ns01", ResourceKind::Spec, rec).await.unwrap();

    let after = reg
        .update("ns01", ResourceKind::Spec, "m5", &partial(json!({"costPerHour": 0.25})))
        .await
        .unwrap();
    assert_eq!(after.num_attr("memoryGiB"), 16.0);
    assert_eq!(after.num_attr("costPerHour"), 0.25);

    let zeroed = reg.update("ns01", ResourceKind::Spec, "m5", &partial(json!({"memoryGiB": 0}))).await.unwrap();
    assert_eq!(zeroed.num_attr("memoryGiB"), 0.0);
    assert_eq!(zeroed.num_attr("vCPU"), 4.0);

    let stored = reg.get("ns01", ResourceKind::Spec, "m5").await.unwrap();
    assert_eq!(stored, zeroed);

    let err = reg.update("ns01", ResourceKind::Spec, "m5", &partial(json!({"id": "m6"}))).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = reg.update("ns01", ResourceKind::Spec, "nope", &partial(json!({}))).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn filter_by_range_selects_inclusive_subset() {
    let reg = registry();
    for (name, v) in [("a", 2), ("b", 4), ("c", 6), ("d", 8), ("e", 16)] {
        reg.create("ns01", ResourceKind::Spec, spec(name, v)).await.unwrap();
    }
    reg.create("ns02", ResourceKind::Spec, spec("other", 4)).await.unwrap();

    let all = reg.filter_by_range("ns01", ResourceKind::Spec, &FilterCriteria::new()).await.unwrap();
    assert_eq!(all.len(), 5);
    let zero = FilterCriteria::new().range("vCPU", 0.0, 0.0).contains("osType", "");
    assert_eq!(reg.filter_by_range("ns01", ResourceKind::Spec, &zero).await.unwrap().len(), 5);

    let mid = reg
        .filter_by_range("ns01", ResourceKind::Spec, &FilterCriteria::new().range("vCPU", 4.0, 8.0))
        .await
        .unwrap();
    let ids: Vec<&str> = mid.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c", "d"]);

    let sorted = reg.sort(ResourceKind::Spec, mid, "vCPU", "descending").unwrap();
    assert_eq!(sorted[0].id, "d");
    assert_eq!(sorted[0].order_in_filtered_result(), Some(1));
}

#[tokio::test]
async fn mirror_failure_keeps_canonical_record() {
    let mirror = Arc::new(BrokenMirror { attempts: AtomicUsize::new(0) });
    let reg = Registry::new(Arc::new(MemoryKv::new()), mirror.clone());

    let created = reg.create("ns01", ResourceKind::Spec, spec("a", 2)).await.unwrap();
    assert_eq!(mirror.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(reg.get("ns01", ResourceKind::Spec, "a").await.unwrap(), created);

    // filtering goes through the mirror and surfaces its failure
    let err = reg.filter_by_range("ns01", ResourceKind::Spec, &FilterCriteria::new()).await.unwrap_err();
    assert!(matches!(err, Error::Persistence(ref m) if m.contains("disk full")));

    // deletion still succeeds on the canonical side
    reg.delete("ns01", ResourceKind::Spec, "a").await.unwrap();
    assert!(!reg.exists("ns01", ResourceKind::Spec, "a").await.unwrap());
}

#[tokio::test]
async fn rebuild_mirror_reconciles_with_canonical_store() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let mirror = Arc::new(SqliteMirror::open_in_memory().unwrap());
    let reg = Registry::new(kv.clone(), mirror.clone());
    reg.create("ns01", ResourceKind::Spec, spec("a", 2)).await.unwrap();
    reg.create("ns01", ResourceKind::Spec, spec("b", 4)).await.unwrap();

    // drift: a record written straight into the KV store, and a stale mirror row
    let c = Registry::new(kv.clone(), Arc::new(BrokenMirror { attempts: AtomicUsize::new(0) }));
    c.create("ns01", ResourceKind::Spec, spec("c", 8)).await.unwrap();
    let mut ghost = spec("ghost", 1);
    ghost.namespace = "ns01".into();
    ghost.id = "ghost".into();
    mirror.upsert(&ghost).unwrap();

    assert_eq!(reg.rebuild_mirror("ns01", ResourceKind::Spec).await.unwrap(), 3);
    let ids: Vec<String> = reg
        .filter_by_range("ns01", ResourceKind::Spec, &FilterCriteria::new())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(reg.list_ids("ns01", ResourceKind::Spec).await.unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn delete_removes_the_mirror_row() {
    let reg = registry();
    for (name, v) in [("a", 2), ("b", 4), ("c", 8)] {
        reg.create("ns01", ResourceKind::Spec, spec(name, v)).await.unwrap();
    }

    reg.delete("ns01", ResourceKind::Spec, "b").await.unwrap();
    let ids: Vec<String> = reg
        .filter_by_range("ns01", ResourceKind::Spec, &FilterCriteria::new().range("vCPU", 1.0, 16.0))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["a", "c"]);
    assert!(reg.get("ns01", ResourceKind::Spec, "b").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn delete_missing_is_not_found() {
    let reg = registry();
    let err = reg.delete("ns01", ResourceKind::Vm, "vm-1").await.unwrap_err();
    assert_eq!(err, Error::not_found("ns01", ResourceKind::Vm, "vm-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_create_admits_exactly_one_winner() {
    let reg = registry().with_lock_timeout(Duration::from_secs(5));
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let reg = reg.clone();
            tokio::spawn(async move { reg.create_exclusive("ns01", ResourceKind::Spec, spec("Hot Spec", i)).await })
        })
        .collect();
    let results = futures::future::join_all(tasks).await;
    let mut ok = 0;
    let mut dup = 0;
    for r in results {
        match r.unwrap() {
            Ok(_) => ok += 1,
            Err(Error::AlreadyExists { .. }) => dup += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((ok, dup), (1, 7));
}

#[tokio::test]
async fn exclusive_create_times_out_when_lock_is_held() {
    let kv = Arc::new(MemoryKv::new());
    let reg = Registry::new(kv.clone(), Arc::new(SqliteMirror::open_in_memory().unwrap()))
        .with_lock_timeout(Duration::from_millis(100));
    let holder = kv.new_session(Duration::from_secs(10)).await.unwrap();
    let _h = kv.lock(&holder, "lock/ns01/spec/busy").await.unwrap();

    let err = reg.create_exclusive("ns01", ResourceKind::Spec, spec("busy", 1)).await.unwrap_err();
    assert_eq!(err, Error::LockTimeout { key: "lock/ns01/spec/busy".into() });
    assert!(!reg.exists("ns01", ResourceKind::Spec, "busy").await.unwrap());
}

#[tokio::test]
async fn record_lock_outlives_the_session_ttl() {
    let kv = Arc::new(MemoryKv::new());
    let reg = Registry::new(kv.clone(), Arc::new(SqliteMirror::open_in_memory().unwrap()))
        .with_session_ttl(Duration::from_millis(300));

    let held = reg.with_record_lock("ns01", ResourceKind::Spec, "slow", || async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    });
    let contender = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let s = kv.new_session(Duration::from_secs(10)).await.unwrap();
        kv.lock_with_timeout(&s, "lock/ns01/spec/slow", Duration::from_millis(800)).await.map(|_| ())
    };
    let (held, contended) = tokio::join!(held, contender);
    held.unwrap();
    assert_eq!(contended, Err(KvError::LockTimeout("lock/ns01/spec/slow".into())));
}
