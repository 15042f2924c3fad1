//! Nimbus resource registry.
//!
//! The KV store holds the authoritative record under `<ns>/<kind>/<id>`; the
//! mirror is a derived projection used for filtering. A mirror write that
//! fails after a successful canonical write is not rolled back: it is logged,
//! counted, and repaired by the next write or by [`Registry::rebuild_mirror`].
//!
//! `create` is check-then-put and therefore racy across instances. Callers
//! that need strict exclusivity use [`Registry::create_exclusive`].

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use nimbus_core::identity::{check_string, kind_prefix, lock_key, resource_key, to_naming_rule_compatible};
use nimbus_core::{Error, FilterCriteria, NimbusResult, ResourceKind, ResourceRecord};
use nimbus_persist::Mirror;
use nimbus_store::{KvError, KvStore};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

mod query;
pub use query::sort_records;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(10);

pub(crate) fn kv_err(e: KvError) -> Error {
    match e {
        KvError::LockTimeout(key) => Error::LockTimeout { key },
        other => Error::Persistence(other.to_string()),
    }
}

pub(crate) fn mirror_err(e: anyhow::Error) -> Error {
    Error::Persistence(format!("{:#}", e))
}

#[derive(Clone)]
pub struct Registry {
    kv: Arc<dyn KvStore>,
    mirror: Arc<dyn Mirror>,
    lock_timeout: Duration,
    session_ttl: Duration,
}

impl Registry {
    pub fn new(kv: Arc<dyn KvStore>, mirror: Arc<dyn Mirror>) -> Self {
        Self { kv, mirror, lock_timeout: DEFAULT_LOCK_TIMEOUT, session_ttl: DEFAULT_SESSION_TTL }
    }

    pub fn with_lock_timeout(mut self, d: Duration) -> Self {
        self.lock_timeout = d;
        self
    }

    pub fn with_session_ttl(mut self, d: Duration) -> Self {
        self.session_ttl = d;
        self
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Fill in namespace, kind and the derived id, validating each.
    /// An explicit id must already follow the naming rule.
    fn prepare(namespace: &str, kind: ResourceKind, mut rec: ResourceRecord) -> NimbusResult<ResourceRecord> {
        check_string(namespace)?;
        if rec.name.trim().is_empty() {
            return Err(Error::invalid("name must not be empty"));
        }
        if rec.id.is_empty() {
            rec.id = to_naming_rule_compatible(&rec.name)?;
        } else {
            check_string(&rec.id)?;
        }
        rec.namespace = namespace.to_string();
        rec.kind = kind;
        rec.strip_reserved_payload();
        Ok(rec)
    }

    /// Canonical put followed by a best-effort mirror upsert.
    async fn write(&self, rec: &ResourceRecord) -> NimbusResult<()> {
        let key = resource_key(&rec.namespace, rec.kind, &rec.id);
        let body = serde_json::to_string(rec)?;
        self.kv.put(&key, &body).await.map_err(kv_err)?;
        if let Err(e) = self.mirror.upsert(rec) {
            counter!("registry_mirror_write_failed_total", 1u64);
            warn!(key = %key, error = %format!("{:#}", e), "registry: mirror write failed; canonical record kept");
        }
        Ok(())
    }

    pub async fn exists(&self, namespace: &str, kind: ResourceKind, id: &str) -> NimbusResult<bool> {
        check_string(namespace)?;
        match self.kv.get(&resource_key(namespace, kind, id)).await {
            Ok(_) => Ok(true),
            Err(KvError::NotFound(_)) => Ok(false),
            Err(e) => Err(kv_err(e)),
        }
    }

    /// Create-if-absent. Fails with `AlreadyExists` when the id is live.
    pub async fn create(&self, namespace: &str, kind: ResourceKind, rec: ResourceRecord) -> NimbusResult<ResourceRecord> {
        let t0 = Instant::now();
        let rec = Self::prepare(namespace, kind, rec)?;
        if self.exists(namespace, kind, &rec.id).await? {
            return Err(Error::already_exists(namespace, kind, &rec.id));
        }
        self.write(&rec).await?;
        counter!("registry_create_total", 1u64);
        info!(ns = %namespace, kind = %kind, id = %rec.id, took_ms = %t0.elapsed().as_millis(), "registry: create ok");
        Ok(rec)
    }

    /// Run `f` while holding the distributed lock `key` in a fresh session.
    /// The session is kept alive while `f` runs; the lock and its session are
    /// released on every exit path.
    async fn locked<T, F, Fut>(&self, key: &str, f: F) -> NimbusResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = NimbusResult<T>>,
    {
        let session = self.kv.new_session(self.session_ttl).await.map_err(kv_err)?;
        let handle = match self.kv.lock_with_timeout(&session, key, self.lock_timeout).await {
            Ok(h) => h,
            Err(e) => {
                if let Err(ce) = self.kv.close_session(session).await {
                    warn!(lock = %key, error = %ce, "registry: closing session failed");
                }
                return Err(kv_err(e));
            }
        };
        let fut = f();
        tokio::pin!(fut);
        let mut tick = tokio::time::interval((self.session_ttl / 3).max(Duration::from_millis(50)));
        tick.tick().await;
        let out = loop {
            tokio::select! {
                out = &mut fut => break out,
                _ = tick.tick() => {
                    if let Err(e) = self.kv.keep_alive(&session).await {
                        warn!(lock = %key, error = %e, "registry: lock session keep-alive failed");
                    }
                }
            }
        };
        if let Err(e) = self.kv.unlock(handle).await {
            warn!(lock = %key, error = %e, "registry: unlock failed");
        }
        if let Err(e) = self.kv.close_session(session).await {
            warn!(lock = %key, error = %e, "registry: closing session failed");
        }
        out
    }

    /// Run `f` under the distributed lock of one record.
    pub async fn with_record_lock<T, F, Fut>(&self, namespace: &str, kind: ResourceKind, id: &str, f: F) -> NimbusResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = NimbusResult<T>>,
    {
        check_string(namespace)?;
        self.locked(&lock_key(namespace, kind, id), f).await
    }

    /// [`Registry::create`] under the distributed lock for the record's key.
    pub async fn create_exclusive(
        &self,
        namespace: &str,
        kind: ResourceKind,
        rec: ResourceRecord,
    ) -> NimbusResult<ResourceRecord> {
        let rec = Self::prepare(namespace, kind, rec)?;
        let key = lock_key(namespace, kind, &rec.id);
        self.locked(&key, move || self.create(namespace, kind, rec)).await
    }

    /// Under the record's lock, apply `partial` only if `admit` accepts the
    /// current record. `Ok(None)` means the record was left as is.
    pub async fn update_if<P>(
        &self,
        namespace: &str,
        kind: ResourceKind,
        id: &str,
        admit: P,
        partial: &Map<String, Value>,
    ) -> NimbusResult<Option<ResourceRecord>>
    where
        P: FnOnce(&ResourceRecord) -> bool + Send,
    {
        let key = lock_key(namespace, kind, id);
        self.locked(&key, move || async move {
            let current = self.get(namespace, kind, id).await?;
            if !admit(&current) {
                return Ok(None);
            }
            let merged = merge_partial(&current, partial)?;
            self.write(&merged).await?;
            Ok(Some(merged))
        })
        .await
    }

    /// Write regardless of whether the id is live.
    pub async fn upsert(&self, namespace: &str, kind: ResourceKind, rec: ResourceRecord) -> NimbusResult<ResourceRecord> {
        let rec = Self::prepare(namespace, kind, rec)?;
        self.write(&rec).await?;
        info!(ns = %namespace, kind = %kind, id = %rec.id, "registry: upsert ok");
        Ok(rec)
    }

    pub async fn get(&self, namespace: &str, kind: ResourceKind, id: &str) -> NimbusResult<ResourceRecord> {
        check_string(namespace)?;
        match self.kv.get(&resource_key(namespace, kind, id)).await {
            Ok(body) => Ok(serde_json::from_str(&body)?),
            Err(KvError::NotFound(_)) => Err(Error::not_found(namespace, kind, id)),
            Err(e) => Err(kv_err(e)),
        }
    }

    /// Every record of `kind` in the namespace, key-ascending.
    pub async fn list(&self, namespace: &str, kind: ResourceKind) -> NimbusResult<Vec<ResourceRecord>> {
        check_string(namespace)?;
        let values = self.kv.get_list(&kind_prefix(namespace, kind)).await.map_err(kv_err)?;
        let mut out = Vec::with_capacity(values.len());
        for v in values {
            out.push(serde_json::from_str::<ResourceRecord>(&v)?);
        }
        Ok(out)
    }

    pub async fn list_ids(&self, namespace: &str, kind: ResourceKind) -> NimbusResult<Vec<String>> {
        check_string(namespace)?;
        let prefix = kind_prefix(namespace, kind);
        let kvs = self.kv.get_kv_list(&prefix).await.map_err(kv_err)?;
        Ok(kvs.into_iter().filter_map(|kv| kv.key.strip_prefix(&prefix).map(str::to_string)).collect())
    }

    /// Merge `partial` onto the stored record. Keys absent from `partial` keep
    /// their prior value; keys present overwrite, including with empty values.
    pub async fn update(
        &self,
        namespace: &str,
        kind: ResourceKind,
        id: &str,
        partial: &Map<String, Value>,
    ) -> NimbusResult<ResourceRecord> {
        let current = self.get(namespace, kind, id).await?;
        let merged = merge_partial(&current, partial)?;
        self.write(&merged).await?;
        info!(ns = %namespace, kind = %kind, id = %id, fields = partial.len(), "registry: update ok");
        Ok(merged)
    }

    pub async fn delete(&self, namespace: &str, kind: ResourceKind, id: &str) -> NimbusResult<()> {
        if !self.exists(namespace, kind, id).await? {
            return Err(Error::not_found(namespace, kind, id));
        }
        self.kv.delete(&resource_key(namespace, kind, id)).await.map_err(kv_err)?;
        if let Err(e) = self.mirror.delete(namespace, kind, id) {
            counter!("registry_mirror_write_failed_total", 1u64);
            warn!(ns = %namespace, kind = %kind, id = %id, error = %format!("{:#}", e), "registry: mirror delete failed");
        }
        info!(ns = %namespace, kind = %kind, id = %id, "registry: delete ok");
        Ok(())
    }

    /// Conjunctive filter over the mirror. Empty or zero criteria match everything.
    pub async fn filter_by_range(
        &self,
        namespace: &str,
        kind: ResourceKind,
        criteria: &FilterCriteria,
    ) -> NimbusResult<Vec<ResourceRecord>> {
        check_string(namespace)?;
        let preds = criteria.compile(kind)?;
        let t0 = Instant::now();
        let out = self.mirror.query(namespace, kind, &preds).map_err(mirror_err)?;
        debug!(ns = %namespace, kind = %kind, preds = preds.len(), hits = out.len(), took_ms = %t0.elapsed().as_millis(), "registry: filter");
        Ok(out)
    }

    pub fn sort(
        &self,
        kind: ResourceKind,
        list: Vec<ResourceRecord>,
        order_by: &str,
        direction: &str,
    ) -> NimbusResult<Vec<ResourceRecord>> {
        sort_records(kind, list, order_by, direction)
    }

    /// Replace the mirror rows of `(namespace, kind)` with the canonical records.
    pub async fn rebuild_mirror(&self, namespace: &str, kind: ResourceKind) -> NimbusResult<usize> {
        let t0 = Instant::now();
        let recs = self.list(namespace, kind).await?;
        let n = self.mirror.replace_all(namespace, kind, &recs).map_err(mirror_err)?;
        info!(ns = %namespace, kind = %kind, rows = n, took_ms = %t0.elapsed().as_millis(), "registry: mirror rebuilt");
        Ok(n)
    }
}

/// Shallow merge of top-level JSON keys. `namespace`, `id` and `resourceType`
/// may only be repeated with their current value.
pub fn merge_partial(current: &ResourceRecord, partial: &Map<String, Value>) -> NimbusResult<ResourceRecord> {
    for (field, now) in [
        ("namespace", current.namespace.as_str()),
        ("id", current.id.as_str()),
        ("resourceType", current.kind.as_str()),
    ] {
        if let Some(v) = partial.get(field) {
            if v.as_str() != Some(now) {
                return Err(Error::invalid(format!("field '{}' cannot be changed by an update", field)));
            }
        }
    }
    let mut body = match serde_json::to_value(current)? {
        Value::Object(m) => m,
        _ => return Err(Error::Persistence("stored record is not a JSON object".into())),
    };
    for (k, v) in partial {
        body.insert(k.clone(), v.clone());
    }
    Ok(serde_json::from_value(Value::Object(body))?)
}
