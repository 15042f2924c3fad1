//! Nimbus canonical store: an ordered key-value abstraction with prefix scans,
//! change watches and session-scoped distributed locks.
//!
//! Values are opaque strings (JSON-encoded records). Two backends:
//! [`MemoryKv`] for tests and single-process use, and `EtcdKv` behind the
//! `etcd` feature for replicated deployments.

#![forbid(unsafe_code)]

use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

mod memory;
pub use memory::MemoryKv;

#[cfg(feature = "etcd")]
mod etcd;
#[cfg(feature = "etcd")]
pub use etcd::EtcdKv;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("kv backend: {0}")]
    Backend(String),
    #[error("timed out acquiring lock {0}")]
    LockTimeout(String),
    #[error("session {0} expired or closed")]
    SessionExpired(i64),
}

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortTarget {
    Key,
    Value,
    Create,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascend,
    Descend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub key: String,
    /// Empty for deletions.
    pub value: String,
}

/// Lease-backed session. Locks acquired under it die with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: i64,
    pub ttl: Duration,
}

/// Proof of a held lock; hand it back to [`KvStore::unlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub session: i64,
    /// Backend ownership key (etcd lock key, or the name itself in memory).
    pub owner_key: String,
}

/// Buffer size of a watch channel.
pub const WATCH_BUFFER: usize = 64;

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> KvResult<()>;

    /// Value at `key`, or [`KvError::NotFound`].
    async fn get(&self, key: &str) -> KvResult<String>;

    async fn get_kv(&self, key: &str) -> KvResult<KeyValue> {
        let value = self.get(key).await?;
        Ok(KeyValue { key: key.to_string(), value })
    }

    /// Key-ascending pairs under `prefix`.
    async fn get_kv_list(&self, prefix: &str) -> KvResult<Vec<KeyValue>> {
        self.get_sorted_kv_list(prefix, SortTarget::Key, SortOrder::Ascend).await
    }

    /// Key-ascending values under `prefix`.
    async fn get_list(&self, prefix: &str) -> KvResult<Vec<String>> {
        Ok(self.get_kv_list(prefix).await?.into_iter().map(|kv| kv.value).collect())
    }

    async fn get_sorted_kv_list(&self, prefix: &str, target: SortTarget, order: SortOrder)
        -> KvResult<Vec<KeyValue>>;

    /// Idempotent; deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Stream changes to `key` (or every key under it when `prefix`).
    /// Dropping the receiver ends the watch.
    async fn watch(&self, key: &str, prefix: bool) -> KvResult<mpsc::Receiver<WatchEvent>>;

    async fn new_session(&self, ttl: Duration) -> KvResult<Session>;

    async fn keep_alive(&self, session: &Session) -> KvResult<()>;

    /// Revokes the session and releases every lock held under it.
    async fn close_session(&self, session: Session) -> KvResult<()>;

    /// Block until `name` is held under `session`.
    async fn lock(&self, session: &Session, name: &str) -> KvResult<LockHandle>;

    async fn unlock(&self, handle: LockHandle) -> KvResult<()>;

    async fn lock_with_timeout(&self, session: &Session, name: &str, timeout: Duration) -> KvResult<LockHandle> {
        match tokio::time::timeout(timeout, self.lock(session, name)).await {
            Ok(res) => res,
            Err(_) => {
                counter!("kv_lock_timeout_total", 1u64);
                warn!(lock = %name, timeout_ms = %timeout.as_millis(), "kv: lock timed out");
                Err(KvError::LockTimeout(name.to_string()))
            }
        }
    }
}
