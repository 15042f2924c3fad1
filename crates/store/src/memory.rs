//! In-process backend. Linearizable by construction (one mutex), tracks
//! create/mod revisions like etcd, and expires sessions lazily.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

use crate::{
    KeyValue, KvError, KvResult, KvStore, LockHandle, Session, SortOrder, SortTarget, WatchEvent, WatchKind,
    WATCH_BUFFER,
};

/// Re-check interval for waiters, so holders whose lease lapsed get noticed.
const LOCK_POLL: Duration = Duration::from_millis(50);

struct Entry {
    value: String,
    create_rev: i64,
    mod_rev: i64,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    rev: i64,
    next_lease: i64,
    data: BTreeMap<String, Entry>,
    leases: HashMap<i64, Lease>,
    /// lock name -> owning lease
    locks: HashMap<String, i64>,
}

impl Inner {
    fn expire_leases(&mut self, now: Instant) {
        let dead: Vec<i64> = self.leases.iter().filter(|(_, l)| l.deadline <= now).map(|(id, _)| *id).collect();
        for id in dead {
            debug!(session = id, "kv: session lease expired");
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: i64) -> bool {
        let existed = self.leases.remove(&id).is_some();
        self.locks.retain(|_, owner| *owner != id);
        existed
    }
}

pub struct MemoryKv {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
    released: Notify,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { inner: Mutex::new(Inner::default()), events, released: Notify::new() }
    }

    fn guard(&self) -> KvResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| KvError::Backend("memory kv mutex poisoned".into()))
    }

    fn publish(&self, ev: WatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(ev);
    }

    fn try_acquire(&self, session: &Session, name: &str) -> KvResult<Option<LockHandle>> {
        let mut g = self.guard()?;
        g.expire_leases(Instant::now());
        if !g.leases.contains_key(&session.id) {
            return Err(KvError::SessionExpired(session.id));
        }
        match g.locks.get(name) {
            Some(owner) if *owner == session.id => {
                Err(KvError::Backend(format!("lock {} already held by session {}", name, session.id)))
            }
            Some(_) => Ok(None),
            None => {
                g.locks.insert(name.to_string(), session.id);
                Ok(Some(LockHandle { name: name.to_string(), session: session.id, owner_key: name.to_string() }))
            }
        }
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        {
            let mut g = self.guard()?;
            g.rev += 1;
            let rev = g.rev;
            match g.data.get_mut(key) {
                Some(e) => {
                    e.value = value.to_string();
                    e.mod_rev = rev;
                }
                None => {
                    g.data.insert(key.to_string(), Entry { value: value.to_string(), create_rev: rev, mod_rev: rev });
                }
            }
        }
        self.publish(WatchEvent { kind: WatchKind::Put, key: key.to_string(), value: value.to_string() });
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<String> {
        let g = self.guard()?;
        g.data.get(key).map(|e| e.value.clone()).ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    async fn get_sorted_kv_list(&self, prefix: &str, target: SortTarget, order: SortOrder)
        -> KvResult<Vec<KeyValue>> {
        let mut rows: Vec<(KeyValue, i64, i64)> = {
            let g = self.guard()?;
            g.data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, e)| (KeyValue { key: k.clone(), value: e.value.clone() }, e.create_rev, e.mod_rev))
                .collect()
        };
        match target {
            SortTarget::Key => rows.sort_by(|a, b| a.0.key.cmp(&b.0.key)),
            SortTarget::Value => rows.sort_by(|a, b| a.0.value.cmp(&b.0.value)),
            SortTarget::Create => rows.sort_by_key(|r| r.1),
            SortTarget::Modify => rows.sort_by_key(|r| r.2),
        }
        if order == SortOrder::Descend {
            rows.reverse();
        }
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let removed = {
            let mut g = self.guard()?;
            let removed = g.data.remove(key).is_some();
            if removed {
                g.rev += 1;
            }
            removed
        };
        if removed {
            self.publish(WatchEvent { kind: WatchKind::Delete, key: key.to_string(), value: String::new() });
        }
        Ok(())
    }

    async fn watch(&self, key: &str, prefix: bool) -> KvResult<mpsc::Receiver<WatchEvent>> {
        let mut sub = self.events.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let key = key.to_string();
        tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(ev) => {
                        let hit = if prefix { ev.key.starts_with(&key) } else { ev.key == key };
                        if hit && tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(key = %key, skipped = n, "kv: watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(key = %key, "kv: watch ended");
        });
        Ok(rx)
    }

    async fn new_session(&self, ttl: Duration) -> KvResult<Session> {
        let mut g = self.guard()?;
        g.next_lease += 1;
        let id = g.next_lease;
        g.leases.insert(id, Lease { ttl, deadline: Instant::now() + ttl });
        debug!(session = id, ttl_ms = %ttl.as_millis(), "kv: session opened");
        Ok(Session { id, ttl })
    }

    async fn keep_alive(&self, session: &Session) -> KvResult<()> {
        let mut g = self.guard()?;
        let now = Instant::now();
        g.expire_leases(now);
        match g.leases.get_mut(&session.id) {
            Some(l) => {
                l.deadline = now + l.ttl;
                Ok(())
            }
            None => Err(KvError::SessionExpired(session.id)),
        }
    }

    async fn close_session(&self, session: Session) -> KvResult<()> {
        let existed = self.guard()?.drop_lease(session.id);
        self.released.notify_waiters();
        debug!(session = session.id, existed, "kv: session closed");
        Ok(())
    }

    async fn lock(&self, session: &Session, name: &str) -> KvResult<LockHandle> {
        let t0 = Instant::now();
        loop {
            let notified = self.released.notified();
            if let Some(h) = self.try_acquire(session, name)? {
                info!(lock = %name, session = session.id, waited_ms = %t0.elapsed().as_millis(), "kv: lock acquired");
                return Ok(h);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(LOCK_POLL) => {}
            }
        }
    }

    async fn unlock(&self, handle: LockHandle) -> KvResult<()> {
        {
            let mut g = self.guard()?;
            if g.locks.get(&handle.owner_key) == Some(&handle.session) {
                g.locks.remove(&handle.owner_key);
            }
        }
        self.released.notify_waiters();
        debug!(lock = %handle.name, session = handle.session, "kv: lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("ns/vm/x").await, Err(KvError::NotFound("ns/vm/x".into())));
        kv.delete("ns/vm/x").await.unwrap();
    }

    #[tokio::test]
    async fn prefix_scan_does_not_leak_sibling_prefixes() {
        let kv = MemoryKv::new();
        kv.put("ns/spec/b", "2").await.unwrap();
        kv.put("ns/spec/a", "1").await.unwrap();
        kv.put("ns/specx/c", "3").await.unwrap();
        kv.put("ns/sshKey/k", "4").await.unwrap();
        assert_eq!(kv.get_list("ns/spec/").await.unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn lapsed_session_loses_its_lock() {
        let kv = MemoryKv::new();
        let short = kv.new_session(Duration::from_millis(30)).await.unwrap();
        let _held = kv.lock(&short, "lock/a").await.unwrap();
        let other = kv.new_session(Duration::from_secs(10)).await.unwrap();
        let h = kv.lock_with_timeout(&other, "lock/a", Duration::from_secs(2)).await.unwrap();
        assert_eq!(h.session, other.id);
        assert_eq!(kv.keep_alive(&short).await, Err(KvError::SessionExpired(short.id)));
    }
}
