//! etcd backend. One connected client is cloned per call (the client is a
//! cheap handle over a shared channel). Sessions are leases kept alive by a
//! background task; locks go through etcd's lock service.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use etcd_client::{Client, ConnectOptions, EventType, GetOptions, LockOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{KeyValue, KvError, KvResult, KvStore, LockHandle, Session, SortOrder, SortTarget, WatchEvent, WatchKind, WATCH_BUFFER};

impl From<etcd_client::Error> for KvError {
    fn from(e: etcd_client::Error) -> Self {
        KvError::Backend(e.to_string())
    }
}

pub struct EtcdKv {
    client: Client,
    keepers: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl EtcdKv {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> KvResult<Self> {
        let t0 = Instant::now();
        let opts = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(opts)).await?;
        info!(endpoints = ?endpoints, took_ms = %t0.elapsed().as_millis(), "kv: etcd connected");
        Ok(Self { client, keepers: Mutex::new(HashMap::new()) })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }

    fn keepers(&self) -> KvResult<std::sync::MutexGuard<'_, HashMap<i64, JoinHandle<()>>>> {
        self.keepers.lock().map_err(|_| KvError::Backend("keeper map poisoned".into()))
    }
}

fn text(bytes: &[u8]) -> KvResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| KvError::Backend(format!("non utf-8 value: {}", e)))
}

#[async_trait::async_trait]
impl KvStore for EtcdKv {
    async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        self.client().put(key, value, None).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<String> {
        let resp = self.client().get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => text(kv.value()),
            None => Err(KvError::NotFound(key.to_string())),
        }
    }

    async fn get_sorted_kv_list(&self, prefix: &str, target: SortTarget, order: SortOrder)
        -> KvResult<Vec<KeyValue>> {
        let target = match target {
            SortTarget::Key => etcd_client::SortTarget::Key,
            SortTarget::Value => etcd_client::SortTarget::Value,
            SortTarget::Create => etcd_client::SortTarget::Create,
            SortTarget::Modify => etcd_client::SortTarget::Mod,
        };
        let order = match order {
            SortOrder::Ascend => etcd_client::SortOrder::Ascend,
            SortOrder::Descend => etcd_client::SortOrder::Descend,
        };
        let opts = GetOptions::new().with_prefix().with_sort(target, order);
        let resp = self.client().get(prefix, Some(opts)).await?;
        resp.kvs()
            .iter()
            .map(|kv| Ok(KeyValue { key: text(kv.key())?, value: text(kv.value())? }))
            .collect()
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.client().delete(key, None).await?;
        Ok(())
    }

    async fn watch(&self, key: &str, prefix: bool) -> KvResult<mpsc::Receiver<WatchEvent>> {
        let opts = if prefix { Some(WatchOptions::new().with_prefix()) } else { None };
        let (mut watcher, mut stream) = self.client().watch(key, opts).await?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let key = key.to_string();
        tokio::spawn(async move {
            'outer: loop {
                let resp = match stream.message().await {
                    Ok(Some(r)) => r,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(key = %key, error = %e, "kv: etcd watch failed");
                        break;
                    }
                };
                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let kind = match ev.event_type() {
                        EventType::Put => WatchKind::Put,
                        EventType::Delete => WatchKind::Delete,
                    };
                    let out = WatchEvent {
                        kind,
                        key: String::from_utf8_lossy(kv.key()).into_owned(),
                        value: String::from_utf8_lossy(kv.value()).into_owned(),
                    };
                    if tx.send(out).await.is_err() {
                        break 'outer;
                    }
                }
            }
            let _ = watcher.cancel().await;
            debug!(key = %key, "kv: watch ended");
        });
        Ok(rx)
    }

    async fn new_session(&self, ttl: Duration) -> KvResult<Session> {
        let mut c = self.client();
        let secs = ttl.as_secs().max(1) as i64;
        let id = c.lease_grant(secs, None).await?.id();
        let (mut keeper, mut responses) = c.lease_keep_alive(id).await?;
        let every = Duration::from_millis((ttl.as_millis() as u64 / 3).max(200));
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease = id, error = %e, "kv: lease keep-alive failed");
                    break;
                }
                match responses.message().await {
                    Ok(Some(r)) if r.ttl() > 0 => {}
                    _ => {
                        warn!(lease = id, "kv: lease lapsed");
                        break;
                    }
                }
            }
        });
        self.keepers()?.insert(id, task);
        debug!(session = id, ttl_secs = secs, "kv: session opened");
        Ok(Session { id, ttl })
    }

    async fn keep_alive(&self, session: &Session) -> KvResult<()> {
        let (mut keeper, mut responses) = self.client().lease_keep_alive(session.id).await?;
        keeper.keep_alive().await?;
        match responses.message().await? {
            Some(r) if r.ttl() > 0 => Ok(()),
            _ => Err(KvError::SessionExpired(session.id)),
        }
    }

    async fn close_session(&self, session: Session) -> KvResult<()> {
        let task = self.keepers()?.remove(&session.id);
        if let Some(task) = task {
            task.abort();
        }
        self.client().lease_revoke(session.id).await?;
        debug!(session = session.id, "kv: session closed");
        Ok(())
    }

    async fn lock(&self, session: &Session, name: &str) -> KvResult<LockHandle> {
        let t0 = Instant::now();
        let resp = self.client().lock(name, Some(LockOptions::new().with_lease(session.id))).await?;
        let owner_key = text(resp.key())?;
        info!(lock = %name, session = session.id, waited_ms = %t0.elapsed().as_millis(), "kv: lock acquired");
        Ok(LockHandle { name: name.to_string(), session: session.id, owner_key })
    }

    async fn unlock(&self, handle: LockHandle) -> KvResult<()> {
        self.client().unlock(handle.owner_key.as_str()).await?;
        debug!(lock = %handle.name, session = handle.session, "kv: lock released");
        Ok(())
    }
}
