//! Bounded fan-out across a fleet.
//!
//! One task per admitted member, capped by a semaphore. Tasks report through
//! a channel drained by the initiating call, which returns only once every
//! launched task has finished. Tasks are detached: dropping the caller does not
//! interrupt members already launched. A member whose operation panics is
//! reported and marked like any other failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::counter;
use nimbus_core::{Error, NimbusResult, ResourceKind};
use nimbus_registry::Registry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::member::FleetMember;

pub const DEFAULT_CONCURRENCY: usize = 16;

/// Per-member status gating for operations that must not overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gate {
    /// Record field holding the status.
    pub field: String,
    /// Statuses that make a member ineligible.
    pub skip: Vec<String>,
    pub in_progress: String,
    pub success: String,
    pub failure: String,
}

impl Gate {
    fn admits(&self, status: &str) -> bool {
        !self.skip.iter().any(|s| s == status)
    }

    fn patch(&self, status: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert(self.field.clone(), Value::String(status.to_string()));
        m
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberOutcome {
    pub member_id: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MemberOutcome {
    fn from_result(m: &FleetMember, res: Result<Value, Error>) -> Self {
        match res {
            Ok(v) => Self { member_id: m.id.clone(), ip: m.public_ip.clone(), result: Some(v), error: None },
            Err(e) => Self { member_id: m.id.clone(), ip: m.public_ip.clone(), result: None, error: Some(e.to_string()) },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One entry per attempted member, in completion order. Members turned away
/// by gating are listed in `skipped` only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub entries: Vec<MemberOutcome>,
    #[serde(default)]
    pub skipped: Vec<String>,
}

impl AggregateResult {
    pub fn failures(&self) -> impl Iterator<Item = &MemberOutcome> {
        self.entries.iter().filter(|e| !e.is_ok())
    }

    pub fn entry(&self, member_id: &str) -> Option<&MemberOutcome> {
        self.entries.iter().find(|e| e.member_id == member_id)
    }
}

#[derive(Clone)]
pub struct FleetExecutor {
    registry: Registry,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl FleetExecutor {
    pub fn new(registry: Registry, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self { registry, permits: Arc::new(Semaphore::new(concurrency)), concurrency }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run `op` once per admitted member of `namespace` and collect every outcome.
    ///
    /// With a gate, each member is claimed under its record lock: members whose
    /// current status is in `gate.skip` are left alone, the rest get
    /// `gate.in_progress` before their task starts and `gate.success` or
    /// `gate.failure` after it ends. A member that cannot be claimed still
    /// yields a failure entry.
    pub async fn run<F, Fut>(
        &self,
        namespace: &str,
        members: Vec<FleetMember>,
        gate: Option<Gate>,
        op: F,
    ) -> NimbusResult<AggregateResult>
    where
        F: Fn(FleetMember) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        let t0 = Instant::now();
        let op = Arc::new(op);
        let gate = gate.map(Arc::new);
        let (tx, mut rx) = mpsc::channel::<MemberOutcome>(members.len().max(1));
        let mut out = AggregateResult::default();
        let mut launched = 0usize;

        for member in members {
            if let Some(g) = &gate {
                let admit_gate = g.clone();
                let claimed = self
                    .registry
                    .update_if(
                        namespace,
                        ResourceKind::Vm,
                        &member.id,
                        move |rec| admit_gate.admits(&rec.str_attr(&admit_gate.field).unwrap_or_default()),
                        &g.patch(&g.in_progress),
                    )
                    .await;
                match claimed {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        debug!(ns = %namespace, member = %member.id, "fleet: member busy; skipped");
                        out.skipped.push(member.id.clone());
                        continue;
                    }
                    Err(e) => {
                        counter!("fleet_member_failed_total", 1u64);
                        warn!(ns = %namespace, member = %member.id, error = %e, "fleet: claim failed");
                        out.entries.push(MemberOutcome::from_result(&member, Err(e)));
                        continue;
                    }
                }
            }

            let tx = tx.clone();
            let op = op.clone();
            let gate = gate.clone();
            let permits = self.permits.clone();
            let registry = self.registry.clone();
            let ns = namespace.to_string();
            launched += 1;
            tokio::spawn(async move {
                // Closed only if the executor is gone; run unbounded then.
                let _permit = permits.acquire_owned().await.ok();
                let res = match AssertUnwindSafe(async { op(member.clone()).await }).catch_unwind().await {
                    Ok(res) => res,
                    Err(payload) => Err(Error::Aborted(panic_message(payload.as_ref()))),
                };
                if let Err(e) = &res {
                    counter!("fleet_member_failed_total", 1u64);
                    warn!(ns = %ns, member = %member.id, error = %e, "fleet: member failed");
                }
                if let Some(g) = &gate {
                    let status = if res.is_ok() { &g.success } else { &g.failure };
                    if let Err(e) = registry.update(&ns, ResourceKind::Vm, &member.id, &g.patch(status)).await {
                        warn!(ns = %ns, member = %member.id, error = %e, "fleet: recording terminal status failed");
                    }
                }
                let _ = tx.send(MemberOutcome::from_result(&member, res)).await;
            });
        }
        drop(tx);

        while let Some(outcome) = rx.recv().await {
            out.entries.push(outcome);
        }
        info!(
            ns = %namespace,
            launched,
            skipped = out.skipped.len(),
            failed = out.failures().count(),
            took_ms = %t0.elapsed().as_millis(),
            "fleet: run complete"
        );
        Ok(out)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("member task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("member task panicked: {}", s)
    } else {
        "member task panicked".to_string()
    }
}
