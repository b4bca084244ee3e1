//! In-flight tracker: one rollback timer per rewritten workload.
//!
//! Each entry owns a timer task and the pre-mirror images to restore. Disarming
//! cancels the task; expiry removes the entry and hands its plan to the
//! rollback action. Both paths take the map lock and compare the entry token,
//! so exactly one of them acts on a given entry and a timer that lost to a
//! re-arm never fires its rollback. Re-arming folds the cancelled entry's plan
//! into the new one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use imirror_core::WorkloadIdentity;
use metrics::counter;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::engine::RollbackPlan;

/// Cancellation handle for an armed timer.
#[derive(Debug)]
struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug)]
struct Entry {
    token: u64,
    armed_at: Instant,
    plan: RollbackPlan,
    cancel: CancelHandle,
}

/// Returned by [`InFlightTracker::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmHandle {
    pub token: u64,
    pub armed_at: Instant,
    pub deadline: Instant,
}

type Entries = Arc<Mutex<HashMap<WorkloadIdentity, Entry>>>;

#[derive(Default)]
pub struct InFlightTracker {
    entries: Entries,
    next_token: AtomicU64,
}

fn lock(entries: &Mutex<HashMap<WorkloadIdentity, Entry>>) -> MutexGuard<'_, HashMap<WorkloadIdentity, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id` and call `rollback` with the pending plan unless `id` is
    /// disarmed within `timeout`. A previous entry for `id` is cancelled first;
    /// its rollback never runs but its plan is merged under `plan`.
    /// Must be called from within a tokio runtime.
    pub fn arm<R, F>(&self, id: WorkloadIdentity, timeout: Duration, plan: RollbackPlan, rollback: R) -> ArmHandle
    where
        R: FnOnce(RollbackPlan) -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let armed_at = Instant::now();
        let deadline = armed_at + timeout;
        let (tx, rx) = oneshot::channel::<()>();
        {
            let mut entries = lock(&self.entries);
            let plan = match entries.remove(&id) {
                Some(stale) => {
                    debug!(workload = %id, stale_token = stale.token, "re-arm cancels previous rollback timer");
                    stale.cancel.cancel();
                    stale.plan.merge(plan)
                }
                None => plan,
            };
            entries.insert(id.clone(), Entry { token, armed_at, plan, cancel: CancelHandle { tx: Some(tx) } });
        }

        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let owned = {
                        let mut map = lock(&entries);
                        match map.get(&id) {
                            Some(e) if e.token == token => map.remove(&id).map(|e| e.plan),
                            _ => None,
                        }
                    };
                    if let Some(plan) = owned {
                        counter!("rollback_total", 1u64);
                        info!(workload = %id, "timed out waiting for ready, rolling back");
                        rollback(plan).await;
                    }
                }
                _ = rx => {
                    debug!(workload = %id, token, "rollback timer cancelled");
                }
            }
        });

        ArmHandle { token, armed_at, deadline }
    }

    /// Cancel the timer for `id`. Returns whether an entry was armed.
    pub fn disarm(&self, id: &WorkloadIdentity) -> bool {
        let removed = lock(&self.entries).remove(id);
        match removed {
            Some(entry) => {
                debug!(workload = %id, armed_for = ?entry.armed_at.elapsed(), "disarmed");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, id: &WorkloadIdentity) -> bool {
        lock(&self.entries).contains_key(id)
    }

    pub fn armed_at(&self, id: &WorkloadIdentity) -> Option<Instant> {
        lock(&self.entries).get(id).map(|e| e.armed_at)
    }

    /// Images the rollback for `id` would restore.
    pub fn plan(&self, id: &WorkloadIdentity) -> Option<RollbackPlan> {
        lock(&self.entries).get(id).map(|e| e.plan.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
