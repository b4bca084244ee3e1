//! Reconciliation engine: one observe-decide-act pass per workload event.

use std::sync::Arc;
use std::time::Instant;

use imirror_core::{ContainerSpec, StoreError, Workload, WorkloadIdentity, WorkloadStore};
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::batch::{resolve_all, ImageChange};
use crate::config::Config;
use crate::mirror::Mirror;
use crate::tracker::InFlightTracker;

/// Terminal state of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Excluded,
    NotFound,
    /// Opted out or previously rolled back.
    Skipped,
    /// Ready while in flight: the rewrite held and the timer was disarmed.
    Stabilized,
    Unchanged,
    Updated,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("fetch {id}: {source}")]
    Fetch {
        id: WorkloadIdentity,
        #[source]
        source: StoreError,
    },
    #[error("update {id}: {source}")]
    Update {
        id: WorkloadIdentity,
        #[source]
        source: StoreError,
    },
    #[error("write conflict on {id} after {attempts} attempts")]
    WriteConflict { id: WorkloadIdentity, attempts: usize },
}

/// Pre-mirror images captured when a rewrite is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackPlan {
    pub init_containers: Vec<ImageChange>,
    pub containers: Vec<ImageChange>,
}

impl RollbackPlan {
    /// Restore every container still running the image we wrote. Returns the
    /// number of containers reverted.
    pub fn apply(&self, workload: &mut Workload) -> usize {
        fn revert(containers: &mut [ContainerSpec], changes: &[ImageChange]) -> usize {
            let mut n = 0;
            for change in changes {
                if let Some(c) = containers.iter_mut().find(|c| c.name == change.container && c.image == change.to) {
                    c.image = change.from.clone();
                    n += 1;
                }
            }
            n
        }
        revert(&mut workload.init_containers, &self.init_containers) + revert(&mut workload.containers, &self.containers)
    }

    /// Fold a later rewrite of the same workload into this plan. A change that
    /// starts from the image we wrote keeps the earlier pre-mirror image; a
    /// container edited by someone else in between takes the later change.
    pub fn merge(mut self, later: RollbackPlan) -> RollbackPlan {
        fn fold(earlier: &mut Vec<ImageChange>, later: Vec<ImageChange>) {
            for change in later {
                match earlier.iter_mut().find(|c| c.container == change.container) {
                    Some(c) if c.to == change.from => c.to = change.to,
                    Some(c) => *c = change,
                    None => earlier.push(change),
                }
            }
        }
        fold(&mut self.init_containers, later.init_containers);
        fold(&mut self.containers, later.containers);
        self
    }
}

pub struct Reconciler {
    config: Arc<Config>,
    store: Arc<dyn WorkloadStore>,
    mirror: Arc<Mirror>,
    tracker: Arc<InFlightTracker>,
}

impl Reconciler {
    pub fn new(config: Arc<Config>, store: Arc<dyn WorkloadStore>, mirror: Arc<Mirror>, tracker: Arc<InFlightTracker>) -> Self {
        Self { config, store, mirror, tracker }
    }

    pub fn tracker(&self) -> &Arc<InFlightTracker> {
        &self.tracker
    }

    /// Ensure every container image of `id` is served from the mirror.
    pub async fn reconcile(&self, id: &WorkloadIdentity) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        let res = self.reconcile_once(id).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn reconcile_once(&self, id: &WorkloadIdentity) -> Result<Outcome, ReconcileError> {
        info!(namespace = %id.namespace, name = %id.name, kind = %id.kind, "reconcile");

        if self.config.is_excluded(&id.namespace) {
            info!(namespace = %id.namespace, name = %id.name, "excluded namespace");
            return Ok(Outcome::Excluded);
        }

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            debug!(workload = %id, attempt, "get");
            let mut workload = match self.store.get(id).await {
                Ok(w) => w,
                Err(StoreError::NotFound(_)) => {
                    info!(workload = %id, "not found");
                    return Ok(Outcome::NotFound);
                }
                Err(e) => return Err(ReconcileError::Fetch { id: id.clone(), source: e }),
            };

            if workload.skip || workload.rolled_back {
                info!(workload = %id, skip = workload.skip, rolled_back = workload.rolled_back, "skipped by annotation");
                return Ok(Outcome::Skipped);
            }

            if workload.ready && self.tracker.disarm(id) {
                info!(workload = %id, "ready; mirrored images stabilized");
                return Ok(Outcome::Stabilized);
            }

            debug!(workload = %id, "ensuring");
            let (init, main) = futures::join!(
                resolve_all(&self.mirror, &mut workload.init_containers),
                resolve_all(&self.mirror, &mut workload.containers)
            );
            if !init.changed && !main.changed {
                info!(workload = %id, "no update needed");
                return Ok(Outcome::Unchanged);
            }

            debug!(workload = %id, "updating");
            match self.store.update(&workload).await {
                Ok(()) => {
                    let plan = RollbackPlan { init_containers: init.changes, containers: main.changes };
                    info!(workload = %id, rewritten = plan.init_containers.len() + plan.containers.len(), "workload updated");
                    self.arm_rollback(id.clone(), plan);
                    counter!("reconcile_updates_total", 1u64);
                    return Ok(Outcome::Updated);
                }
                Err(StoreError::Conflict(msg)) if attempt <= self.config.conflict_retries => {
                    counter!("reconcile_conflicts_total", 1u64);
                    warn!(workload = %id, attempt, reason = %msg, "write conflict; refetching");
                }
                Err(StoreError::Conflict(_)) => {
                    return Err(ReconcileError::WriteConflict { id: id.clone(), attempts: attempt });
                }
                Err(StoreError::NotFound(_)) => {
                    info!(workload = %id, "deleted before update");
                    return Ok(Outcome::NotFound);
                }
                Err(e) => return Err(ReconcileError::Update { id: id.clone(), source: e }),
            }
        }
    }

    fn arm_rollback(&self, id: WorkloadIdentity, plan: RollbackPlan) {
        let store = Arc::clone(&self.store);
        let retries = self.config.conflict_retries;
        let key = id.clone();
        self.tracker.arm(key, self.config.rollback_timeout, plan, move |plan| async move {
            rollback(store.as_ref(), &id, &plan, retries).await;
        });
    }
}

/// Re-fetch `id`, restore its pre-mirror images and mark it rolled back.
/// Failures are logged; there is nothing left to retry once the timer fired.
pub async fn rollback(store: &dyn WorkloadStore, id: &WorkloadIdentity, plan: &RollbackPlan, conflict_retries: usize) {
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let mut workload = match store.get(id).await {
            Ok(w) => w,
            Err(StoreError::NotFound(_)) => {
                warn!(workload = %id, "workload vanished before rollback");
                return;
            }
            Err(e) => {
                error!(workload = %id, error = %e, "rollback fetch failed");
                return;
            }
        };

        let reverted = plan.apply(&mut workload);
        if reverted == 0 {
            info!(workload = %id, "images changed since rewrite; nothing to roll back");
            return;
        }
        workload.rolled_back = true;

        match store.update(&workload).await {
            Ok(()) => {
                info!(workload = %id, reverted, "rolled back to pre-mirror images");
                return;
            }
            Err(StoreError::Conflict(msg)) if attempt <= conflict_retries => {
                warn!(workload = %id, attempt, reason = %msg, "rollback write conflict; refetching");
            }
            Err(e) => {
                counter!("rollback_errors_total", 1u64);
                error!(workload = %id, error = %e, "rollback failed");
                return;
            }
        }
    }
}
