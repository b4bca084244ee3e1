//! Watch dispatcher: turns workload change events into reconciliation passes.
//!
//! One watcher task per workload kind feeds a shared queue. Each event gets
//! its own task, gated by a semaphore so at most `parallel` passes run at
//! once. Failed passes are re-queued with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use imirror_core::{WorkloadIdentity, WorkloadKind, WorkloadStore};
use metrics::counter;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::Reconciler;

const EVENT_BUFFER: usize = 256;
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(60);
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Retry {
    id: WorkloadIdentity,
    attempt: u32,
}

/// Delay before retry number `attempt` (0-based): 1s doubling up to 60s.
pub fn backoff(attempt: u32) -> Duration {
    RETRY_BASE.saturating_mul(1u32 << attempt.min(6)).min(RETRY_MAX)
}

/// Watch every workload kind and reconcile each event until `shutdown`
/// resolves. In-progress passes are abandoned on shutdown.
pub async fn run<S>(reconciler: Arc<Reconciler>, store: Arc<dyn WorkloadStore>, parallel: usize, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let parallel = parallel.max(1);
    let (event_tx, mut event_rx) = mpsc::channel::<WorkloadIdentity>(EVENT_BUFFER);
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<Retry>();

    let mut watchers = JoinSet::new();
    for kind in WorkloadKind::ALL {
        watchers.spawn(watch_kind(Arc::clone(&store), kind, event_tx.clone()));
    }
    drop(event_tx);

    let permits = Arc::new(Semaphore::new(parallel));
    let mut workers = JoinSet::new();
    info!(parallel, "dispatcher started");

    tokio::pin!(shutdown);
    loop {
        let (id, attempt) = tokio::select! {
            _ = &mut shutdown => {
                info!(in_flight = workers.len(), "shutdown requested; stopping dispatcher");
                break;
            }
            Some(id) = event_rx.recv() => (id, 0),
            Some(r) = retry_rx.recv() => (r.id, r.attempt),
            Some(joined) = workers.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "reconcile task panicked");
                    }
                }
                continue;
            }
        };

        let reconciler = Arc::clone(&reconciler);
        let permits = Arc::clone(&permits);
        let retry_tx = retry_tx.clone();
        workers.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else { return };
            match reconciler.reconcile(&id).await {
                Ok(outcome) => debug!(workload = %id, ?outcome, "reconciled"),
                Err(e) => {
                    counter!("reconcile_errors_total", 1u64);
                    let delay = backoff(attempt);
                    warn!(workload = %id, attempt, retry_in = ?delay, error = %e, "reconcile failed");
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = retry_tx.send(Retry { id, attempt: attempt.saturating_add(1) });
                    });
                }
            }
        });
    }

    watchers.abort_all();
    workers.abort_all();
    Ok(())
}

/// Keep a watch on `kind` open, restarting it whenever it ends, until the
/// dispatcher drops its receiver.
async fn watch_kind(store: Arc<dyn WorkloadStore>, kind: WorkloadKind, tx: mpsc::Sender<WorkloadIdentity>) {
    loop {
        info!(%kind, "watch: starting");
        match store.watch(kind, tx.clone()).await {
            Ok(()) => info!(%kind, "watch: stream ended"),
            Err(e) => warn!(%kind, error = %e, "watch: failed"),
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(WATCH_RESTART_DELAY).await;
    }
}
