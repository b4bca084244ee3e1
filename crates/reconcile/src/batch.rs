//! Container batch resolver.

use futures::future::join_all;
use imirror_core::ContainerSpec;
use metrics::counter;
use tracing::warn;

use crate::mirror::Mirror;

/// One container image rewritten by a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChange {
    pub container: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationOutcome {
    pub changed: bool,
    pub changes: Vec<ImageChange>,
}

/// Run `Mirror::ensure` for every container concurrently and rewrite the
/// images that moved. Failures are logged and leave their container alone.
/// Mutation happens only after every resolution has finished.
pub async fn resolve_all(mirror: &Mirror, containers: &mut [ContainerSpec]) -> ReconciliationOutcome {
    let results = join_all(containers.iter().map(|c| mirror.ensure(&c.image))).await;

    let mut outcome = ReconciliationOutcome::default();
    for (c, res) in containers.iter_mut().zip(results) {
        match res {
            Ok(image) if image != c.image => {
                outcome.changes.push(ImageChange { container: c.name.clone(), from: c.image.clone(), to: image.clone() });
                c.image = image;
            }
            Ok(_) => {}
            Err(e) => {
                // TODO: requeue the workload once this image's registry recovers instead of waiting for the next event
                counter!("mirror_errors_total", 1u64);
                warn!(container = %c.name, image = %c.image, error = %e, "ensure image in mirror registry");
            }
        }
    }
    outcome.changed = !outcome.changes.is_empty();
    outcome
}
