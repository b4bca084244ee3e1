//! imirror reconciliation: mirror resolver, container batch resolver,
//! in-flight tracker, the reconciliation engine and the watch dispatcher
//! that drives it.

#![forbid(unsafe_code)]

pub mod batch;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod mirror;
pub mod mock;
pub mod tracker;

pub use batch::{resolve_all, ImageChange, ReconciliationOutcome};
pub use config::Config;
pub use engine::{rollback, Outcome, ReconcileError, Reconciler, RollbackPlan};
pub use mirror::{Mirror, MirrorError};
pub use tracker::{ArmHandle, InFlightTracker};
