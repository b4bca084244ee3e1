use std::collections::BTreeSet;
use std::time::Duration;

use imirror_core::MirrorRoot;

pub const DEFAULT_MIRROR_ROOT: &str = "index.docker.io/skhlimr";
pub const DEFAULT_EXCLUDED_NAMESPACE: &str = "kube-system";
pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CONFLICT_RETRIES: usize = 3;

/// Settings consumed by the reconciler and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mirror_root: MirrorRoot,
    pub excluded_namespaces: BTreeSet<String>,
    pub rollback_timeout: Duration,
    /// Reconciliations running at once.
    pub parallel: usize,
    /// Fresh fetch-and-retry rounds after a write conflict.
    pub conflict_retries: usize,
}

impl Config {
    pub fn new(mirror_root: MirrorRoot) -> Self {
        Self {
            mirror_root,
            excluded_namespaces: BTreeSet::from([DEFAULT_EXCLUDED_NAMESPACE.to_string()]),
            rollback_timeout: DEFAULT_ROLLBACK_TIMEOUT,
            parallel: 1,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn exclude_namespace(mut self, ns: impl Into<String>) -> Self {
        self.excluded_namespaces.insert(ns.into());
        self
    }

    pub fn is_excluded(&self, ns: &str) -> bool {
        self.excluded_namespaces.contains(ns)
    }
}
