//! In-memory collaborators for tests and local runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use imirror_core::{
    CredentialProvider, Credentials, ImageContent, ImageReference, ImageStore, StoreError, Workload, WorkloadIdentity, WorkloadKind,
    WorkloadStore,
};
use tokio::sync::mpsc;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct WorkloadState {
    workloads: BTreeMap<(WorkloadKind, String, String), Workload>,
    gets: usize,
    updates: Vec<Workload>,
    failing_gets: usize,
    conflicting_updates: usize,
    next_rv: u64,
}

impl WorkloadState {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

fn key(id: &WorkloadIdentity) -> (WorkloadKind, String, String) {
    (id.kind, id.namespace.clone(), id.name.clone())
}

/// Workload store with resourceVersion semantics: every write bumps the
/// version and writes carrying a stale one fail with `Conflict`.
#[derive(Default)]
pub struct MockWorkloadStore {
    state: Mutex<WorkloadState>,
}

impl MockWorkloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut workload: Workload) {
        let mut s = guard(&self.state);
        workload.resource_version = Some(s.bump());
        s.workloads.insert(key(&workload.identity), workload);
    }

    pub fn remove(&self, id: &WorkloadIdentity) -> Option<Workload> {
        guard(&self.state).workloads.remove(&key(id))
    }

    pub fn workload(&self, id: &WorkloadIdentity) -> Option<Workload> {
        guard(&self.state).workloads.get(&key(id)).cloned()
    }

    /// Simulate the status controller reporting rollout progress.
    pub fn set_ready(&self, id: &WorkloadIdentity, ready: bool) {
        let mut s = guard(&self.state);
        let rv = s.bump();
        if let Some(w) = s.workloads.get_mut(&key(id)) {
            w.ready = ready;
            w.resource_version = Some(rv);
        }
    }

    /// Simulate another writer changing a container image.
    pub fn set_image(&self, id: &WorkloadIdentity, container: &str, image: &str) {
        let mut s = guard(&self.state);
        let rv = s.bump();
        if let Some(w) = s.workloads.get_mut(&key(id)) {
            for c in w.init_containers.iter_mut().chain(w.containers.iter_mut()).filter(|c| c.name == container) {
                c.image = image.to_string();
            }
            w.resource_version = Some(rv);
        }
    }

    /// Fail the next `n` gets with a transport error.
    pub fn fail_next_gets(&self, n: usize) {
        guard(&self.state).failing_gets = n;
    }

    /// Make the next `n` updates lose a race against a concurrent writer.
    pub fn conflict_next_updates(&self, n: usize) {
        guard(&self.state).conflicting_updates = n;
    }

    pub fn gets(&self) -> usize {
        guard(&self.state).gets
    }

    /// Successful updates, in order.
    pub fn updates(&self) -> Vec<Workload> {
        guard(&self.state).updates.clone()
    }
}

#[async_trait::async_trait]
impl WorkloadStore for MockWorkloadStore {
    async fn get(&self, id: &WorkloadIdentity) -> Result<Workload, StoreError> {
        let mut s = guard(&self.state);
        s.gets += 1;
        if s.failing_gets > 0 {
            s.failing_gets -= 1;
            return Err(StoreError::Other(anyhow!("connection refused")));
        }
        s.workloads.get(&key(id)).cloned().ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(&self, workload: &Workload) -> Result<(), StoreError> {
        let mut s = guard(&self.state);
        let id = &workload.identity;
        if s.conflicting_updates > 0 {
            s.conflicting_updates -= 1;
            let rv = s.bump();
            if let Some(w) = s.workloads.get_mut(&key(id)) {
                w.resource_version = Some(rv);
            }
            return Err(StoreError::Conflict(format!("{} has been modified", id)));
        }
        let current_rv = match s.workloads.get(&key(id)) {
            Some(w) => w.resource_version.clone(),
            None => return Err(StoreError::NotFound(id.to_string())),
        };
        if workload.resource_version.is_some() && workload.resource_version != current_rv {
            return Err(StoreError::Conflict(format!("{} has been modified", id)));
        }
        let mut stored = workload.clone();
        stored.resource_version = Some(s.bump());
        s.updates.push(workload.clone());
        s.workloads.insert(key(id), stored);
        Ok(())
    }

    async fn watch(&self, kind: WorkloadKind, tx: mpsc::Sender<WorkloadIdentity>) -> anyhow::Result<()> {
        let ids: Vec<WorkloadIdentity> =
            guard(&self.state).workloads.values().filter(|w| w.identity.kind == kind).map(|w| w.identity.clone()).collect();
        for id in ids {
            if tx.send(id).await.is_err() {
                return Ok(());
            }
        }
        tx.closed().await;
        Ok(())
    }
}

#[derive(Default)]
struct ImageState {
    images: HashMap<String, ImageContent>,
    pulls: Vec<(String, Credentials)>,
    pushes: Vec<(String, Credentials)>,
    failing_pulls: HashSet<String>,
    failing_pushes: HashSet<String>,
    delays: HashMap<String, Duration>,
}

/// Registry pair where every source image exists unless marked failing.
/// References are keyed by their normalized string form.
#[derive(Default)]
pub struct MockImageStore {
    state: Mutex<ImageState>,
}

impl MockImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_pull(&self, reference: &str) {
        guard(&self.state).failing_pulls.insert(reference.to_string());
    }

    pub fn fail_push(&self, reference: &str) {
        guard(&self.state).failing_pushes.insert(reference.to_string());
    }

    pub fn delay_pull(&self, reference: &str, delay: Duration) {
        guard(&self.state).delays.insert(reference.to_string(), delay);
    }

    pub fn pulls(&self) -> Vec<(String, Credentials)> {
        guard(&self.state).pulls.clone()
    }

    pub fn pushes(&self) -> Vec<(String, Credentials)> {
        guard(&self.state).pushes.clone()
    }

    pub fn contains(&self, reference: &str) -> bool {
        guard(&self.state).images.contains_key(reference)
    }
}

#[async_trait::async_trait]
impl ImageStore for MockImageStore {
    async fn pull(&self, reference: &ImageReference, auth: &Credentials) -> anyhow::Result<ImageContent> {
        let r = reference.to_string();
        let (delay, failing) = {
            let mut s = guard(&self.state);
            s.pulls.push((r.clone(), auth.clone()));
            (s.delays.get(&r).copied(), s.failing_pulls.contains(&r))
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if failing {
            return Err(anyhow!("manifest unknown: {}", r));
        }
        Ok(ImageContent { digest: Some(format!("digest-of-{}", r)), ..Default::default() })
    }

    async fn push(&self, reference: &ImageReference, content: &ImageContent, auth: &Credentials) -> anyhow::Result<()> {
        let r = reference.to_string();
        let mut s = guard(&self.state);
        s.pushes.push((r.clone(), auth.clone()));
        if s.failing_pushes.contains(&r) {
            return Err(anyhow!("unauthorized: {}", r));
        }
        s.images.insert(r, content.clone());
        Ok(())
    }
}

/// Fixed push credentials with anonymous pulls.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    push: Credentials,
}

impl StaticCredentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: &str, password: &str) -> Self {
        Self { push: Credentials::Basic { username: username.to_string(), password: password.to_string() } }
    }
}

impl CredentialProvider for StaticCredentials {
    fn push_credentials(&self) -> Credentials {
        self.push.clone()
    }
}
