//! imirror core types: workloads, container specs and the collaborator seams
//! (workload store, image store, credentials) the reconciler is written against.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod reference;

pub use reference::{map, Identifier, ImageReference, MirrorRoot, ReferenceError};

/// Opt-out annotation: workloads carrying `"true"` are never rewritten.
pub const ANNOTATION_SKIP: &str = "imirror.dev/skip";
/// Written on rollback so the next pass leaves the restored images alone.
pub const ANNOTATION_ROLLED_BACK: &str = "imirror.dev/rolled-back";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 2] = [WorkloadKind::Deployment, WorkloadKind::DaemonSet];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::DaemonSet => "daemonset",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkloadIdentity {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
}

impl WorkloadIdentity {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), kind }
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self { name: name.into(), image: image.into() }
    }
}

/// The pod-template view of a Deployment or DaemonSet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workload {
    pub identity: WorkloadIdentity,
    /// Used as the precondition for updates.
    pub resource_version: Option<String>,
    /// Rollout finished for the current generation.
    pub ready: bool,
    /// Carries the opt-out annotation.
    pub skip: bool,
    pub rolled_back: bool,
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
}

impl Workload {
    pub fn new(identity: WorkloadIdentity) -> Self {
        Self {
            identity,
            resource_version: None,
            ready: false,
            skip: false,
            rolled_back: false,
            init_containers: Vec::new(),
            containers: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Fetch, update and watch workloads.
#[async_trait::async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn get(&self, id: &WorkloadIdentity) -> Result<Workload, StoreError>;

    /// Write container images (and the rolled-back marker) back. Fails with
    /// `StoreError::Conflict` when `resource_version` is stale.
    async fn update(&self, workload: &Workload) -> Result<(), StoreError>;

    /// Send the identity of every created or updated workload of `kind` until
    /// the stream ends or the receiver is dropped.
    async fn watch(&self, kind: WorkloadKind, tx: mpsc::Sender<WorkloadIdentity>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blob {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// Image as moved between registries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageContent {
    /// Manifest document as pulled, if the registry returned one.
    pub manifest: Option<serde_json::Value>,
    pub config: Blob,
    pub layers: Vec<Blob>,
    pub digest: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Basic { username, .. } => f.debug_struct("Basic").field("username", username).finish_non_exhaustive(),
        }
    }
}

/// Pull and push container images.
#[async_trait::async_trait]
pub trait ImageStore: Send + Sync {
    async fn pull(&self, reference: &ImageReference, auth: &Credentials) -> anyhow::Result<ImageContent>;
    async fn push(&self, reference: &ImageReference, content: &ImageContent, auth: &Credentials) -> anyhow::Result<()>;
}

pub trait CredentialProvider: Send + Sync {
    /// Credentials for writing into the mirror registry.
    fn push_credentials(&self) -> Credentials;

    /// Credentials for reading `source`; anonymous unless overridden.
    fn pull_credentials(&self, _source: &ImageReference) -> Credentials {
        Credentials::Anonymous
    }
}

pub mod prelude {
    pub use super::{
        ContainerSpec, CredentialProvider, Credentials, ImageContent, ImageReference, ImageStore, MirrorRoot, StoreError, Workload,
        WorkloadIdentity, WorkloadKind, WorkloadStore,
    };
}
