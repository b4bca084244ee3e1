//! imirror kubehub – Deployment/DaemonSet access and watcher wiring

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::{Context, Result};
use futures::StreamExt;
use imirror_core::{
    ContainerSpec, StoreError, Workload, WorkloadIdentity, WorkloadKind, WorkloadStore, ANNOTATION_ROLLED_BACK, ANNOTATION_SKIP,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "imirror";

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Workload store backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeWorkloadStore {
    client: Client,
}

impl KubeWorkloadStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    async fn patch<K>(&self, workload: &Workload) -> Result<(), StoreError>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let id = &workload.identity;
        let api: Api<K> = Api::namespaced(self.client.clone(), &id.namespace);
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        api.patch(&id.name, &pp, &Patch::Strategic(update_patch(workload)))
            .await
            .map(|_| ())
            .map_err(|e| store_error(e, id))
    }
}

#[async_trait::async_trait]
impl WorkloadStore for KubeWorkloadStore {
    async fn get(&self, id: &WorkloadIdentity) -> Result<Workload, StoreError> {
        match id.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &id.namespace);
                let obj = api.get(&id.name).await.map_err(|e| store_error(e, id))?;
                Ok(workload_from_deployment(id.clone(), &obj))
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &id.namespace);
                let obj = api.get(&id.name).await.map_err(|e| store_error(e, id))?;
                Ok(workload_from_daemonset(id.clone(), &obj))
            }
        }
    }

    async fn update(&self, workload: &Workload) -> Result<(), StoreError> {
        match workload.identity.kind {
            WorkloadKind::Deployment => self.patch::<Deployment>(workload).await,
            WorkloadKind::DaemonSet => self.patch::<DaemonSet>(workload).await,
        }
    }

    async fn watch(&self, kind: WorkloadKind, tx: mpsc::Sender<WorkloadIdentity>) -> Result<()> {
        match kind {
            WorkloadKind::Deployment => start_watcher(Api::<Deployment>::all(self.client.clone()), kind, tx).await,
            WorkloadKind::DaemonSet => start_watcher(Api::<DaemonSet>::all(self.client.clone()), kind, tx).await,
        }
    }
}

fn store_error(err: kube::Error, id: &WorkloadIdentity) -> StoreError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(id.to_string()),
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(format!("{}: {}", id, resp.message)),
        _ => StoreError::Other(anyhow::Error::new(err).context(format!("kube request for {}", id))),
    }
}

/// List+watch all objects of one kind and forward their identities.
async fn start_watcher<K>(api: Api<K>, kind: WorkloadKind, tx: mpsc::Sender<WorkloadIdentity>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, "watcher started");
    while let Some(ev) = stream.next().await {
        let objs = match ev {
            Ok(Event::Applied(o)) => vec![o],
            Ok(Event::Deleted(_)) => continue,
            Ok(Event::Restarted(list)) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                list
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "watch error; backing off");
                continue;
            }
        };
        for o in objs.iter() {
            let Some(namespace) = o.namespace() else { continue };
            counter!("kubehub_watch_events_total", 1u64);
            if tx.send(WorkloadIdentity::new(kind, namespace, o.name_any())).await.is_err() {
                info!(kind = %kind, "receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}

/// Rollout progress shared by Deployments and DaemonSets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Rollout {
    generation: i64,
    observed_generation: i64,
    desired: i32,
    updated: i32,
    available: i32,
    total: i32,
    ready_condition: bool,
}

impl Rollout {
    /// The controller has seen the latest spec and every replica runs it.
    fn ready(&self) -> bool {
        if self.observed_generation < self.generation {
            return false;
        }
        if self.ready_condition {
            return true;
        }
        self.updated >= self.desired && self.available >= self.desired && self.total <= self.updated
    }
}

fn condition_true<'a>(mut conditions: impl Iterator<Item = (&'a str, &'a str)>) -> bool {
    conditions.any(|(t, s)| t == "Ready" && s == "True")
}

fn containers_of(template: Option<&PodTemplateSpec>) -> (Vec<ContainerSpec>, Vec<ContainerSpec>) {
    fn convert(cs: &[Container]) -> Vec<ContainerSpec> {
        cs.iter().map(|c| ContainerSpec::new(c.name.clone(), c.image.clone().unwrap_or_default())).collect()
    }
    match template.and_then(|t| t.spec.as_ref()) {
        Some(spec) => (convert(spec.init_containers.as_deref().unwrap_or_default()), convert(&spec.containers)),
        None => (Vec::new(), Vec::new()),
    }
}

fn annotation_set(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    annotations.get(key).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn workload_from_parts<K: Resource>(id: WorkloadIdentity, obj: &K, template: Option<&PodTemplateSpec>, rollout: Rollout) -> Workload {
    let (init_containers, containers) = containers_of(template);
    let annotations = obj.meta().annotations.clone().unwrap_or_default();
    Workload {
        identity: id,
        resource_version: obj.meta().resource_version.clone(),
        ready: rollout.ready(),
        skip: annotation_set(&annotations, ANNOTATION_SKIP),
        rolled_back: annotation_set(&annotations, ANNOTATION_ROLLED_BACK),
        init_containers,
        containers,
    }
}

pub fn workload_from_deployment(id: WorkloadIdentity, d: &Deployment) -> Workload {
    let status = d.status.clone().unwrap_or_default();
    let rollout = Rollout {
        generation: d.metadata.generation.unwrap_or(0),
        observed_generation: status.observed_generation.unwrap_or(0),
        desired: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        updated: status.updated_replicas.unwrap_or(0),
        available: status.available_replicas.unwrap_or(0),
        total: status.replicas.unwrap_or(0),
        ready_condition: condition_true(status.conditions.iter().flatten().map(|c| (c.type_.as_str(), c.status.as_str()))),
    };
    workload_from_parts(id, d, d.spec.as_ref().map(|s| &s.template), rollout)
}

pub fn workload_from_daemonset(id: WorkloadIdentity, ds: &DaemonSet) -> Workload {
    let status = ds.status.clone().unwrap_or_default();
    let rollout = Rollout {
        generation: ds.metadata.generation.unwrap_or(0),
        observed_generation: status.observed_generation.unwrap_or(0),
        desired: status.desired_number_scheduled,
        updated: status.updated_number_scheduled.unwrap_or(0),
        available: status.number_available.unwrap_or(0),
        total: status.current_number_scheduled,
        ready_condition: condition_true(status.conditions.iter().flatten().map(|c| (c.type_.as_str(), c.status.as_str()))),
    };
    workload_from_parts(id, ds, ds.spec.as_ref().map(|s| &s.template), rollout)
}

/// Strategic-merge patch carrying only container images, keyed by container
/// name, with `metadata.resourceVersion` as the write precondition.
pub fn update_patch(workload: &Workload) -> Json {
    fn images(cs: &[ContainerSpec]) -> Json {
        Json::Array(cs.iter().map(|c| json!({ "name": c.name, "image": c.image })).collect())
    }
    let mut metadata = serde_json::Map::new();
    if let Some(rv) = &workload.resource_version {
        metadata.insert("resourceVersion".into(), Json::String(rv.clone()));
    }
    if workload.rolled_back {
        let mut annotations = serde_json::Map::new();
        annotations.insert(ANNOTATION_ROLLED_BACK.into(), Json::String("true".into()));
        metadata.insert("annotations".into(), Json::Object(annotations));
    }
    let mut pod_spec = serde_json::Map::new();
    pod_spec.insert("containers".into(), images(&workload.containers));
    if !workload.init_containers.is_empty() {
        pod_spec.insert("initContainers".into(), images(&workload.init_containers));
    }
    json!({
        "metadata": Json::Object(metadata),
        "spec": { "template": { "spec": Json::Object(pod_spec) } },
    })
}
