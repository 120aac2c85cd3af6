//! Kubernetes-backed event source and lister.
//!
//! One watch task runs per configured kind and namespace, translating raw
//! watch events into [`ClusterEvent`]s. Each task keeps a uid-indexed cache
//! of the objects it has seen so a modification can carry both the old and
//! the new snapshot. Missed deletions while disconnected are not recovered
//! here; the reconciler closes that gap.

use std::collections::HashMap;
use std::fmt::Debug;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt as _;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::{WatchStreamExt as _, watcher};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch as watch_ch};
use tokio::task::JoinHandle;

use crate::cluster::{ClusterEvent, ClusterLister, ClusterObject, Deletion, ResourceChange};
use crate::config::ResourceConfig;
use crate::error::Result;
use crate::metrics::Metrics;

/// Event source and lister over a shared kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    metrics: Metrics,
}

impl KubeCluster {
    /// Connect using the in-cluster or kubeconfig environment.
    pub async fn connect(metrics: Metrics) -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .context("creating kubernetes client")?;
        Ok(Self { client, metrics })
    }

    /// Spawn one watch task per kind and namespace, feeding `tx`. Tasks end
    /// when the shutdown channel flips or the receiver is dropped.
    pub fn spawn_watchers(
        &self,
        resources: &[ResourceConfig],
        tx: mpsc::Sender<ClusterEvent>,
        shutdown: watch_ch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for resource in resources {
            let namespaces: Vec<Option<String>> = if resource.namespaces.is_empty() {
                vec![None]
            } else {
                resource.namespaces.iter().cloned().map(Some).collect()
            };

            for namespace in namespaces {
                let kind = resource.kind.clone();
                let tx = tx.clone();
                let shutdown = shutdown.clone();
                let metrics = self.metrics.clone();

                if is_core_pod(resource) {
                    let api: Api<Pod> = match &namespace {
                        Some(ns) => Api::namespaced(self.client.clone(), ns),
                        None => Api::all(self.client.clone()),
                    };
                    handles.push(tokio::spawn(pump(
                        api,
                        kind,
                        ClusterObject::Pod,
                        tx,
                        shutdown,
                        metrics,
                    )));
                } else {
                    let api_resource = dynamic_api_resource(resource);
                    let api: Api<DynamicObject> = match &namespace {
                        Some(ns) => {
                            Api::namespaced_with(self.client.clone(), ns, &api_resource)
                        }
                        None => Api::all_with(self.client.clone(), &api_resource),
                    };
                    handles.push(tokio::spawn(pump(
                        api,
                        kind,
                        ClusterObject::Dynamic,
                        tx,
                        shutdown,
                        metrics,
                    )));
                }

                tracing::info!(
                    kind = %resource.kind,
                    api_version = %resource.api_version,
                    namespace = namespace.as_deref().unwrap_or("<all>"),
                    "watching resource"
                );
            }
        }

        handles
    }
}

/// Whether a configured resource is the canonical typed core/v1 Pod.
fn is_core_pod(resource: &ResourceConfig) -> bool {
    resource.api_version == "v1" && resource.kind == "Pod"
}

/// Build the dynamic API descriptor for a non-core resource.
fn dynamic_api_resource(resource: &ResourceConfig) -> ApiResource {
    let (group, version) = match resource.api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), resource.api_version.clone()),
    };
    let gvk = GroupVersionKind {
        group,
        version,
        kind: resource.kind.clone(),
    };
    ApiResource::from_gvk_with_plural(&gvk, &resource.plural())
}

/// Drive one watch stream until shutdown, translating events for the
/// observer. The cache keyed by uid supplies the old snapshot for
/// modifications; entries survive re-list cycles so a resync does not
/// masquerade as a fresh add.
async fn pump<K>(
    api: Api<K>,
    kind: String,
    into_object: impl Fn(K) -> ClusterObject,
    tx: mpsc::Sender<ClusterEvent>,
    mut shutdown: watch_ch::Receiver<bool>,
    metrics: Metrics,
) where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let mut cache: HashMap<String, ClusterObject> = HashMap::new();
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    if dispatch(event, &into_object, &kind, &mut cache, &tx).await.is_err() {
                        // Receiver dropped: the observer is gone.
                        break;
                    }
                }
                Some(Err(error)) => {
                    metrics.record_watch_reconnect(&kind);
                    tracing::warn!(%error, kind, "watch stream error, backing off");
                }
                None => break,
            },
        }
    }

    tracing::debug!(kind, "watch task stopped");
}

async fn dispatch<K>(
    event: watcher::Event<K>,
    into_object: &impl Fn(K) -> ClusterObject,
    kind: &str,
    cache: &mut HashMap<String, ClusterObject>,
    tx: &mpsc::Sender<ClusterEvent>,
) -> std::result::Result<(), mpsc::error::SendError<ClusterEvent>>
where
    K: Clone + Debug,
{
    match event {
        watcher::Event::Init | watcher::Event::InitDone => Ok(()),
        watcher::Event::InitApply(raw) | watcher::Event::Apply(raw) => {
            let object = into_object(raw);
            let Some(uid) = object.uid().map(str::to_owned) else {
                tracing::warn!(kind, "object without uid ignored");
                return Ok(());
            };

            let change = match cache.insert(uid, object.clone()) {
                Some(old) => ResourceChange::Modified {
                    old: Box::new(old),
                    new: Box::new(object),
                },
                None => ResourceChange::Added(object),
            };
            tx.send(ClusterEvent {
                kind: kind.to_string(),
                change,
            })
            .await
        }
        watcher::Event::Delete(raw) => {
            let object = into_object(raw);
            if let Some(uid) = object.uid() {
                cache.remove(uid);
            }
            tx.send(ClusterEvent {
                kind: kind.to_string(),
                change: ResourceChange::Deleted(Deletion::Confirmed(object)),
            })
            .await
        }
    }
}

#[async_trait]
impl ClusterLister for KubeCluster {
    async fn list(
        &self,
        resource: &ResourceConfig,
        namespace: Option<&str>,
    ) -> Result<Vec<ClusterObject>> {
        let params = ListParams::default();

        if is_core_pod(resource) {
            let api: Api<Pod> = match namespace {
                Some(ns) => Api::namespaced(self.client.clone(), ns),
                None => Api::all(self.client.clone()),
            };
            let list = api
                .list(&params)
                .await
                .with_context(|| format!("listing pods in {}", namespace.unwrap_or("<all>")))?;
            Ok(list.items.into_iter().map(ClusterObject::Pod).collect())
        } else {
            let api_resource = dynamic_api_resource(resource);
            let api: Api<DynamicObject> = match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &api_resource),
                None => Api::all_with(self.client.clone(), &api_resource),
            };
            let list = api.list(&params).await.with_context(|| {
                format!(
                    "listing {} in {}",
                    resource.kind,
                    namespace.unwrap_or("<all>")
                )
            })?;
            Ok(list.items.into_iter().map(ClusterObject::Dynamic).collect())
        }
    }
}
