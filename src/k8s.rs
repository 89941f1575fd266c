//! Kubernetes watches feeding the discoverer.
//!
//! Each resource kind is mirrored into a [`MemoryStore`] by an [`Informer`]
//! driven by a `kube` watcher. Every change to a store is also handed to the
//! [`ChangeRouter`], which queues the Endpoints objects to rebuild.
//!
//! # Example
//!
//! ```ignore
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//! use endpoints_sd::{discover, DiscoveryConfig};
//!
//! let (tx, mut rx) = mpsc::channel(64);
//! let cancel = CancellationToken::new();
//!
//! let config = DiscoveryConfig::new()
//!     .namespace("monitoring")
//!     .attach_node_metadata(true);
//! discover(config, tx, cancel.clone());
//!
//! while let Some(group) = rx.recv().await {
//!     println!("{}: {} targets", group.source, group.targets.len());
//! }
//! ```

use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::builder::Caches;
use crate::error::Result;
use crate::key::ResourceKey;
use crate::metrics::{EventMetrics, NoopMetrics};
use crate::reconciler::EndpointsDiscovery;
use crate::router::{ChangeRouter, ResourceEvent};
use crate::store::{MemoryStore, Store, endpoints_store};
use crate::target_group::TargetGroup;

/// Configuration for Kubernetes endpoints discovery.
#[derive(Clone)]
pub struct DiscoveryConfig {
    /// Restricts Endpoints, Services and Pods to one namespace.
    /// If `None`, watches all namespaces.
    pub namespace: Option<String>,

    /// Attaches Node metadata to targets.
    pub attach_node_metadata: bool,

    /// Attaches Namespace metadata to target groups.
    pub attach_namespace_metadata: bool,

    /// Receives the per-role event counts.
    pub metrics: Arc<dyn EventMetrics>,
}

impl Debug for DiscoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryConfig")
            .field("namespace", &self.namespace)
            .field("attach_node_metadata", &self.attach_node_metadata)
            .field("attach_namespace_metadata", &self.attach_namespace_metadata)
            .finish_non_exhaustive()
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            attach_node_metadata: false,
            attach_namespace_metadata: false,
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl DiscoveryConfig {
    /// Creates a configuration watching all namespaces without metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an explicit namespace to watch.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Enables or disables Node metadata on targets.
    #[must_use]
    pub fn attach_node_metadata(mut self, enabled: bool) -> Self {
        self.attach_node_metadata = enabled;
        self
    }

    /// Enables or disables Namespace metadata on target groups.
    #[must_use]
    pub fn attach_namespace_metadata(mut self, enabled: bool) -> Self {
        self.attach_namespace_metadata = enabled;
        self
    }

    /// Sets the sink for event counts.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn EventMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Starts discovering Endpoints targets and sends target groups to `tx`.
///
/// This function spawns a background task that watches Endpoints, Services,
/// Pods and, when enabled, Nodes and Namespaces. It stops when `cancel` fires
/// or the receiver of `tx` is dropped.
///
/// # Requirements
///
/// - RBAC permissions to list and watch every watched kind
/// - Kubernetes client configuration (in-cluster or kubeconfig)
pub fn discover(config: DiscoveryConfig, tx: Sender<TargetGroup>, cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = discovery_loop(config, tx, cancel).await {
            tracing::error!("Kubernetes endpoints discovery failed: {e}");
        }
    });
}

/// Background task wiring informers, router and reconciler together.
async fn discovery_loop(
    config: DiscoveryConfig,
    tx: Sender<TargetGroup>,
    cancel: CancellationToken,
) -> Result<()> {
    let client = Client::try_default().await?;

    let namespace = config.namespace.as_deref();

    let endpoints = Arc::new(endpoints_store());
    let services = Arc::new(MemoryStore::<Service>::new());
    let pods = Arc::new(MemoryStore::<Pod>::new());
    let nodes = config
        .attach_node_metadata
        .then(|| Arc::new(MemoryStore::<Node>::new()));
    let namespaces = config
        .attach_namespace_metadata
        .then(|| Arc::new(MemoryStore::<Namespace>::new()));

    let caches = Caches {
        endpoints: endpoints.clone(),
        services: services.clone(),
        pods: pods.clone(),
        nodes: nodes.clone().map(|s| s as Arc<dyn Store<Node>>),
        namespaces: namespaces
            .clone()
            .map(|s| s as Arc<dyn Store<Namespace>>),
    };
    let discovery = EndpointsDiscovery::new(caches, config.metrics.clone());
    let router = discovery.router();

    tracing::debug!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        nodes = config.attach_node_metadata,
        namespaces = config.attach_namespace_metadata,
        "starting Kubernetes endpoints discovery"
    );

    let mut informers = JoinSet::new();
    spawn_informer(
        &mut informers,
        namespaced(&client, namespace),
        endpoints,
        route(&router, ChangeRouter::on_endpoints),
    );
    spawn_informer(
        &mut informers,
        namespaced(&client, namespace),
        services,
        route(&router, ChangeRouter::on_service),
    );
    spawn_informer(
        &mut informers,
        namespaced(&client, namespace),
        pods,
        route(&router, ChangeRouter::on_pod),
    );
    if let Some(nodes) = nodes {
        spawn_informer(
            &mut informers,
            Api::all(client.clone()),
            nodes,
            route(&router, ChangeRouter::on_node),
        );
    }
    if let Some(namespaces) = namespaces {
        spawn_informer(
            &mut informers,
            Api::all(client.clone()),
            namespaces,
            route(&router, ChangeRouter::on_namespace),
        );
    }

    let result = discovery.run(cancel, tx).await;
    informers.abort_all();
    result
}

/// An API for a namespaced kind, restricted to `namespace` if given.
fn namespaced<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Binds a router handler to a shared router.
fn route<K>(
    router: &Arc<ChangeRouter>,
    handler: fn(&ChangeRouter, &ResourceEvent<K>),
) -> impl FnMut(&ResourceEvent<K>) + Send + 'static
where
    K: 'static,
{
    let router = router.clone();
    move |event: &ResourceEvent<K>| handler(&router, event)
}

fn spawn_informer<K, F>(
    tasks: &mut JoinSet<()>,
    api: Api<K>,
    store: Arc<MemoryStore<K>>,
    handle: F,
)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: FnMut(&ResourceEvent<K>) + Send + 'static,
{
    tasks.spawn(Informer::new(store).run(api, handle));
}

/// Mirrors one resource kind into a [`MemoryStore`] and reports every change.
pub struct Informer<K> {
    store: Arc<MemoryStore<K>>,
    relist: Option<Vec<(ResourceKey, Arc<K>)>>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Creates an informer writing to `store`.
    #[must_use]
    pub fn new(store: Arc<MemoryStore<K>>) -> Self {
        Self {
            store,
            relist: None,
        }
    }

    /// Watches `api` until the stream ends, calling `handle` for each change.
    ///
    /// Watch errors are logged and the watch is retried with backoff.
    pub async fn run<F>(self, api: Api<K>, handle: F)
    where
        F: FnMut(&ResourceEvent<K>),
    {
        tracing::debug!(kind = %K::kind(&()), "starting Kubernetes watch");

        let stream = watcher::watcher(api, WatcherConfig::default()).default_backoff();
        self.consume(stream, handle).await;
    }

    async fn consume<S, F>(mut self, stream: S, mut handle: F)
    where
        S: Stream<Item = watcher::Result<Event<K>>>,
        F: FnMut(&ResourceEvent<K>),
    {
        tokio::pin!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    for change in self.process_event(event) {
                        handle(&change);
                    }
                }
                Err(e) => {
                    tracing::warn!(kind = %K::kind(&()), "Kubernetes watch failed, retrying: {e}");
                }
            }
        }
    }

    /// Applies a watcher event to the store and returns the resulting changes.
    ///
    /// A relist (`Init` .. `InitDone`) replaces the store contents at once and
    /// marks the store synced.
    fn process_event(&mut self, event: Event<K>) -> Vec<ResourceEvent<K>> {
        match event {
            Event::Apply(obj) => {
                let Some(key) = object_key(&obj) else {
                    return Vec::new();
                };
                let new = Arc::new(obj);

                match self.store.insert(key, new.clone()) {
                    Some(old) => vec![ResourceEvent::Updated { old, new }],
                    None => vec![ResourceEvent::Added(new)],
                }
            }

            Event::Delete(obj) => {
                let Some(key) = object_key(&obj) else {
                    return Vec::new();
                };
                self.store.remove(&key);
                vec![ResourceEvent::Deleted(Arc::new(obj))]
            }

            Event::Init => {
                tracing::debug!(kind = %K::kind(&()), "Kubernetes watcher relisting");
                self.relist = Some(Vec::new());
                Vec::new()
            }

            Event::InitApply(obj) => {
                if let Some(key) = object_key(&obj) {
                    self.relist
                        .get_or_insert_with(Vec::new)
                        .push((key, Arc::new(obj)));
                }
                Vec::new()
            }

            Event::InitDone => {
                let listed = self.relist.take().unwrap_or_default();
                let mut previous = self.store.replace(listed.iter().cloned());

                let mut changes: Vec<_> = listed
                    .into_iter()
                    .map(|(key, new)| match previous.remove(&key) {
                        Some(old) => ResourceEvent::Updated { old, new },
                        None => ResourceEvent::Added(new),
                    })
                    .collect();
                changes.extend(previous.into_values().map(ResourceEvent::Deleted));

                self.store.mark_synced();
                changes
            }
        }
    }
}

fn object_key<K>(obj: &K) -> Option<ResourceKey>
where
    K: Resource<DynamicType = ()>,
{
    ResourceKey::from_object(obj)
        .inspect_err(|e| tracing::error!("skipping watched object: {e}"))
        .ok()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("ns".into()),
                name: Some(name.into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn informer() -> (Informer<Pod>, Arc<MemoryStore<Pod>>) {
        let store = Arc::new(MemoryStore::new());
        (Informer::new(store.clone()), store)
    }

    fn names(changes: &[ResourceEvent<Pod>]) -> Vec<(&'static str, String)> {
        let mut out: Vec<_> = changes
            .iter()
            .map(|c| {
                let kind = match c {
                    ResourceEvent::Added(_) => "added",
                    ResourceEvent::Updated { .. } => "updated",
                    ResourceEvent::Deleted(_) => "deleted",
                };
                (kind, c.object().metadata.name.clone().unwrap_or_default())
            })
            .collect();
        out.sort();
        out
    }

    // DiscoveryConfig tests

    #[test]
    fn config_defaults() {
        let config = DiscoveryConfig::new();

        assert!(config.namespace.is_none());
        assert!(!config.attach_node_metadata);
        assert!(!config.attach_namespace_metadata);
    }

    #[test]
    fn config_builder() {
        let config = DiscoveryConfig::new()
            .namespace("monitoring")
            .attach_node_metadata(true)
            .attach_namespace_metadata(true);

        assert_eq!(config.namespace, Some("monitoring".to_string()));
        assert!(config.attach_node_metadata);
        assert!(config.attach_namespace_metadata);
        assert!(format!("{config:?}").contains("monitoring"));
    }

    // consume tests

    #[tokio::test]
    async fn watch_errors_do_not_stop_the_informer() {
        let (informer, store) = informer();
        let events = futures::stream::iter(vec![
            Ok(Event::Init),
            Err(watcher::Error::NoResourceVersion),
            Ok(Event::InitApply(pod("a", "Pending"))),
            Ok(Event::InitDone),
            Err(watcher::Error::NoResourceVersion),
            Ok(Event::Apply(pod("b", "Running"))),
        ]);

        let mut seen = Vec::new();
        informer
            .consume(events, |change: &ResourceEvent<Pod>| {
                seen.push(change.object().metadata.name.clone().unwrap_or_default());
            })
            .await;

        assert_eq!(seen, vec!["a", "b"]);
        assert!(store.has_synced());
        assert!(store.get(&ResourceKey::namespaced("ns", "b")).unwrap().is_some());
    }

    // process_event tests

    #[test]
    fn apply_new_object_is_added() {
        let (mut informer, store) = informer();

        let changes = informer.process_event(Event::Apply(pod("a", "Pending")));

        assert_eq!(names(&changes), vec![("added", "a".to_string())]);
        assert!(store.get(&ResourceKey::namespaced("ns", "a")).unwrap().is_some());
    }

    #[test]
    fn apply_known_object_is_updated_with_old_state() {
        let (mut informer, _store) = informer();
        informer.process_event(Event::Apply(pod("a", "Pending")));

        let changes = informer.process_event(Event::Apply(pod("a", "Running")));

        let [ResourceEvent::Updated { old, new }] = changes.as_slice() else {
            panic!("expected one update, got {changes:?}");
        };
        assert_eq!(old.status.as_ref().unwrap().phase.as_deref(), Some("Pending"));
        assert_eq!(new.status.as_ref().unwrap().phase.as_deref(), Some("Running"));
    }

    #[test]
    fn delete_removes_from_store() {
        let (mut informer, store) = informer();
        informer.process_event(Event::Apply(pod("a", "Running")));

        let changes = informer.process_event(Event::Delete(pod("a", "Running")));

        assert_eq!(names(&changes), vec![("deleted", "a".to_string())]);
        assert!(store.list().is_empty());
    }

    #[test]
    fn nameless_object_is_skipped() {
        let (mut informer, store) = informer();

        let changes = informer.process_event(Event::Apply(Pod::default()));

        assert!(changes.is_empty());
        assert!(store.list().is_empty());
    }

    #[test]
    fn relist_is_applied_on_init_done() {
        let (mut informer, store) = informer();
        informer.process_event(Event::Apply(pod("kept", "Running")));
        informer.process_event(Event::Apply(pod("gone", "Running")));

        assert!(informer.process_event(Event::Init).is_empty());
        assert!(
            informer
                .process_event(Event::InitApply(pod("kept", "Running")))
                .is_empty()
        );
        assert!(
            informer
                .process_event(Event::InitApply(pod("new", "Pending")))
                .is_empty()
        );
        assert!(!store.has_synced());
        assert_eq!(store.list().len(), 2);

        let changes = informer.process_event(Event::InitDone);

        assert_eq!(
            names(&changes),
            vec![
                ("added", "new".to_string()),
                ("deleted", "gone".to_string()),
                ("updated", "kept".to_string()),
            ]
        );
        assert!(store.has_synced());
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn empty_relist_syncs_empty_store() {
        let store = Arc::new(MemoryStore::<Service>::new());
        let mut informer = Informer::new(store.clone());

        informer.process_event(Event::Init);
        let changes = informer.process_event(Event::InitDone);

        assert!(changes.is_empty());
        assert!(store.has_synced());
    }
}
