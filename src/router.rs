//! Routes cache notifications to Endpoints reconciliation keys.
//!
//! Every handler resolves the change to the keys of the Endpoints objects it
//! can affect and adds them to the work queue. Failures are logged and the
//! event is dropped; a later notification supersedes it.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod, Service};
use kube::Resource;

use crate::key::ResourceKey;
use crate::metrics::{EventMetrics, EventType, Role};
use crate::queue::WorkQueue;
use crate::store::{NAMESPACE_INDEX, NODE_INDEX, POD_INDEX, Store};

/// A change observed by a resource cache.
#[derive(Clone, Debug)]
pub enum ResourceEvent<K> {
    /// The object was added to the cache.
    Added(Arc<K>),
    /// The object was replaced in the cache.
    Updated {
        /// The object before the change.
        old: Arc<K>,
        /// The object after the change.
        new: Arc<K>,
    },
    /// The object was removed from the cache.
    Deleted(Arc<K>),
}

impl<K> ResourceEvent<K> {
    /// The event type used for counting.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Added(_) => EventType::Add,
            Self::Updated { .. } => EventType::Update,
            Self::Deleted(_) => EventType::Delete,
        }
    }

    /// The most recent state of the object.
    #[must_use]
    pub fn object(&self) -> &K {
        match self {
            Self::Added(obj) | Self::Deleted(obj) | Self::Updated { new: obj, .. } => obj,
        }
    }
}

/// Turns notifications from the five caches into queued Endpoints keys.
pub struct ChangeRouter {
    endpoints: Arc<dyn Store<Endpoints>>,
    queue: Arc<WorkQueue<ResourceKey>>,
    metrics: Arc<dyn EventMetrics>,
}

impl ChangeRouter {
    /// Creates a router feeding `queue`.
    #[must_use]
    pub fn new(
        endpoints: Arc<dyn Store<Endpoints>>,
        queue: Arc<WorkQueue<ResourceKey>>,
        metrics: Arc<dyn EventMetrics>,
    ) -> Self {
        Self {
            endpoints,
            queue,
            metrics,
        }
    }

    /// Any Endpoints change reconciles that Endpoints object.
    pub fn on_endpoints(&self, event: &ResourceEvent<Endpoints>) {
        self.metrics.inc(Role::Endpoints, event.event_type());
        self.enqueue(event.object());
    }

    /// A Service change reconciles the Endpoints object of the same name.
    pub fn on_service(&self, event: &ResourceEvent<Service>) {
        self.metrics.inc(Role::Service, event.event_type());

        let key = match ResourceKey::from_object(event.object()) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!("converting to Service object failed: {e}");
                return;
            }
        };

        match self.endpoints.get(&key) {
            Ok(Some(eps)) => self.enqueue(&eps),
            Ok(None) => {}
            Err(e) => tracing::error!(service = %key, "retrieving endpoints failed: {e}"),
        }
    }

    /// Pod phase changes do not always touch the Endpoints object, so they
    /// reconcile every Endpoints object referencing the pod. Additions and
    /// deletions arrive through Endpoints events and are ignored here.
    pub fn on_pod(&self, event: &ResourceEvent<Pod>) {
        let ResourceEvent::Updated { old, new } = event else {
            return;
        };
        self.metrics.inc(Role::Pod, EventType::Update);

        if pod_phase(old) == pod_phase(new) {
            return;
        }

        match ResourceKey::from_object(new.as_ref()) {
            Ok(key) => self.enqueue_index(POD_INDEX, &key.to_string()),
            Err(e) => tracing::error!("converting to Pod object failed: {e}"),
        }
    }

    /// Any Node change reconciles the Endpoints objects with addresses on it.
    pub fn on_node(&self, event: &ResourceEvent<Node>) {
        self.metrics.inc(Role::Node, event.event_type());

        match event.object().meta().name.as_deref() {
            Some(name) => self.enqueue_index(NODE_INDEX, name),
            None => tracing::error!("error getting Node name"),
        }
    }

    /// Namespace updates reconcile every Endpoints object in the namespace.
    /// Creation and deletion surface through the objects inside it.
    pub fn on_namespace(&self, event: &ResourceEvent<Namespace>) {
        let ResourceEvent::Updated { new, .. } = event else {
            return;
        };
        self.metrics.inc(Role::Namespace, EventType::Update);

        match new.metadata.name.as_deref() {
            Some(name) => self.enqueue_index(NAMESPACE_INDEX, name),
            None => tracing::error!("error getting Namespace name"),
        }
    }

    fn enqueue_index(&self, index: &str, value: &str) {
        match self.endpoints.by_index(index, value) {
            Ok(endpoints) => {
                for eps in endpoints {
                    self.enqueue(&eps);
                }
            }
            Err(e) => tracing::error!(index, value, "error getting endpoints: {e}"),
        }
    }

    fn enqueue(&self, eps: &Endpoints) {
        match ResourceKey::from_object(eps) {
            Ok(key) => self.queue.add(key),
            Err(e) => tracing::error!("converting to Endpoints object failed: {e}"),
        }
    }
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}
