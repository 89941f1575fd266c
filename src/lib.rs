#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes `Endpoints` discovery of metrics scrape targets.
//!
//! Watches Endpoints, Services, Pods and optionally Nodes and Namespaces, and
//! turns every Endpoints object into a [`TargetGroup`]: one labeled target per
//! address and port, enriched with the metadata of the objects it refers to.
//!
//! # How It Works
//!
//! 1. Informers mirror each resource kind into a local [`MemoryStore`]
//! 2. The [`ChangeRouter`] maps every change to the Endpoints objects it affects
//! 3. A coalescing [`WorkQueue`] keeps at most one pending rebuild per object
//! 4. [`EndpointsDiscovery`] rebuilds one object at a time and sends the group,
//!    or an empty tombstone group once the object is gone
//!
//! # Usage
//!
//! ```ignore
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//! use endpoints_sd::{discover, DiscoveryConfig};
//!
//! let (tx, mut rx) = mpsc::channel(64);
//! let cancel = CancellationToken::new();
//!
//! discover(DiscoveryConfig::new().attach_node_metadata(true), tx, cancel.clone());
//!
//! while let Some(group) = rx.recv().await {
//!     // Replace everything previously received for `group.source`.
//! }
//! ```

mod builder;
mod error;
mod k8s;
mod key;
mod labels;
mod metrics;
mod queue;
mod reconciler;
mod router;
mod store;
mod target_group;

pub use builder::{Caches, build_target_group};
pub use error::{Error, Result};
pub use k8s::{DiscoveryConfig, Informer, discover};
pub use key::ResourceKey;
pub use labels::{
    ADDRESS_LABEL, LabelSet, NAMESPACE_LABEL, join_host_port, sanitize_label_name,
};
pub use metrics::{EventMetrics, EventType, NoopMetrics, OtelEventMetrics, Role};
pub use queue::WorkQueue;
pub use reconciler::EndpointsDiscovery;
pub use router::{ChangeRouter, ResourceEvent};
pub use store::{
    IndexFn, MemoryStore, NAMESPACE_INDEX, NODE_INDEX, POD_INDEX, Store, endpoints_node_index,
    endpoints_pod_index, endpoints_store, namespace_index,
};
pub use target_group::{TargetGroup, endpoints_source};
