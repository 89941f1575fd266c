//! Read access to locally cached Kubernetes objects.
//!
//! The discoverer only ever reads from caches through [`Store`]. Writes happen
//! in [`MemoryStore`], which the watch-driven informers keep up to date.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use k8s_openapi::api::core::v1::Endpoints;
use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};
use crate::key::ResourceKey;

/// Index of objects by namespace.
pub const NAMESPACE_INDEX: &str = "namespace";
/// Index of Endpoints by the `namespace/name` of every Pod they reference.
pub const POD_INDEX: &str = "pod";
/// Index of Endpoints by the name of every Node their addresses run on.
pub const NODE_INDEX: &str = "node";

/// Computes the index values of an object.
pub type IndexFn<K> = Box<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// An eventually consistent, read-only view of one resource kind.
pub trait Store<K>: Send + Sync {
    /// Looks up an object by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    fn get(&self, key: &ResourceKey) -> Result<Option<Arc<K>>>;

    /// Returns every object whose `index` contains `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIndex`] if the store does not maintain `index`.
    fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>>;

    /// Returns `true` once the initial listing has been loaded.
    fn has_synced(&self) -> bool;
}

struct Inner<K> {
    objects: HashMap<ResourceKey, Arc<K>>,
    indices: HashMap<String, HashMap<String, HashSet<ResourceKey>>>,
}

/// A thread-safe in-memory [`Store`] with secondary indices.
///
/// Indices are registered up front with [`MemoryStore::with_index`] and kept
/// current on every write.
pub struct MemoryStore<K> {
    inner: RwLock<Inner<K>>,
    indexers: HashMap<String, IndexFn<K>>,
    synced: AtomicBool,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                objects: HashMap::new(),
                indices: HashMap::new(),
            }),
            indexers: HashMap::new(),
            synced: AtomicBool::new(false),
        }
    }
}

impl<K> MemoryStore<K> {
    /// Creates an empty, unsynced store without indices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a secondary index.
    #[must_use]
    pub fn with_index<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        let name = name.into();
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .indices
            .insert(name.clone(), HashMap::new());
        self.indexers.insert(name, Box::new(f));
        self
    }

    /// Inserts or replaces an object, returning the previous one.
    pub fn insert(&self, key: ResourceKey, obj: Arc<K>) -> Option<Arc<K>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        self.insert_locked(&mut inner, key, obj)
    }

    /// Removes an object, returning it if it was present.
    pub fn remove(&self, key: &ResourceKey) -> Option<Arc<K>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        self.remove_locked(&mut inner, key)
    }

    /// Replaces the whole content of the store, returning the previous content.
    pub fn replace<I>(&self, objects: I) -> HashMap<ResourceKey, Arc<K>>
    where
        I: IntoIterator<Item = (ResourceKey, Arc<K>)>,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let previous = std::mem::take(&mut inner.objects);
        for values in inner.indices.values_mut() {
            values.clear();
        }

        for (key, obj) in objects {
            self.insert_locked(&mut inner, key, obj);
        }

        previous
    }

    /// Returns a snapshot of every cached object.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<K>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.objects.values().cloned().collect()
    }

    /// Marks the initial listing as loaded.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    fn insert_locked(
        &self,
        inner: &mut Inner<K>,
        key: ResourceKey,
        obj: Arc<K>,
    ) -> Option<Arc<K>> {
        let previous = self.remove_locked(inner, &key);

        for (name, f) in &self.indexers {
            let index = inner.indices.entry(name.clone()).or_default();
            for value in f(&*obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }

        inner.objects.insert(key, obj);
        previous
    }

    fn remove_locked(&self, inner: &mut Inner<K>, key: &ResourceKey) -> Option<Arc<K>> {
        let previous = inner.objects.remove(key)?;

        for (name, f) in &self.indexers {
            let Some(index) = inner.indices.get_mut(name) else {
                continue;
            };

            for value in f(&*previous) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }

        Some(previous)
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Inserts or replaces an object under its own key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingName`] if the object has no name.
    pub fn apply(&self, obj: K) -> Result<Option<Arc<K>>> {
        let key = ResourceKey::from_object(&obj)?;
        Ok(self.insert(key, Arc::new(obj)))
    }

    /// Removes an object by its own key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingName`] if the object has no name.
    pub fn delete(&self, obj: &K) -> Result<Option<Arc<K>>> {
        let key = ResourceKey::from_object(obj)?;
        Ok(self.remove(&key))
    }
}

impl<K> Store<K> for MemoryStore<K>
where
    K: Send + Sync,
{
    fn get(&self, key: &ResourceKey) -> Result<Option<Arc<K>>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.objects.get(key).cloned())
    }

    fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let Some(values) = inner.indices.get(index) else {
            return Err(Error::UnknownIndex {
                index: index.to_string(),
            });
        };

        Ok(values
            .get(value)
            .into_iter()
            .flatten()
            .filter_map(|key| inner.objects.get(key).cloned())
            .collect())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Index function for [`NAMESPACE_INDEX`].
#[must_use]
pub fn namespace_index<K: Resource>(obj: &K) -> Vec<String> {
    obj.namespace().into_iter().collect()
}

/// Index function for [`POD_INDEX`].
///
/// Covers both ready and not-ready addresses. A reference without a
/// namespace names a pod in the Endpoints namespace.
#[must_use]
pub fn endpoints_pod_index(eps: &Endpoints) -> Vec<String> {
    let mut pods = Vec::new();
    let eps_namespace = eps.metadata.namespace.as_deref();

    for subset in eps.subsets.iter().flatten() {
        let addresses = subset.addresses.iter().flatten();
        let not_ready = subset.not_ready_addresses.iter().flatten();

        for addr in addresses.chain(not_ready) {
            let Some(target) = &addr.target_ref else {
                continue;
            };
            if target.kind.as_deref() != Some("Pod") {
                continue;
            }
            let ns = target.namespace.as_deref().or(eps_namespace);
            if let (Some(ns), Some(name)) = (ns, &target.name) {
                pods.push(ResourceKey::namespaced(ns, name).to_string());
            }
        }
    }

    pods
}

/// Index function for [`NODE_INDEX`].
///
/// Uses the address node name, falling back to a `Node` target reference.
#[must_use]
pub fn endpoints_node_index(eps: &Endpoints) -> Vec<String> {
    let mut nodes = Vec::new();

    for subset in eps.subsets.iter().flatten() {
        let addresses = subset.addresses.iter().flatten();
        let not_ready = subset.not_ready_addresses.iter().flatten();

        for addr in addresses.chain(not_ready) {
            if let Some(node) = &addr.node_name {
                nodes.push(node.clone());
                continue;
            }

            let node_ref = addr
                .target_ref
                .as_ref()
                .filter(|r| r.kind.as_deref() == Some("Node"))
                .and_then(|r| r.name.clone());
            nodes.extend(node_ref);
        }
    }

    nodes
}

/// Creates an Endpoints store with the namespace, pod and node indices.
#[must_use]
pub fn endpoints_store() -> MemoryStore<Endpoints> {
    MemoryStore::new()
        .with_index(NAMESPACE_INDEX, namespace_index::<Endpoints>)
        .with_index(POD_INDEX, endpoints_pod_index)
        .with_index(NODE_INDEX, endpoints_node_index)
}
