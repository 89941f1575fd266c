//! Namespace/name keys identifying cached objects and units of work.

use std::fmt;
use std::str::FromStr;

use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};

/// Identifies one object in a cache, and for Endpoints one unit of
/// reconciliation work.
///
/// Cluster-scoped objects (Nodes, Namespaces) have no namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// The object namespace, `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    /// The object name.
    pub name: String,
}

impl ResourceKey {
    /// Creates a key for a namespaced object.
    #[must_use]
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Creates a key for a cluster-scoped object.
    #[must_use]
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Derives the key of a Kubernetes object from its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingName`] if the object has no name.
    pub fn from_object<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()>,
    {
        let Some(name) = obj.meta().name.clone().filter(|n| !n.is_empty()) else {
            return Err(Error::MissingName {
                kind: K::kind(&()).into_owned(),
            });
        };

        Ok(Self {
            namespace: obj.namespace().filter(|ns| !ns.is_empty()),
            name,
        })
    }

    /// Returns the namespace and name, failing for cluster-scoped keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotNamespaced`] if the key has no namespace.
    pub fn split(&self) -> Result<(&str, &str)> {
        match &self.namespace {
            Some(ns) => Ok((ns, &self.name)),
            None => Err(Error::NotNamespaced {
                key: self.to_string(),
            }),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Parses the [`Display`](fmt::Display) form back into a key.
///
/// Lets callers turn a key taken from logs or configuration into a store
/// lookup.
impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::MalformedKey { key: s.to_string() };

        let mut parts = s.split('/');
        let key = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Self::cluster(name),
            (Some(ns), Some(name), None) => Self::namespaced(ns, name),
            _ => return Err(malformed()),
        };

        if key.name.is_empty() {
            return Err(malformed());
        }

        Ok(key)
    }
}
