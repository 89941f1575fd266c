//! Error types for endpoints discovery.
//!
//! None of these ever reach the target group stream. They are logged where
//! they occur and the affected unit of work is dropped.

use thiserror::Error;

/// Error type for discovery failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes client error.
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// An object in a cache had no name in its metadata.
    #[error("{kind} object has no name")]
    MissingName {
        /// The resource kind of the offending object.
        kind: String,
    },

    /// A string could not be parsed as a [`ResourceKey`](crate::ResourceKey).
    #[error("malformed key {key:?}")]
    MalformedKey {
        /// The raw key.
        key: String,
    },

    /// A namespaced lookup was requested with a cluster-scoped key.
    #[error("key {key:?} has no namespace")]
    NotNamespaced {
        /// The offending key.
        key: String,
    },

    /// A store was queried with an index it does not maintain.
    #[error("index {index:?} does not exist")]
    UnknownIndex {
        /// The requested index name.
        index: String,
    },

    /// The caches never reported an initial sync.
    #[error("caches did not sync")]
    CacheSync,
}

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, Error>;
