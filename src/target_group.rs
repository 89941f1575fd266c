//! Target groups emitted to consumers.

use crate::labels::LabelSet;

/// A set of scrape targets sharing common labels.
///
/// Consumers replace everything they hold for `source` whenever a group with
/// that source arrives. A group without targets is a deletion tombstone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetGroup {
    /// Stable identifier of the Endpoints object the group was built from.
    pub source: String,
    /// Labels shared by every target in the group.
    pub labels: LabelSet,
    /// One label set per target, each carrying an address label.
    pub targets: Vec<LabelSet>,
}

impl TargetGroup {
    /// Creates an empty group for `source`.
    #[must_use]
    pub fn tombstone(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Returns `true` if the group carries no targets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Source identifier for the Endpoints object `namespace/name`.
#[must_use]
pub fn endpoints_source(namespace: &str, name: &str) -> String {
    format!("endpoints/{namespace}/{name}")
}
