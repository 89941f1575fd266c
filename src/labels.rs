//! Label sets and the meta label vocabulary attached to discovered targets.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Label holding the scrape address of a target.
pub const ADDRESS_LABEL: &str = "__address__";

const META_LABEL_PREFIX: &str = "__meta_kubernetes_";
const PRESENT_VALUE: &str = "true";

/// Namespace of the Endpoints object a group was built from.
pub const NAMESPACE_LABEL: &str = "__meta_kubernetes_namespace";

pub(crate) const ENDPOINT_NODE_NAME: &str = "__meta_kubernetes_endpoint_node_name";
pub(crate) const ENDPOINT_HOSTNAME: &str = "__meta_kubernetes_endpoint_hostname";
pub(crate) const ENDPOINT_READY: &str = "__meta_kubernetes_endpoint_ready";
pub(crate) const ENDPOINT_PORT_NAME: &str = "__meta_kubernetes_endpoint_port_name";
pub(crate) const ENDPOINT_PORT_PROTOCOL: &str = "__meta_kubernetes_endpoint_port_protocol";
pub(crate) const ENDPOINT_TARGET_KIND: &str = "__meta_kubernetes_endpoint_address_target_kind";
pub(crate) const ENDPOINT_TARGET_NAME: &str = "__meta_kubernetes_endpoint_address_target_name";

pub(crate) const POD_IP: &str = "__meta_kubernetes_pod_ip";
pub(crate) const POD_READY: &str = "__meta_kubernetes_pod_ready";
pub(crate) const POD_PHASE: &str = "__meta_kubernetes_pod_phase";
pub(crate) const POD_NODE_NAME: &str = "__meta_kubernetes_pod_node_name";
pub(crate) const POD_HOST_IP: &str = "__meta_kubernetes_pod_host_ip";
pub(crate) const POD_UID: &str = "__meta_kubernetes_pod_uid";
pub(crate) const POD_CONTROLLER_KIND: &str = "__meta_kubernetes_pod_controller_kind";
pub(crate) const POD_CONTROLLER_NAME: &str = "__meta_kubernetes_pod_controller_name";

pub(crate) const CONTAINER_NAME: &str = "__meta_kubernetes_pod_container_name";
pub(crate) const CONTAINER_IMAGE: &str = "__meta_kubernetes_pod_container_image";
pub(crate) const CONTAINER_PORT_NAME: &str = "__meta_kubernetes_pod_container_port_name";
pub(crate) const CONTAINER_PORT_NUMBER: &str = "__meta_kubernetes_pod_container_port_number";
pub(crate) const CONTAINER_PORT_PROTOCOL: &str = "__meta_kubernetes_pod_container_port_protocol";
pub(crate) const CONTAINER_INIT: &str = "__meta_kubernetes_pod_container_init";

/// A mapping from label name to label value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Creates an empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a label, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns the value of a label.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Returns `true` if the label is set.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of labels in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set has no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the union of both sets. Labels in `other` win on conflict.
    #[must_use]
    pub fn merge(mut self, other: &LabelSet) -> Self {
        self.merge_from(other);
        self
    }

    /// Copies every label of `other` into `self`, overwriting on conflict.
    pub fn merge_from(&mut self, other: &LabelSet) {
        self.0
            .extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Replaces every character outside `[a-zA-Z0-9_]` with `_`.
#[must_use]
pub fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Joins a host and port, bracketing IPv6 literals.
#[must_use]
pub fn join_host_port(host: &str, port: i32) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

/// Adds `<resource>_label_*` and `<resource>_annotation_*` labels, each with
/// a matching `*present_*` flag.
fn add_labels_and_annotations(ls: &mut LabelSet, meta: &ObjectMeta, resource: &str) {
    let families = [
        ("label", meta.labels.as_ref()),
        ("annotation", meta.annotations.as_ref()),
    ];

    for (family, entries) in families {
        for (k, v) in entries.into_iter().flatten() {
            let ln = sanitize_label_name(k);
            ls.insert(format!("{META_LABEL_PREFIX}{resource}_{family}_{ln}"), v);
            ls.insert(
                format!("{META_LABEL_PREFIX}{resource}_{family}present_{ln}"),
                PRESENT_VALUE,
            );
        }
    }
}

/// Adds the object name plus its labels and annotations under `role`.
pub(crate) fn add_object_meta_labels(ls: &mut LabelSet, meta: &ObjectMeta, role: &str) {
    ls.insert(
        format!("{META_LABEL_PREFIX}{role}_name"),
        meta.name.as_deref().unwrap_or_default(),
    );
    add_labels_and_annotations(ls, meta, role);
}

/// Namespace metadata omits the name, which is already in [`NAMESPACE_LABEL`].
pub(crate) fn namespace_meta_labels(meta: &ObjectMeta) -> LabelSet {
    let mut ls = LabelSet::new();
    add_labels_and_annotations(&mut ls, meta, "namespace");
    ls
}

pub(crate) fn service_labels(svc: &Service) -> LabelSet {
    let mut ls = LabelSet::new();
    ls.insert(
        NAMESPACE_LABEL,
        svc.metadata.namespace.as_deref().unwrap_or_default(),
    );
    add_object_meta_labels(&mut ls, &svc.metadata, "service");
    ls
}

/// Status of the pod's `Ready` condition, lower-cased.
fn pod_ready(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .map_or_else(|| "unknown".to_string(), |c| c.status.to_lowercase())
}

pub(crate) fn pod_labels(pod: &Pod) -> LabelSet {
    let status = pod.status.as_ref();
    let spec = pod.spec.as_ref();

    let mut ls: LabelSet = [
        (POD_IP, status.and_then(|s| s.pod_ip.clone())),
        (POD_READY, Some(pod_ready(pod))),
        (POD_PHASE, status.and_then(|s| s.phase.clone())),
        (POD_NODE_NAME, spec.and_then(|s| s.node_name.clone())),
        (POD_HOST_IP, status.and_then(|s| s.host_ip.clone())),
        (POD_UID, pod.metadata.uid.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k, v.unwrap_or_default()))
    .collect();

    add_object_meta_labels(&mut ls, &pod.metadata, "pod");

    let controller = pod
        .metadata
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true));

    if let Some(owner) = controller {
        if !owner.kind.is_empty() {
            ls.insert(POD_CONTROLLER_KIND, &owner.kind);
        }
        if !owner.name.is_empty() {
            ls.insert(POD_CONTROLLER_NAME, &owner.name);
        }
    }

    ls
}
