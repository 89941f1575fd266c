//! Builds the target group of one Endpoints object.
//!
//! Every address/port pair of every subset becomes a target, enriched with
//! Node and Pod metadata where those objects are cached. Container ports of
//! referenced pods that no Endpoints port covers become extra targets on the
//! pod IP. Lookup failures only cost enrichment; a group is always returned.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EndpointAddress, EndpointPort, Endpoints, Namespace, Node,
    ObjectReference, Pod, Service,
};

use crate::key::ResourceKey;
use crate::labels::{
    ADDRESS_LABEL, CONTAINER_IMAGE, CONTAINER_INIT, CONTAINER_NAME, CONTAINER_PORT_NAME,
    CONTAINER_PORT_NUMBER, CONTAINER_PORT_PROTOCOL, ENDPOINT_HOSTNAME, ENDPOINT_NODE_NAME,
    ENDPOINT_PORT_NAME, ENDPOINT_PORT_PROTOCOL, ENDPOINT_READY, ENDPOINT_TARGET_KIND,
    ENDPOINT_TARGET_NAME, LabelSet, NAMESPACE_LABEL, add_object_meta_labels, join_host_port,
    namespace_meta_labels, pod_labels, service_labels,
};
use crate::store::Store;
use crate::target_group::{TargetGroup, endpoints_source};

/// Label set by the API server when an Endpoints object holds too many addresses.
const OVER_CAPACITY_LABEL: &str = "endpoints.kubernetes.io/over-capacity";

/// Read handles on every cache the discoverer consults.
///
/// Node and Namespace metadata is only attached when their cache is present.
#[derive(Clone)]
pub struct Caches {
    /// Endpoints objects, indexed by namespace, pod and node.
    pub endpoints: Arc<dyn Store<Endpoints>>,
    /// Service objects.
    pub services: Arc<dyn Store<Service>>,
    /// Pod objects.
    pub pods: Arc<dyn Store<Pod>>,
    /// Node objects, if node metadata is attached.
    pub nodes: Option<Arc<dyn Store<Node>>>,
    /// Namespace objects, if namespace metadata is attached.
    pub namespaces: Option<Arc<dyn Store<Namespace>>>,
}

impl Caches {
    /// Returns `true` once every configured cache has synced.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.endpoints.has_synced()
            && self.services.has_synced()
            && self.pods.has_synced()
            && self.nodes.as_ref().is_none_or(|s| s.has_synced())
            && self.namespaces.as_ref().is_none_or(|s| s.has_synced())
    }
}

/// Builds the target group for `eps` from the current cache contents.
#[must_use]
pub fn build_target_group(caches: &Caches, eps: &Endpoints) -> TargetGroup {
    TargetBuilder::new(caches, eps).build()
}

/// A resolved pod and the Endpoints ports already emitted for it.
struct PodEntry {
    pod: Arc<Pod>,
    service_ports: Vec<i32>,
}

struct TargetBuilder<'a> {
    caches: &'a Caches,
    eps: &'a Endpoints,
    namespace: &'a str,
    targets: Vec<LabelSet>,
    // Endpoints targets by subset, port and address. The not-ready pass over
    // the same entry wins.
    slots: HashMap<(usize, usize, String), usize>,
    seen_pods: BTreeMap<ResourceKey, PodEntry>,
}

impl<'a> TargetBuilder<'a> {
    fn new(caches: &'a Caches, eps: &'a Endpoints) -> Self {
        Self {
            caches,
            eps,
            namespace: eps.metadata.namespace.as_deref().unwrap_or_default(),
            targets: Vec::new(),
            slots: HashMap::new(),
            seen_pods: BTreeMap::new(),
        }
    }

    fn build(mut self) -> TargetGroup {
        let eps = self.eps;
        let name = eps.metadata.name.as_deref().unwrap_or_default();
        let labels = self.group_labels(name);

        for (i, subset) in eps.subsets.iter().flatten().enumerate() {
            for (j, port) in subset.ports.iter().flatten().enumerate() {
                for addr in subset.addresses.iter().flatten() {
                    self.add((i, j), addr, port, "true");
                }
                // Re-adds addresses that are also listed as ready, so the
                // not-ready flag overrides.
                for addr in subset.not_ready_addresses.iter().flatten() {
                    self.add((i, j), addr, port, "false");
                }
            }
        }

        self.warn_over_capacity(name);
        self.add_container_port_targets();

        TargetGroup {
            source: endpoints_source(self.namespace, name),
            labels,
            targets: self.targets,
        }
    }

    fn group_labels(&self, name: &str) -> LabelSet {
        let mut labels = LabelSet::new();
        labels.insert(NAMESPACE_LABEL, self.namespace);
        add_object_meta_labels(&mut labels, &self.eps.metadata, "endpoints");

        let key = ResourceKey::namespaced(self.namespace, name);
        match self.caches.services.get(&key) {
            Ok(Some(svc)) => labels.merge_from(&service_labels(&svc)),
            Ok(None) => {}
            Err(e) => tracing::error!(service = %key, "retrieving service failed: {e}"),
        }

        if let Some(namespaces) = &self.caches.namespaces {
            match namespaces.get(&ResourceKey::cluster(self.namespace)) {
                Ok(Some(ns)) => labels.merge_from(&namespace_meta_labels(&ns.metadata)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(namespace = self.namespace, "error getting namespace: {e}");
                }
            }
        }

        labels
    }

    fn add(
        &mut self,
        (subset, port_index): (usize, usize),
        addr: &EndpointAddress,
        port: &EndpointPort,
        ready: &str,
    ) {
        let address = join_host_port(&addr.ip, port.port);

        let mut target = LabelSet::new();
        target.insert(ADDRESS_LABEL, address.clone());
        target.insert(ENDPOINT_PORT_NAME, port.name.as_deref().unwrap_or_default());
        target.insert(
            ENDPOINT_PORT_PROTOCOL,
            port.protocol.as_deref().unwrap_or_default(),
        );
        target.insert(ENDPOINT_READY, ready);

        if let Some(target_ref) = &addr.target_ref {
            target.insert(
                ENDPOINT_TARGET_KIND,
                target_ref.kind.as_deref().unwrap_or_default(),
            );
            target.insert(
                ENDPOINT_TARGET_NAME,
                target_ref.name.as_deref().unwrap_or_default(),
            );
        }
        if let Some(node) = &addr.node_name {
            target.insert(ENDPOINT_NODE_NAME, node);
        }
        if let Some(hostname) = addr.hostname.as_deref().filter(|h| !h.is_empty()) {
            target.insert(ENDPOINT_HOSTNAME, hostname);
        }

        if let Some(node) = address_node(addr) {
            self.add_node_labels(&mut target, node);
        }

        if let Some((key, pod)) = self.resolve_pod(addr.target_ref.as_ref()) {
            target.merge_from(&pod_labels(&pod));

            if let Some((container, cport, init)) = find_container_port(&pod, port.port) {
                target.insert(CONTAINER_NAME, &container.name);
                target.insert(
                    CONTAINER_IMAGE,
                    container.image.as_deref().unwrap_or_default(),
                );
                target.insert(
                    CONTAINER_PORT_NAME,
                    cport.name.as_deref().unwrap_or_default(),
                );
                target.insert(CONTAINER_PORT_NUMBER, port.port.to_string());
                target.insert(
                    CONTAINER_PORT_PROTOCOL,
                    port.protocol.as_deref().unwrap_or_default(),
                );
                target.insert(CONTAINER_INIT, init.to_string());
            }

            self.seen_pods
                .entry(key)
                .or_insert_with(|| PodEntry {
                    pod,
                    service_ports: Vec::new(),
                })
                .service_ports
                .push(port.port);
        }

        let slot = (subset, port_index, address);
        match self.slots.get(&slot) {
            Some(&i) => self.targets[i] = target,
            None => {
                self.slots.insert(slot, self.targets.len());
                self.targets.push(target);
            }
        }
    }

    fn add_node_labels(&self, target: &mut LabelSet, node: &str) {
        let Some(nodes) = &self.caches.nodes else {
            return;
        };

        match nodes.get(&ResourceKey::cluster(node)) {
            Ok(Some(obj)) => {
                let mut node_labels = LabelSet::new();
                add_object_meta_labels(&mut node_labels, &obj.metadata, "node");
                target.merge_from(&node_labels);
            }
            Ok(None) => {}
            Err(e) => tracing::error!(node, "error getting node: {e}"),
        }
    }

    fn resolve_pod(&self, target_ref: Option<&ObjectReference>) -> Option<(ResourceKey, Arc<Pod>)> {
        let target_ref = target_ref.filter(|r| r.kind.as_deref() == Some("Pod"))?;
        let name = target_ref.name.as_deref()?;
        let namespace = target_ref.namespace.as_deref().unwrap_or(self.namespace);
        let key = ResourceKey::namespaced(namespace, name);

        match self.caches.pods.get(&key) {
            Ok(pod) => pod.map(|pod| (key, pod)),
            Err(e) => {
                tracing::error!(pod = %key, "resolving pod ref failed: {e}");
                None
            }
        }
    }

    fn warn_over_capacity(&self, name: &str) {
        let marker = self
            .eps
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(OVER_CAPACITY_LABEL));

        match marker.map(String::as_str) {
            Some("truncated") => tracing::warn!(
                endpoint = name,
                "number of endpoints in one Endpoints object exceeds 1000 and has been truncated, please use \"role: endpointslice\" instead"
            ),
            Some("warning") => tracing::warn!(
                endpoint = name,
                "number of endpoints in one Endpoints object exceeds 1000, please use \"role: endpointslice\" instead"
            ),
            _ => {}
        }
    }

    /// Emits a target on the pod IP for every container port that no
    /// Endpoints port covered.
    fn add_container_port_targets(&mut self) {
        for entry in self.seen_pods.values() {
            // Empty while a pod is starting or after eviction.
            let Some(pod_ip) = entry
                .pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.as_deref())
                .filter(|ip| !ip.is_empty())
            else {
                continue;
            };

            for (container, init) in containers(&entry.pod) {
                for cport in container.ports.iter().flatten() {
                    if entry.service_ports.contains(&cport.container_port) {
                        continue;
                    }

                    let mut target = LabelSet::new();
                    target.insert(ADDRESS_LABEL, join_host_port(pod_ip, cport.container_port));
                    target.insert(CONTAINER_NAME, &container.name);
                    target.insert(
                        CONTAINER_IMAGE,
                        container.image.as_deref().unwrap_or_default(),
                    );
                    target.insert(
                        CONTAINER_PORT_NAME,
                        cport.name.as_deref().unwrap_or_default(),
                    );
                    target.insert(CONTAINER_PORT_NUMBER, cport.container_port.to_string());
                    target.insert(
                        CONTAINER_PORT_PROTOCOL,
                        cport.protocol.as_deref().unwrap_or_default(),
                    );
                    target.insert(CONTAINER_INIT, init.to_string());

                    self.targets.push(target.merge(&pod_labels(&entry.pod)));
                }
            }
        }
    }
}

/// The node an address runs on: its node name, else a `Node` target reference.
fn address_node(addr: &EndpointAddress) -> Option<&str> {
    addr.node_name.as_deref().or_else(|| {
        addr.target_ref
            .as_ref()
            .filter(|r| r.kind.as_deref() == Some("Node"))
            .and_then(|r| r.name.as_deref())
    })
}

/// Regular containers followed by init containers, flagged `true`.
fn containers(pod: &Pod) -> impl Iterator<Item = (&Container, bool)> {
    let spec = pod.spec.as_ref();
    let regular = spec.into_iter().flat_map(|s| s.containers.iter());
    let init = spec
        .into_iter()
        .flat_map(|s| s.init_containers.iter().flatten());

    regular
        .map(|c| (c, false))
        .chain(init.map(|c| (c, true)))
}

/// The first container port numerically equal to `port`.
fn find_container_port(pod: &Pod, port: i32) -> Option<(&Container, &ContainerPort, bool)> {
    containers(pod).find_map(|(container, init)| {
        container
            .ports
            .iter()
            .flatten()
            .find(|cport| cport.container_port == port)
            .map(|cport| (container, cport, init))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{EndpointSubset, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::error::{Error, Result};
    use crate::labels::POD_IP;
    use crate::store::{MemoryStore, endpoints_store};

    struct FailingStore;

    impl<K> Store<K> for FailingStore {
        fn get(&self, _key: &ResourceKey) -> Result<Option<Arc<K>>> {
            Err(Error::CacheSync)
        }

        fn by_index(&self, index: &str, _value: &str) -> Result<Vec<Arc<K>>> {
            Err(Error::UnknownIndex {
                index: index.to_string(),
            })
        }

        fn has_synced(&self) -> bool {
            true
        }
    }

    struct Fixture {
        services: Arc<MemoryStore<Service>>,
        pods: Arc<MemoryStore<Pod>>,
        nodes: Arc<MemoryStore<Node>>,
        namespaces: Arc<MemoryStore<Namespace>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                services: Arc::new(MemoryStore::new()),
                pods: Arc::new(MemoryStore::new()),
                nodes: Arc::new(MemoryStore::new()),
                namespaces: Arc::new(MemoryStore::new()),
            }
        }

        fn caches(&self) -> Caches {
            Caches {
                endpoints: Arc::new(endpoints_store()),
                services: self.services.clone(),
                pods: self.pods.clone(),
                nodes: Some(self.nodes.clone()),
                namespaces: Some(self.namespaces.clone()),
            }
        }

        fn caches_without_metadata(&self) -> Caches {
            Caches {
                nodes: None,
                namespaces: None,
                ..self.caches()
            }
        }
    }

    fn labels(entries: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    fn meta(ns: Option<&str>, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: ns.map(String::from),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    fn port(name: &str, number: i32) -> EndpointPort {
        EndpointPort {
            name: Some(name.into()),
            port: number,
            protocol: Some("TCP".into()),
            ..Default::default()
        }
    }

    fn pod_address(ip: &str, pod: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.into(),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".into()),
                namespace: Some("ns".into()),
                name: Some(pod.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn plain_address(ip: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.into(),
            ..Default::default()
        }
    }

    fn endpoints(subsets: Vec<EndpointSubset>) -> Endpoints {
        Endpoints {
            metadata: meta(Some("ns"), "svc"),
            subsets: Some(subsets),
        }
    }

    fn subset(
        ports: Vec<EndpointPort>,
        ready: Vec<EndpointAddress>,
        not_ready: Vec<EndpointAddress>,
    ) -> EndpointSubset {
        EndpointSubset {
            ports: Some(ports),
            addresses: Some(ready),
            not_ready_addresses: Some(not_ready),
        }
    }

    fn container(name: &str, ports: &[(&str, i32)]) -> Container {
        Container {
            name: name.into(),
            image: Some(format!("{name}:latest")),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, number)| ContainerPort {
                        name: Some((*port_name).into()),
                        container_port: *number,
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn pod(name: &str, ip: &str, containers: Vec<Container>, init: Vec<Container>) -> Pod {
        Pod {
            metadata: meta(Some("ns"), name),
            spec: Some(PodSpec {
                containers,
                init_containers: Some(init),
                node_name: Some("node-1".into()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some(ip.into()),
                phase: Some("Running".into()),
                ..Default::default()
            }),
        }
    }

    fn target<'a>(tg: &'a TargetGroup, address: &str) -> &'a LabelSet {
        tg.targets
            .iter()
            .find(|t| t.get(ADDRESS_LABEL) == Some(address))
            .unwrap_or_else(|| panic!("no target {address}"))
    }

    #[test]
    fn service_pod_and_container_scenario() {
        let f = Fixture::new();
        f.services
            .apply(Service {
                metadata: ObjectMeta {
                    labels: labels(&[("team", "infra")]),
                    ..meta(Some("ns"), "svc")
                },
                ..Default::default()
            })
            .unwrap();
        f.pods
            .apply(pod("pod1", "10.0.0.5", vec![container("app", &[("web", 80)])], Vec::new()))
            .unwrap();

        let eps = endpoints(vec![subset(
            vec![port("http", 80)],
            vec![pod_address("10.0.0.5", "pod1")],
            Vec::new(),
        )]);

        let tg = build_target_group(&f.caches(), &eps);

        assert_eq!(tg.source, "endpoints/ns/svc");
        assert_eq!(tg.labels.get(NAMESPACE_LABEL), Some("ns"));
        assert_eq!(tg.labels.get("__meta_kubernetes_service_label_team"), Some("infra"));
        assert_eq!(tg.labels.get("__meta_kubernetes_endpoints_name"), Some("svc"));
        assert_eq!(tg.targets.len(), 1);

        let t = target(&tg, "10.0.0.5:80");
        assert_eq!(t.get(ENDPOINT_PORT_NAME), Some("http"));
        assert_eq!(t.get(ENDPOINT_PORT_PROTOCOL), Some("TCP"));
        assert_eq!(t.get(ENDPOINT_READY), Some("true"));
        assert_eq!(t.get(ENDPOINT_TARGET_KIND), Some("Pod"));
        assert_eq!(t.get(ENDPOINT_TARGET_NAME), Some("pod1"));
        assert_eq!(t.get(CONTAINER_NAME), Some("app"));
        assert_eq!(t.get(CONTAINER_PORT_NUMBER), Some("80"));
        assert_eq!(t.get(CONTAINER_PORT_NAME), Some("web"));
        assert_eq!(t.get(CONTAINER_INIT), Some("false"));
        assert_eq!(t.get(POD_IP), Some("10.0.0.5"));
    }

    #[test]
    fn not_ready_overrides_ready_for_same_address() {
        let f = Fixture::new();
        let eps = endpoints(vec![subset(
            vec![port("http", 80)],
            vec![plain_address("10.0.0.1")],
            vec![plain_address("10.0.0.1")],
        )]);

        let tg = build_target_group(&f.caches(), &eps);

        assert_eq!(tg.targets.len(), 1);
        assert_eq!(target(&tg, "10.0.0.1:80").get(ENDPOINT_READY), Some("false"));
    }

    #[test]
    fn every_port_address_pair_is_a_target() {
        let f = Fixture::new();
        let eps = endpoints(vec![
            subset(
                vec![port("http", 80), port("metrics", 9090)],
                vec![plain_address("10.0.0.1")],
                vec![plain_address("10.0.0.2")],
            ),
            subset(vec![port("grpc", 50051)], vec![plain_address("10.0.1.1")], Vec::new()),
        ]);

        let tg = build_target_group(&f.caches(), &eps);

        assert_eq!(tg.targets.len(), 5);
        assert_eq!(target(&tg, "10.0.0.2:9090").get(ENDPOINT_READY), Some("false"));
        assert_eq!(target(&tg, "10.0.1.1:50051").get(ENDPOINT_PORT_NAME), Some("grpc"));
    }

    #[test]
    fn ports_sharing_a_number_are_distinct_targets() {
        let f = Fixture::new();
        let dns_udp = EndpointPort {
            protocol: Some("UDP".into()),
            ..port("dns", 53)
        };
        let eps = endpoints(vec![subset(
            vec![dns_udp, port("dns-tcp", 53)],
            vec![plain_address("10.0.0.10")],
            Vec::new(),
        )]);

        let tg = build_target_group(&f.caches(), &eps);

        let mut protocols: Vec<_> = tg
            .targets
            .iter()
            .map(|t| t.get(ENDPOINT_PORT_PROTOCOL).unwrap())
            .collect();
        protocols.sort_unstable();
        assert_eq!(protocols, vec!["TCP", "UDP"]);
    }

    #[test]
    fn same_address_in_two_subsets_is_kept_twice() {
        let f = Fixture::new();
        let eps = endpoints(vec![
            subset(vec![port("http", 80)], vec![plain_address("10.0.0.1")], Vec::new()),
            subset(vec![port("web", 80)], Vec::new(), vec![plain_address("10.0.0.1")]),
        ]);

        let tg = build_target_group(&f.caches(), &eps);

        let names: Vec<_> = tg
            .targets
            .iter()
            .map(|t| (t.get(ENDPOINT_PORT_NAME).unwrap(), t.get(ENDPOINT_READY).unwrap()))
            .collect();
        assert_eq!(names, vec![("http", "true"), ("web", "false")]);
    }

    #[test]
    fn unmatched_container_ports_become_targets() {
        let f = Fixture::new();
        f.pods
            .apply(pod(
                "pod1",
                "10.0.0.5",
                vec![container("app", &[("web", 80), ("admin", 8080)])],
                vec![container("setup", &[("debug", 9000)])],
            ))
            .unwrap();

        let eps = endpoints(vec![subset(
            vec![port("http", 80)],
            vec![pod_address("10.0.0.5", "pod1")],
            Vec::new(),
        )]);

        let tg = build_target_group(&f.caches(), &eps);

        assert_eq!(tg.targets.len(), 3);

        let admin = target(&tg, "10.0.0.5:8080");
        assert_eq!(admin.get(CONTAINER_NAME), Some("app"));
        assert_eq!(admin.get(CONTAINER_PORT_NAME), Some("admin"));
        assert_eq!(admin.get(CONTAINER_PORT_NUMBER), Some("8080"));
        assert_eq!(admin.get(CONTAINER_INIT), Some("false"));
        assert_eq!(admin.get("__meta_kubernetes_pod_name"), Some("pod1"));
        assert!(!admin.contains(ENDPOINT_PORT_NAME));
        assert!(!admin.contains(ENDPOINT_READY));

        let debug = target(&tg, "10.0.0.5:9000");
        assert_eq!(debug.get(CONTAINER_NAME), Some("setup"));
        assert_eq!(debug.get(CONTAINER_INIT), Some("true"));
    }

    #[test]
    fn pod_without_ip_gets_no_container_targets() {
        let f = Fixture::new();
        f.pods
            .apply(pod("pod1", "", vec![container("app", &[("admin", 8080)])], Vec::new()))
            .unwrap();

        let eps = endpoints(vec![subset(
            vec![port("http", 80)],
            vec![pod_address("10.0.0.5", "pod1")],
            Vec::new(),
        )]);

        let tg = build_target_group(&f.caches(), &eps);

        assert_eq!(tg.targets.len(), 1);
        assert!(!target(&tg, "10.0.0.5:80").contains(CONTAINER_NAME));
    }

    #[test]
    fn first_matching_container_port_wins() {
        let f = Fixture::new();
        f.pods
            .apply(pod(
                "pod1",
                "10.0.0.5",
                vec![container("first", &[("a", 80)]), container("second", &[("b", 80)])],
                Vec::new(),
            ))
            .unwrap();

        let eps = endpoints(vec![subset(
            vec![port("http", 80)],
            vec![pod_address("10.0.0.5", "pod1")],
            Vec::new(),
        )]);

        let tg = build_target_group(&f.caches(), &eps);

        assert_eq!(target(&tg, "10.0.0.5:80").get(CONTAINER_NAME), Some("first"));
    }

    #[test]
    fn unresolved_pod_is_emitted_as_plain_target() {
        let f = Fixture::new();
        let eps = endpoints(vec![subset(
            vec![port("http", 80)],
            vec![pod_address("10.0.0.5", "missing")],
            Vec::new(),
        )]);

        let tg = build_target_group(&f.caches(), &eps);

        assert_eq!(tg.targets.len(), 1);
        let t = target(&tg, "10.0.0.5:80");
        assert_eq!(t.get(ENDPOINT_TARGET_NAME), Some("missing"));
        assert!(!t.contains(POD_IP));
    }

    #[test]
    fn node_metadata_from_node_name_or_node_ref() {
        let f = Fixture::new();
        for name in ["node-1", "node-2"] {
            f.nodes
                .apply(Node {
                    metadata: ObjectMeta {
                        labels: labels(&[("zone", name)]),
                        ..meta(None, name)
                    },
                    ..Default::default()
                })
                .unwrap();
        }

        let by_name = EndpointAddress {
            ip: "10.0.0.1".into(),
            node_name: Some("node-1".into()),
            hostname: Some("host-a".into()),
            ..Default::default()
        };
        let by_ref = EndpointAddress {
            ip: "192.168.0.2".into(),
            target_ref: Some(ObjectReference {
                kind: Some("Node".into()),
                name: Some("node-2".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let eps = endpoints(vec![subset(vec![port("http", 80)], vec![by_name, by_ref], Vec::new())]);

        let tg = build_target_group(&f.caches(), &eps);

        let a = target(&tg, "10.0.0.1:80");
        assert_eq!(a.get(ENDPOINT_NODE_NAME), Some("node-1"));
        assert_eq!(a.get(ENDPOINT_HOSTNAME), Some("host-a"));
        assert_eq!(a.get("__meta_kubernetes_node_name"), Some("node-1"));
        assert_eq!(a.get("__meta_kubernetes_node_label_zone"), Some("node-1"));

        let b = target(&tg, "192.168.0.2:80");
        assert_eq!(b.get(ENDPOINT_TARGET_KIND), Some("Node"));
        assert_eq!(b.get("__meta_kubernetes_node_label_zone"), Some("node-2"));

        let plain = build_target_group(&f.caches_without_metadata(), &eps);
        assert!(!target(&plain, "10.0.0.1:80").contains("__meta_kubernetes_node_name"));
    }

    #[test]
    fn namespace_metadata_only_when_enabled() {
        let f = Fixture::new();
        f.namespaces
            .apply(Namespace {
                metadata: ObjectMeta {
                    labels: labels(&[("env", "prod")]),
                    ..meta(None, "ns")
                },
                ..Default::default()
            })
            .unwrap();

        let eps = endpoints(Vec::new());

        let tg = build_target_group(&f.caches(), &eps);
        assert_eq!(tg.labels.get("__meta_kubernetes_namespace_label_env"), Some("prod"));
        assert!(tg.targets.is_empty());

        let tg = build_target_group(&f.caches_without_metadata(), &eps);
        assert!(!tg.labels.contains("__meta_kubernetes_namespace_label_env"));
    }

    #[test]
    fn lookup_failures_only_skip_enrichment() {
        let f = Fixture::new();
        let caches = Caches {
            services: Arc::new(FailingStore),
            pods: Arc::new(FailingStore),
            nodes: Some(Arc::new(FailingStore)),
            namespaces: Some(Arc::new(FailingStore)),
            ..f.caches()
        };

        let mut addr = pod_address("10.0.0.5", "pod1");
        addr.node_name = Some("node-1".into());
        let eps = endpoints(vec![subset(vec![port("http", 80)], vec![addr], Vec::new())]);

        let tg = build_target_group(&caches, &eps);

        assert_eq!(tg.labels.get(NAMESPACE_LABEL), Some("ns"));
        assert_eq!(tg.targets.len(), 1);
        assert_eq!(target(&tg, "10.0.0.5:80").get(ENDPOINT_READY), Some("true"));
    }

    #[test]
    fn over_capacity_marker_does_not_change_targets() {
        let f = Fixture::new();
        let mut eps = endpoints(vec![subset(
            vec![port("http", 80)],
            vec![plain_address("10.0.0.1")],
            Vec::new(),
        )]);
        eps.metadata.labels = labels(&[(OVER_CAPACITY_LABEL, "truncated")]);

        let tg = build_target_group(&f.caches(), &eps);

        assert_eq!(tg.targets.len(), 1);
        assert_eq!(
            tg.labels.get("__meta_kubernetes_endpoints_label_endpoints_kubernetes_io_over_capacity"),
            Some("truncated")
        );
    }

    #[test]
    fn building_twice_is_identical() {
        let f = Fixture::new();
        f.pods
            .apply(pod("pod1", "10.0.0.5", vec![container("app", &[("a", 8080), ("b", 8081)])], Vec::new()))
            .unwrap();
        f.pods
            .apply(pod("pod2", "10.0.0.6", vec![container("app", &[("a", 8080)])], Vec::new()))
            .unwrap();

        let eps = endpoints(vec![subset(
            vec![port("http", 80)],
            vec![pod_address("10.0.0.5", "pod1"), pod_address("10.0.0.6", "pod2")],
            Vec::new(),
        )]);

        let caches = f.caches();
        assert_eq!(
            build_target_group(&caches, &eps),
            build_target_group(&caches, &eps)
        );
    }

    #[test]
    fn ipv6_addresses_are_bracketed() {
        let f = Fixture::new();
        let eps = endpoints(vec![subset(
            vec![port("http", 80)],
            vec![plain_address("2001:db8::1")],
            Vec::new(),
        )]);

        let tg = build_target_group(&f.caches(), &eps);

        assert!(tg.targets.iter().any(|t| t.get(ADDRESS_LABEL) == Some("[2001:db8::1]:80")));
    }
}
