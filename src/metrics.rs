//! Event counters for the change router.

use std::fmt;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter};

/// The resource kind an event was observed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Endpoints objects.
    Endpoints,
    /// Service objects.
    Service,
    /// Pod objects.
    Pod,
    /// Node objects.
    Node,
    /// Namespace objects.
    Namespace,
}

impl Role {
    /// Label value for this role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Endpoints => "endpoints",
            Self::Service => "service",
            Self::Pod => "pod",
            Self::Node => "node",
            Self::Namespace => "namespace",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of change an event reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// An object appeared.
    Add,
    /// An object changed.
    Update,
    /// An object disappeared.
    Delete,
}

impl EventType {
    /// Label value for this event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Sink for per-role, per-event-type counters.
pub trait EventMetrics: Send + Sync {
    /// Counts one event.
    fn inc(&self, role: Role, event: EventType);
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl EventMetrics for NoopMetrics {
    fn inc(&self, _role: Role, _event: EventType) {}
}

/// Counts events with an OpenTelemetry counter.
///
/// Attributes:
/// - `role`: endpoints, service, pod, node, namespace
/// - `event`: add, update, delete
#[derive(Clone)]
pub struct OtelEventMetrics {
    events: Counter<u64>,
}

impl OtelEventMetrics {
    /// Registers the event counter on `meter`.
    #[must_use]
    pub fn new(meter: &Meter) -> Self {
        let events = meter
            .u64_counter("prometheus_sd_kubernetes_events_total")
            .with_description("The number of Kubernetes events handled")
            .with_unit("{events}")
            .build();

        Self { events }
    }
}

impl EventMetrics for OtelEventMetrics {
    fn inc(&self, role: Role, event: EventType) {
        self.events.add(
            1,
            &[
                KeyValue::new("role", role.as_str()),
                KeyValue::new("event", event.as_str()),
            ],
        );
    }
}
