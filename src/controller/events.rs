//! Kubernetes events reported against a Domain
//!
//! Emitting never blocks the caller: the Kubernetes sink publishes on a spawned task and
//! only logs publication failures.

use crate::crd::Domain;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource};
use std::sync::Arc;
use tracing::{debug, warn};

pub const REPORTER: &str = "domain-operator";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    RollStarting { message: String },
    RollCompleted,
    PodCycleStarting { server_name: String, reason: String },
    Failed { reason: String, message: String },
}

impl DomainEvent {
    pub fn reason(&self) -> &'static str {
        match self {
            DomainEvent::RollStarting { .. } => "DomainRollStarting",
            DomainEvent::RollCompleted => "DomainRollCompleted",
            DomainEvent::PodCycleStarting { .. } => "PodCycleStarting",
            DomainEvent::Failed { .. } => "DomainFailed",
        }
    }

    pub fn note(&self) -> String {
        match self {
            DomainEvent::RollStarting { message } => message.clone(),
            DomainEvent::RollCompleted => "Rolling restart of the domain completed".to_string(),
            DomainEvent::PodCycleStarting {
                server_name,
                reason,
            } => format!("Replacing pod of server {server_name}: {reason}"),
            DomainEvent::Failed { reason, message } => format!("{reason}: {message}"),
        }
    }

    fn event_type(&self) -> EventType {
        match self {
            DomainEvent::Failed { .. } => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            DomainEvent::RollStarting { .. } | DomainEvent::RollCompleted => "Rolling",
            DomainEvent::PodCycleStarting { .. } => "Restarting",
            DomainEvent::Failed { .. } => "Reconciling",
        }
    }
}

/// Fire-and-forget event emission for one domain
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// Creates the event sink of a domain
pub trait EventSinkProvider: Send + Sync {
    fn for_domain(&self, domain: &Domain) -> Arc<dyn EventSink>;
}

/// Publishes events through the kube-rs recorder
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
    reference: ObjectReference,
}

impl KubeEventSink {
    pub fn new(recorder: Recorder, reference: ObjectReference) -> Self {
        KubeEventSink {
            recorder,
            reference,
        }
    }
}

impl EventSink for KubeEventSink {
    fn emit(&self, event: DomainEvent) {
        let recorder = self.recorder.clone();
        let reference = self.reference.clone();
        debug!(reason = event.reason(), note = %event.note(), "Emitting domain event");
        tokio::spawn(async move {
            let published = recorder
                .publish(
                    &Event {
                        type_: event.event_type(),
                        reason: event.reason().to_string(),
                        note: Some(event.note()),
                        action: event.action().to_string(),
                        secondary: None,
                    },
                    &reference,
                )
                .await;
            if let Err(e) = published {
                warn!(error = %e, reason = event.reason(), "Failed to publish domain event");
            }
        });
    }
}

pub struct KubeEventSinkProvider {
    recorder: Recorder,
}

impl KubeEventSinkProvider {
    pub fn new(client: Client) -> Self {
        KubeEventSinkProvider {
            recorder: Recorder::new(client, REPORTER.into()),
        }
    }
}

impl EventSinkProvider for KubeEventSinkProvider {
    fn for_domain(&self, domain: &Domain) -> Arc<dyn EventSink> {
        Arc::new(KubeEventSink::new(
            self.recorder.clone(),
            domain.object_ref(&()),
        ))
    }
}

/// In-memory sink for tests
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockEventSink {
    events: Arc<std::sync::Mutex<Vec<DomainEvent>>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.emitted().iter().filter(|e| e.reason() == reason).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl EventSink for MockEventSink {
    fn emit(&self, event: DomainEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
impl EventSinkProvider for MockEventSink {
    fn for_domain(&self, _domain: &Domain) -> Arc<dyn EventSink> {
        Arc::new(self.clone())
    }
}
