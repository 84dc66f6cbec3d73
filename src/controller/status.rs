//! Domain status updates
//!
//! The status is computed from the presence info and written with a merge patch that carries
//! the last seen `resourceVersion`. A 409 reroutes to a step that re-reads the Domain and
//! computes the status again, a bounded number of times.

use super::clock::Clock;
use super::events::{DomainEvent, EventSink};
use super::presence::{is_pod_ready, ClusterTopology, DomainPresenceInfo, DomainTopology};
use crate::calls::{
    KubernetesApiResponse, PatchBody, RequestBuilder, ResourceDescriptor, ResponseHandler,
    ResponseStep, StatusSink,
};
use crate::crd::{
    Domain, DomainCondition, DomainConditionType, DomainStatus, ServerStatus, CLUSTER_NAME_LABEL,
};
use crate::work::{Engine, FiberError, NextAction, Packet, Step, StepRef};
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub const STATE_RUNNING: &str = "RUNNING";
pub const STATE_STARTING: &str = "STARTING";
pub const STATE_SHUTTING_DOWN: &str = "SHUTTING_DOWN";

/// Collaborators of status update fibers
pub struct StatusContext {
    /// Must not carry a status sink, or a failed update would schedule another one
    pub requests: RequestBuilder,
    pub clock: Arc<dyn Clock>,
    /// Re-reads allowed after 409 responses
    pub conflict_budget: u32,
}

/// Status the domain should report, given what is observed now
pub fn compute_status(presence: &DomainPresenceInfo, domain: &Domain, now: &str) -> DomainStatus {
    let mut status = domain.status.clone().unwrap_or_default();

    status.servers = presence
        .servers()
        .iter()
        .map(|(name, pod)| {
            let ready = presence.is_server_ready(name);
            let state = if presence.is_server_pod_being_deleted(name)
                || pod.metadata.deletion_timestamp.is_some()
            {
                STATE_SHUTTING_DOWN
            } else if is_pod_ready(pod) {
                STATE_RUNNING
            } else {
                STATE_STARTING
            };
            ServerStatus {
                server_name: name.clone(),
                cluster_name: pod.labels().get(CLUSTER_NAME_LABEL).cloned(),
                state: Some(state.to_string()),
                ready,
            }
        })
        .collect();

    let topology = DomainTopology::from_domain(domain);
    let short_clusters: Vec<&str> = domain
        .spec
        .clusters
        .iter()
        .map(|c| c.cluster_name.as_str())
        .filter(|cluster| {
            presence
                .ready_servers_in_cluster(cluster, Some(&topology as &dyn ClusterTopology))
                .len()
                < domain.min_available(cluster)
        })
        .collect();
    let available = if !short_clusters.is_empty() {
        DomainCondition::new(DomainConditionType::Available, false)
            .with_reason("ServersNotReady")
            .with_message(format!(
                "Too few Ready servers in cluster(s) {}",
                short_clusters.join(", ")
            ))
    } else if presence.ready_servers().is_empty() {
        DomainCondition::new(DomainConditionType::Available, false)
            .with_reason("ServersNotReady")
            .with_message("No server is Ready")
    } else {
        DomainCondition::new(DomainConditionType::Available, true).with_reason("ServersReady")
    };
    status.set_condition(available, now);

    if presence.is_rolling() {
        status.set_condition(
            DomainCondition::new(DomainConditionType::Rolling, true).with_reason("RestartVersion"),
            now,
        );
    } else {
        status.remove_condition(DomainConditionType::Rolling);
    }

    match presence.failure() {
        Some(failure) => status.record_failure(&failure.reason, &failure.message, now),
        None => {
            status.remove_condition(DomainConditionType::Failed);
            status.reason = None;
            status.message = None;
        }
    }

    status.observed_generation = domain.metadata.generation;
    status
}

/// Merge patch writing `status` when `resource_version` is still current
///
/// Absent optional fields are sent as null so that stale values are removed.
pub fn status_patch(status: &DomainStatus, resource_version: Option<&str>) -> serde_json::Result<Value> {
    let mut body = serde_json::to_value(status)?;
    if let Value::Object(fields) = &mut body {
        for list in ["conditions", "servers"] {
            fields
                .entry(list)
                .or_insert_with(|| Value::Array(Vec::new()));
        }
        for scalar in ["reason", "message", "observedGeneration"] {
            fields.entry(scalar).or_insert(Value::Null);
        }
    }
    Ok(serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "status": body,
    }))
}

/// Typed view of a Domain returned by the API
pub fn to_domain(object: &DynamicObject) -> Option<Domain> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .ok()
}

/// Step writing the domain status, then continuing with `next`
pub fn update_domain_status(ctx: Arc<StatusContext>, next: Option<StepRef>) -> StepRef {
    let conflicts_left = ctx.conflict_budget;
    Arc::new(DomainStatusUpdateStep {
        ctx,
        next,
        conflicts_left,
    })
}

struct DomainStatusUpdateStep {
    ctx: Arc<StatusContext>,
    next: Option<StepRef>,
    conflicts_left: u32,
}

impl Step for DomainStatusUpdateStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        let Some(presence) = packet.spi::<DomainPresenceInfo>() else {
            return NextAction::Terminate(FiberError::MissingComponent("DomainPresenceInfo"));
        };
        let Some(domain) = presence.domain() else {
            debug!(domain = %presence.domain_uid(), "Domain not seen yet, skipping status update");
            return NextAction::next(self.next.as_ref());
        };

        let status = compute_status(&presence, &domain, &self.ctx.clock.timestamp());
        if domain.status.as_ref() == Some(&status) {
            return NextAction::next(self.next.as_ref());
        }

        let body = match status_patch(&status, domain.metadata.resource_version.as_deref()) {
            Ok(body) => body,
            Err(e) => return NextAction::Terminate(FiberError::InvalidState(e.to_string())),
        };

        let mut response = ResponseStep::new(StatusPatched, self.next.clone());
        if self.conflicts_left > 0 {
            response = response.with_conflict_step(Arc::new(RereadDomainStep {
                ctx: self.ctx.clone(),
                next: self.next.clone(),
                conflicts_left: self.conflicts_left - 1,
            }));
        }
        NextAction::Next(self.ctx.requests.patch_status(
            ResourceDescriptor::DOMAIN,
            Some(presence.namespace()),
            &domain.name_any(),
            PatchBody::merge(body),
            response,
        ))
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }
}

/// Keeps the patched Domain, so the next update starts from its resource version
struct StatusPatched;

impl ResponseHandler for StatusPatched {
    fn on_success(
        &self,
        step: &ResponseStep,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
    ) -> NextAction {
        if let (Some(presence), Some(domain)) = (
            packet.spi::<DomainPresenceInfo>(),
            response.as_object().and_then(to_domain),
        ) {
            presence.set_domain(Arc::new(domain));
        }
        NextAction::next(step.next())
    }
}

/// Conflict step: fetch the current Domain, then try the update again
struct RereadDomainStep {
    ctx: Arc<StatusContext>,
    next: Option<StepRef>,
    conflicts_left: u32,
}

impl Step for RereadDomainStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        let Some(presence) = packet.spi::<DomainPresenceInfo>() else {
            return NextAction::Terminate(FiberError::MissingComponent("DomainPresenceInfo"));
        };
        let Some(domain) = presence.domain() else {
            return NextAction::next(self.next.as_ref());
        };
        let retry: StepRef = Arc::new(DomainStatusUpdateStep {
            ctx: self.ctx.clone(),
            next: self.next.clone(),
            conflicts_left: self.conflicts_left,
        });
        NextAction::Next(self.ctx.requests.get(
            ResourceDescriptor::DOMAIN,
            Some(presence.namespace()),
            &domain.name_any(),
            ResponseStep::new(DomainReread, Some(retry)),
        ))
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }
}

struct DomainReread;

impl ResponseHandler for DomainReread {
    fn on_success(
        &self,
        step: &ResponseStep,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
    ) -> NextAction {
        let Some(domain) = response.as_object().and_then(to_domain) else {
            return NextAction::Terminate(FiberError::InvalidState(
                "re-read of the Domain returned no Domain".to_string(),
            ));
        };
        if let Some(presence) = packet.spi::<DomainPresenceInfo>() {
            presence.set_domain(Arc::new(domain));
        }
        NextAction::next(step.next())
    }
}

/// Records failures on the domain and publishes them right away
pub struct KubeStatusSink {
    presence: Arc<DomainPresenceInfo>,
    engine: Arc<Engine>,
    status: Arc<StatusContext>,
    events: Arc<dyn EventSink>,
}

impl KubeStatusSink {
    pub fn new(
        presence: Arc<DomainPresenceInfo>,
        engine: Arc<Engine>,
        status: Arc<StatusContext>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        KubeStatusSink {
            presence,
            engine,
            status,
            events,
        }
    }
}

impl StatusSink for KubeStatusSink {
    fn record_failure_condition(&self, reason: &str, message: &str) {
        self.presence.record_failure(reason, message);
        self.events.emit(DomainEvent::Failed {
            reason: reason.to_string(),
            message: message.to_string(),
        });

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(domain = %self.presence.domain_uid(), "No runtime, failure status not written");
            return;
        };
        let engine = self.engine.clone();
        let step = update_domain_status(self.status.clone(), None);
        let mut packet = Packet::new();
        packet.put_spi(self.presence.clone());
        let domain_uid = self.presence.domain_uid().to_string();
        runtime.spawn(async move {
            if let Err(e) = engine.run(step, packet).await.result {
                warn!(domain = %domain_uid, error = %e, "Failed to write failure status");
            }
        });
    }
}

#[cfg(test)]
#[path = "status_test.rs"]
mod tests;
