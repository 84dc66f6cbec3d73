//! Server pod step chains
//!
//! - listing the pods of a domain into its presence info
//! - restarting one server: delete, wait for removal, recreate, wait for Ready
//! - starting a rolling restart of every server whose pod predates the restart version

use super::events::{DomainEvent, EventSink};
use super::presence::{cluster_name_of, server_name_of, DomainPresenceInfo};
use super::rolling::{roll_servers, RollingContext};
use super::watcher::operator_pod_selector;
use crate::calls::failure::{HTTP_CONFLICT, HTTP_NOT_FOUND};
use crate::calls::{
    DeleteOptions, KubernetesApiResponse, ListOptions, RequestBuilder, ResourceDescriptor,
    ResponseHandler, ResponseStep,
};
use crate::crd::{DOMAIN_UID_LABEL, RESTART_VERSION_LABEL};
use crate::server::ShutdownSignal;
use crate::work::{keys, FiberError, NextAction, Packet, Step, StepAndPacket, StepRef};
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Collaborators of pod chains for one domain
pub struct PodContext {
    pub requests: RequestBuilder,
    pub poll_delay: Duration,
    pub stopping: ShutdownSignal,
    pub events: Arc<dyn EventSink>,
}

fn presence_of(packet: &Packet) -> Result<Arc<DomainPresenceInfo>, FiberError> {
    packet
        .spi::<DomainPresenceInfo>()
        .ok_or(FiberError::MissingComponent("DomainPresenceInfo"))
}

fn to_pod(object: &DynamicObject) -> Option<Pod> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .ok()
}

/// Selector for the operator-created pods of one domain
///
/// Pods the pod watcher cannot see must stay out of the presence info, or a restart would
/// wait forever for their removal.
pub fn domain_pod_selector(domain_uid: &str) -> String {
    format!("{},{DOMAIN_UID_LABEL}={domain_uid}", operator_pod_selector())
}

/// Step listing the domain's pods page by page into the presence info
pub fn list_pods(ctx: &PodContext, presence: &DomainPresenceInfo, next: Option<StepRef>) -> StepRef {
    ctx.requests.list(
        ResourceDescriptor::POD,
        Some(presence.namespace()),
        ListOptions::labels(domain_pod_selector(presence.domain_uid())),
        ResponseStep::new(PodsListed, next),
    )
}

struct PodsListed;

impl ResponseHandler for PodsListed {
    fn on_success(
        &self,
        step: &ResponseStep,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
    ) -> NextAction {
        let presence = match presence_of(packet) {
            Ok(presence) => presence,
            Err(e) => return NextAction::Terminate(e),
        };
        let pods = response.as_list().map(|list| list.items.as_slice()).unwrap_or_default();
        for pod in pods.iter().filter_map(to_pod) {
            if let Some(server) = server_name_of(&pod).map(ToString::to_string) {
                presence.set_server_pod(&server, Arc::new(pod));
            }
        }
        step.continue_list_or_next(packet, response)
    }
}

/// Servers whose pod was created for another restart version, with their cluster
pub fn servers_to_roll(
    presence: &DomainPresenceInfo,
    restart_version: &str,
) -> Vec<(String, Option<String>)> {
    presence
        .servers()
        .iter()
        .filter(|(_, pod)| {
            pod.labels().get(RESTART_VERSION_LABEL).map(String::as_str) != Some(restart_version)
        })
        .map(|(server, pod)| (server.clone(), cluster_name_of(pod).map(ToString::to_string)))
        .collect()
}

/// Definition of the pod replacing `pod`, stamped with `restart_version`
pub fn replacement_pod(pod: &Pod, restart_version: &str) -> serde_json::Result<DynamicObject> {
    let mut value = serde_json::to_value(pod)?;
    if let Some(metadata) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in [
            "resourceVersion",
            "uid",
            "creationTimestamp",
            "deletionTimestamp",
            "deletionGracePeriodSeconds",
            "managedFields",
        ] {
            metadata.remove(field);
        }
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| serde_json::json!({}));
        labels[RESTART_VERSION_LABEL] = serde_json::Value::from(restart_version);
    }
    if let Some(spec) = value.get_mut("spec").and_then(|s| s.as_object_mut()) {
        spec.remove("nodeName");
    }
    if let Some(object) = value.as_object_mut() {
        object.remove("status");
    }
    serde_json::from_value(value)
}

/// Chain restarting `server_name` from its current pod; `None` when the server has no pod
pub fn restart_server(
    ctx: &Arc<PodContext>,
    presence: &DomainPresenceInfo,
    server_name: &str,
    restart_version: &str,
    next: Option<StepRef>,
) -> Option<StepRef> {
    let pod = presence.server_pod(server_name)?;
    let replacement = match replacement_pod(&pod, restart_version) {
        Ok(replacement) => replacement,
        Err(e) => {
            warn!(server = %server_name, error = %e, "Cannot build replacement pod");
            return None;
        }
    };
    let namespace = presence.namespace();

    let wait_ready: StepRef = Arc::new(WaitForPodReadyStep {
        server_name: server_name.to_string(),
        ctx: ctx.clone(),
        next,
    });
    let create = ctx.requests.create(
        ResourceDescriptor::POD,
        Some(namespace),
        replacement,
        ResponseStep::new(
            PodCreated {
                server_name: server_name.to_string(),
            },
            Some(wait_ready),
        ),
    );
    let wait_removed: StepRef = Arc::new(WaitForPodRemovedStep {
        server_name: server_name.to_string(),
        old_uid: pod.uid(),
        ctx: ctx.clone(),
        next: Some(create),
    });
    let delete = ctx.requests.delete(
        ResourceDescriptor::POD,
        Some(namespace),
        &pod.name_any(),
        DeleteOptions::default(),
        ResponseStep::new(
            PodDeleted {
                server_name: server_name.to_string(),
            },
            Some(wait_removed),
        ),
    );
    Some(Arc::new(BeginPodRestartStep {
        server_name: server_name.to_string(),
        restart_version: restart_version.to_string(),
        events: ctx.events.clone(),
        next: Some(delete),
    }))
}

struct BeginPodRestartStep {
    server_name: String,
    restart_version: String,
    events: Arc<dyn EventSink>,
    next: Option<StepRef>,
}

impl Step for BeginPodRestartStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        let presence = match presence_of(packet) {
            Ok(presence) => presence,
            Err(e) => return NextAction::Terminate(e),
        };
        info!(
            domain = %presence.domain_uid(),
            server = %self.server_name,
            restart_version = %self.restart_version,
            "Restarting server pod"
        );
        presence.mark_being_deleted(&self.server_name);
        self.events.emit(DomainEvent::PodCycleStarting {
            server_name: self.server_name.clone(),
            reason: format!("restart version changed to {}", self.restart_version),
        });
        NextAction::next(self.next.as_ref())
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }

    fn detail(&self) -> Option<String> {
        Some(self.server_name.clone())
    }
}

struct PodDeleted {
    server_name: String,
}

impl ResponseHandler for PodDeleted {
    fn on_success(
        &self,
        step: &ResponseStep,
        _packet: &mut Packet,
        _response: &KubernetesApiResponse,
    ) -> NextAction {
        NextAction::next(step.next())
    }

    fn on_failure(
        &self,
        step: &ResponseStep,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
    ) -> NextAction {
        if response.status_code() == Some(HTTP_NOT_FOUND) {
            if let Ok(presence) = presence_of(packet) {
                presence.remove_server_pod(&self.server_name);
            }
            return NextAction::next(step.next());
        }
        let action = step.on_failure(packet, response);
        if matches!(action, NextAction::Terminate(_)) {
            if let Ok(presence) = presence_of(packet) {
                presence.clear_being_deleted(&self.server_name);
            }
        }
        action
    }
}

/// Polls until the old pod is gone from the presence info
struct WaitForPodRemovedStep {
    server_name: String,
    old_uid: Option<String>,
    ctx: Arc<PodContext>,
    next: Option<StepRef>,
}

impl Step for WaitForPodRemovedStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        let presence = match presence_of(packet) {
            Ok(presence) => presence,
            Err(e) => return NextAction::Terminate(e),
        };
        let removed = presence
            .server_pod(&self.server_name)
            .is_none_or(|pod| pod.uid() != self.old_uid);
        if removed {
            presence.clear_being_deleted(&self.server_name);
            return NextAction::next(self.next.as_ref());
        }
        if self.ctx.stopping.is_stopping() {
            return NextAction::Terminate(FiberError::Cancelled);
        }
        let this: StepRef = self.clone();
        NextAction::delay(self.ctx.poll_delay, Some(&this))
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }

    fn detail(&self) -> Option<String> {
        Some(self.server_name.clone())
    }
}

struct PodCreated {
    server_name: String,
}

impl ResponseHandler for PodCreated {
    fn on_success(
        &self,
        step: &ResponseStep,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
    ) -> NextAction {
        if let (Ok(presence), Some(pod)) = (
            presence_of(packet),
            response.as_object().and_then(to_pod),
        ) {
            // the watcher may already have a newer view of the pod
            if presence.server_pod(&self.server_name).is_none() {
                presence.set_server_pod(&self.server_name, Arc::new(pod));
            }
        }
        NextAction::next(step.next())
    }

    fn on_failure(
        &self,
        step: &ResponseStep,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
    ) -> NextAction {
        if response.status_code() == Some(HTTP_CONFLICT) {
            debug!(server = %self.server_name, "Replacement pod already exists");
            return NextAction::next(step.next());
        }
        step.on_failure(packet, response)
    }
}

/// Polls until the server reports Ready
struct WaitForPodReadyStep {
    server_name: String,
    ctx: Arc<PodContext>,
    next: Option<StepRef>,
}

impl Step for WaitForPodReadyStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        let presence = match presence_of(packet) {
            Ok(presence) => presence,
            Err(e) => return NextAction::Terminate(e),
        };
        if presence.is_server_ready(&self.server_name) {
            debug!(domain = %presence.domain_uid(), server = %self.server_name, "Server Ready");
            return NextAction::next(self.next.as_ref());
        }
        if self.ctx.stopping.is_stopping() {
            return NextAction::Terminate(FiberError::Cancelled);
        }
        let this: StepRef = self.clone();
        NextAction::delay(self.ctx.poll_delay, Some(&this))
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }

    fn detail(&self) -> Option<String> {
        Some(self.server_name.clone())
    }
}

/// Step rolling every out-of-date server, then continuing with `next`
pub fn roll_if_needed(
    pods: Arc<PodContext>,
    rolling: Arc<RollingContext>,
    next: Option<StepRef>,
) -> StepRef {
    Arc::new(RollIfNeededStep {
        pods,
        rolling,
        next,
    })
}

struct RollIfNeededStep {
    pods: Arc<PodContext>,
    rolling: Arc<RollingContext>,
    next: Option<StepRef>,
}

impl Step for RollIfNeededStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        let presence = match presence_of(packet) {
            Ok(presence) => presence,
            Err(e) => return NextAction::Terminate(e),
        };
        let Some(domain) = presence.domain() else {
            return NextAction::next(self.next.as_ref());
        };
        let restart_version = domain.restart_version();

        let mut work = BTreeMap::new();
        for (server, cluster) in servers_to_roll(&presence, restart_version) {
            let Some(chain) = restart_server(&self.pods, &presence, &server, restart_version, None)
            else {
                continue;
            };
            let mut member = packet.copy();
            member.put(keys::SERVER_NAME, server.clone());
            if let Some(cluster) = cluster {
                member.put(keys::CLUSTER_NAME, cluster);
            }
            work.insert(server, StepAndPacket::new(chain, member));
        }

        if work.is_empty() {
            debug!(domain = %presence.domain_uid(), "All server pods are up to date");
            return NextAction::next(self.next.as_ref());
        }
        NextAction::Next(roll_servers(work, self.next.clone(), self.rolling.clone()))
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }
}

#[cfg(test)]
#[path = "pods_test.rs"]
mod tests;
