//! Pod watcher feeding the presence registry

use super::presence::DomainPresenceRegistry;
use crate::crd::CREATED_BY_OPERATOR_LABEL;
use crate::server::ShutdownSignal;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Label selector matching every pod the operator created
pub fn operator_pod_selector() -> String {
    format!("{CREATED_BY_OPERATOR_LABEL}=true")
}

/// Watch operator-created pods until shutdown, applying every event to the registry
///
/// The initial list arrives as `InitApply` events, so a restarted operator rebuilds its
/// presence info before the first reconcile needs it. Every relist after a desync replaces
/// the cached pods, dropping those deleted while the watch was down.
pub async fn watch_pods(
    client: Client,
    namespace: Option<String>,
    registry: Arc<DomainPresenceRegistry>,
    mut stopping: ShutdownSignal,
) {
    let pods: Api<Pod> = match &namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let config = watcher::Config::default().labels(&operator_pod_selector());
    let mut events = watcher(pods, config).default_backoff().boxed();

    let mut applier = PodEventApplier::new(registry);
    info!(namespace = ?namespace, "Watching server pods");
    loop {
        tokio::select! {
            _ = stopping.stopped() => {
                info!("Pod watcher stopping");
                return;
            }
            event = events.next() => match event {
                Some(Ok(event)) => applier.apply(event),
                Some(Err(e)) => warn!(error = %e, "Pod watch failed, backing off"),
                None => {
                    warn!("Pod watch stream ended");
                    return;
                }
            }
        }
    }
}

/// Applies watch events to the registry, buffering relists until they are complete
pub struct PodEventApplier {
    registry: Arc<DomainPresenceRegistry>,
    relist: Option<Vec<Pod>>,
}

impl PodEventApplier {
    pub fn new(registry: Arc<DomainPresenceRegistry>) -> Self {
        PodEventApplier {
            registry,
            relist: None,
        }
    }

    pub fn apply(&mut self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Apply(pod) => self.registry.pod_applied(pod),
            watcher::Event::Delete(pod) => self.registry.pod_deleted(&pod),
            watcher::Event::Init => {
                debug!("Pod watch relisting");
                self.relist = Some(Vec::new());
            }
            watcher::Event::InitApply(pod) => match &mut self.relist {
                Some(pods) => pods.push(pod),
                None => self.registry.pod_applied(pod),
            },
            watcher::Event::InitDone => {
                let pods = self.relist.take().unwrap_or_default();
                debug!(pods = pods.len(), "Pod watch relist done");
                self.registry.replace_pods(pods);
            }
        }
    }
}
