//! Domain reconciliation
//!
//! Each reconcile runs one fiber on the engine:
//! 1. list the domain's pods into its presence info
//! 2. roll every server whose pod predates `spec.restartVersion`
//! 3. clear a failure recorded by an earlier run
//! 4. write the domain status

use super::clock::{Clock, SystemClock};
use super::events::EventSinkProvider;
use super::pods::{list_pods, roll_if_needed, PodContext};
use super::presence::{DomainPresenceInfo, DomainPresenceRegistry, DomainTopology};
use super::rolling::RollingContext;
use super::status::{update_domain_status, KubeStatusSink, StatusContext};
use crate::calls::RequestBuilder;
use crate::config::OperatorConfig;
use crate::crd::Domain;
use crate::server::{SharedMetrics, ShutdownSignal};
use crate::work::{keys, Engine, FiberError, NextAction, Packet, Step, StepRef};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Domain missing namespace")]
    MissingNamespace,

    #[error("Reconcile fiber failed: {0}")]
    Fiber(#[from] FiberError),
}

pub struct Context {
    pub engine: Arc<Engine>,
    /// Builder without a status sink; each domain gets a copy bound to its own sink
    pub requests: RequestBuilder,
    pub registry: Arc<DomainPresenceRegistry>,
    pub events: Arc<dyn EventSinkProvider>,
    pub clock: Arc<dyn Clock>,
    pub stopping: ShutdownSignal,
    pub poll_delay: Duration,
    pub resync_interval: Duration,
    pub error_requeue: Duration,
    pub conflict_budget: u32,
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        engine: Arc<Engine>,
        requests: RequestBuilder,
        registry: Arc<DomainPresenceRegistry>,
        events: Arc<dyn EventSinkProvider>,
        stopping: ShutdownSignal,
        config: &OperatorConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            engine,
            requests,
            registry,
            events,
            clock: Arc::new(SystemClock),
            stopping,
            poll_delay: config.poll_delay,
            resync_interval: config.resync_interval,
            error_requeue: config.error_requeue,
            conflict_budget: config.retry.max_retries,
            metrics,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Reconcile a Domain
///
/// A domain being deleted is dropped from the registry; its pods are garbage collected by
/// Kubernetes through their owner references.
pub async fn reconcile(domain: Arc<Domain>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = domain.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let domain_uid = domain.domain_uid();

    if domain.metadata.deletion_timestamp.is_some() {
        info!(domain = %domain_uid, namespace = %namespace, "Domain deleted, forgetting it");
        ctx.registry.remove(&namespace, &domain_uid);
        return Ok(Action::await_change());
    }

    let start = Instant::now();
    info!(
        domain = %domain_uid,
        namespace = %namespace,
        restart_version = %domain.restart_version(),
        "Reconciling Domain"
    );

    let presence = ctx.registry.get_or_create(&namespace, &domain_uid);
    presence.set_domain(domain.clone());

    let events = ctx.events.for_domain(&domain);
    let status = Arc::new(StatusContext {
        requests: ctx.requests.clone(),
        clock: ctx.clock.clone(),
        conflict_budget: ctx.conflict_budget,
    });
    let status_sink = Arc::new(KubeStatusSink::new(
        presence.clone(),
        ctx.engine.clone(),
        status.clone(),
        events.clone(),
    ));
    let pods = Arc::new(PodContext {
        requests: ctx.requests.clone().with_status_sink(status_sink),
        poll_delay: ctx.poll_delay,
        stopping: ctx.stopping.clone(),
        events: events.clone(),
    });
    let rolling = Arc::new(RollingContext {
        events,
        stopping: ctx.stopping.clone(),
        poll_delay: ctx.poll_delay,
        metrics: ctx.metrics.clone(),
    });

    let write_status = update_domain_status(status, None);
    let clear_failure: StepRef = Arc::new(ClearFailureStep {
        next: Some(write_status),
    });
    let roll = roll_if_needed(pods.clone(), rolling, Some(clear_failure));
    let head = list_pods(&pods, &presence, Some(roll));

    let mut packet = Packet::new();
    packet.put_spi(presence.clone());
    packet.put(keys::DOMAIN_TOPOLOGY, DomainTopology::from_domain(&domain));

    let outcome = ctx.engine.run(head, packet).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.observe_reconcile(start.elapsed().as_secs_f64());
    }

    match outcome.result {
        Ok(()) => {
            debug!(
                domain = %domain_uid,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Domain reconciled"
            );
            Ok(Action::requeue(ctx.resync_interval))
        }
        Err(e) => {
            presence.set_rolling(false);
            Err(e.into())
        }
    }
}

/// Requeue delay after a failed reconcile
///
/// Authorization failures need an RBAC fix and are retried less often; a fiber cancelled by
/// shutdown is not retried.
pub fn error_policy(domain: Arc<Domain>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(domain = %domain.domain_uid(), error = %error, "Reconcile failed");
    match error {
        ReconcileError::Fiber(e) if is_cancelled(e) => Action::await_change(),
        ReconcileError::Fiber(e) if is_not_authorized(e) => Action::requeue(ctx.error_requeue * 6),
        _ => Action::requeue(ctx.error_requeue),
    }
}

fn is_cancelled(error: &FiberError) -> bool {
    match error {
        FiberError::Cancelled => true,
        FiberError::ChildrenFailed(children) => children.iter().all(is_cancelled),
        _ => false,
    }
}

fn is_not_authorized(error: &FiberError) -> bool {
    match error {
        FiberError::NotAuthorized { .. } => true,
        FiberError::ChildrenFailed(children) => children.iter().any(is_not_authorized),
        _ => false,
    }
}

/// The run got this far, so an earlier failure no longer applies
struct ClearFailureStep {
    next: Option<StepRef>,
}

impl Step for ClearFailureStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        if let Some(presence) = packet.spi::<DomainPresenceInfo>() {
            presence.clear_failure();
        }
        NextAction::next(self.next.as_ref())
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod tests;
