//! Response side of a Kubernetes call
//!
//! The response step reads the stored response, hands it to a call-site
//! [`ResponseHandler`] and applies the shared policy around it:
//! - failures are retried through the packet's retry strategy
//! - 409 responses are rerouted to the conflict step when one is configured
//! - failures that are finally given up on are recorded through the status sink
//! - list continuations re-invoke the paired request step

use super::failure::{ApiFailure, StatusPayload, StatusSink, KUBERNETES_FAILURE_REASON};
use super::retry::{self, RetryDecision};
use crate::server::SharedMetrics;
use crate::work::{keys, same_step, FiberError, NextAction, Packet, Step, StepRef};
use kube::core::{DynamicObject, ObjectList};
use std::sync::Arc;
use tracing::{debug, warn};

/// Decoded body of a successful call
#[derive(Debug, Clone)]
pub enum ApiObject {
    Object(Box<DynamicObject>),
    List(ObjectList<DynamicObject>),
}

/// Result of one call, stored under [`keys::RESPONSE`]
#[derive(Debug, Clone)]
pub enum KubernetesApiResponse {
    Success { object: ApiObject, status_code: u16 },
    /// A bare `Status`, as returned by some deletes
    Status(StatusPayload),
    Failure(ApiFailure),
}

impl KubernetesApiResponse {
    pub fn object(object: DynamicObject, status_code: u16) -> Self {
        KubernetesApiResponse::Success {
            object: ApiObject::Object(Box::new(object)),
            status_code,
        }
    }

    pub fn list(list: ObjectList<DynamicObject>) -> Self {
        KubernetesApiResponse::Success {
            object: ApiObject::List(list),
            status_code: 200,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, KubernetesApiResponse::Failure(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            KubernetesApiResponse::Success { status_code, .. } => Some(*status_code),
            KubernetesApiResponse::Status(status) => Some(status.code),
            KubernetesApiResponse::Failure(failure) => failure.status_code,
        }
    }

    pub fn failure(&self) -> Option<&ApiFailure> {
        match self {
            KubernetesApiResponse::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&DynamicObject> {
        match self {
            KubernetesApiResponse::Success {
                object: ApiObject::Object(object),
                ..
            } => Some(object),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ObjectList<DynamicObject>> {
        match self {
            KubernetesApiResponse::Success {
                object: ApiObject::List(list),
                ..
            } => Some(list),
            _ => None,
        }
    }

    /// Continue token of a partial list; empty tokens count as absent
    pub fn continue_token(&self) -> Option<&str> {
        self.as_list()
            .and_then(|list| list.metadata.continue_.as_deref())
            .filter(|token| !token.is_empty())
    }

    /// Label for metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            KubernetesApiResponse::Failure(failure) if failure.timed_out => "timeout",
            KubernetesApiResponse::Failure(_) => "failure",
            _ => "success",
        }
    }
}

/// Call-site logic of a response step
pub trait ResponseHandler: Send + Sync {
    fn on_success(
        &self,
        step: &ResponseStep,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
    ) -> NextAction;

    /// Defaults to retry-or-terminate
    fn on_failure(
        &self,
        step: &ResponseStep,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
    ) -> NextAction {
        step.on_failure(packet, response)
    }
}

/// Handles the response stored by its paired request step
pub struct ResponseStep {
    handler: Box<dyn ResponseHandler>,
    next: Option<StepRef>,
    conflict_step: Option<StepRef>,
    status_sink: Option<Arc<dyn StatusSink>>,
    metrics: Option<SharedMetrics>,
}

impl ResponseStep {
    pub fn new(handler: impl ResponseHandler + 'static, next: Option<StepRef>) -> Self {
        ResponseStep {
            handler: Box::new(handler),
            next,
            conflict_step: None,
            status_sink: None,
            metrics: None,
        }
    }

    /// Step to run when the call fails with 409
    pub fn with_conflict_step(mut self, step: StepRef) -> Self {
        self.conflict_step = Some(step);
        self
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    pub(crate) fn with_defaults(
        mut self,
        status_sink: Option<Arc<dyn StatusSink>>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        if self.status_sink.is_none() {
            self.status_sink = status_sink;
        }
        if self.metrics.is_none() {
            self.metrics = metrics;
        }
        self
    }

    /// Request step of the exchange in flight, if it is the one this step answers
    ///
    /// The request registers itself in the packet when it is applied, so the pair holds no
    /// reference cycle and the request stays alive for the whole exchange.
    pub fn previous(&self, packet: &Packet) -> Option<StepRef> {
        packet
            .get::<StepRef>(keys::REQUEST)
            .filter(|request| {
                request
                    .next()
                    .is_some_and(|next| std::ptr::addr_eq(Arc::as_ptr(next), self as *const Self))
            })
            .cloned()
    }

    pub fn conflict_step(&self) -> Option<&StepRef> {
        self.conflict_step.as_ref()
    }

    /// Retry if the strategy allows it, otherwise terminate with the failure
    pub fn on_failure(&self, packet: &mut Packet, response: &KubernetesApiResponse) -> NextAction {
        self.potential_retry(packet, Some(response))
            .unwrap_or_else(|| self.on_failure_no_retry(response))
    }

    /// Terminal action for a failure that is not retried
    pub fn on_failure_no_retry(&self, response: &KubernetesApiResponse) -> NextAction {
        match response.failure() {
            Some(failure) => NextAction::Terminate(failure.to_fiber_error()),
            None => NextAction::Terminate(FiberError::InvalidState(
                "response handler treated a successful response as a failure".to_string(),
            )),
        }
    }

    /// Fetch the next page when the response carries a continue token, else move on
    pub fn continue_list_or_next(
        &self,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
    ) -> NextAction {
        self.continue_list_or(packet, response, self.next.as_ref())
    }

    /// Like [`Self::continue_list_or_next`] with an explicit successor
    pub fn continue_list_or(
        &self,
        packet: &mut Packet,
        response: &KubernetesApiResponse,
        next: Option<&StepRef>,
    ) -> NextAction {
        match response.continue_token() {
            Some(token) => {
                packet.put(keys::CONTINUE, token.to_string());
                self.reset_retry_strategy_and_reinvoke_request(packet)
            }
            None => NextAction::next(next),
        }
    }

    pub fn reset_retry_strategy_and_reinvoke_request(&self, packet: &mut Packet) -> NextAction {
        if let Some(strategy) = retry::strategy(packet) {
            strategy.reset();
        }
        match self.previous(packet) {
            Some(request) => NextAction::Next(request),
            None => NextAction::Terminate(FiberError::InvalidState(
                "response step is not paired with a request step".to_string(),
            )),
        }
    }

    /// Consult the retry strategy; `None` means the failure is final
    ///
    /// A missing response (the call was abandoned) is treated like a timeout.
    pub fn potential_retry(
        &self,
        packet: &mut Packet,
        response: Option<&KubernetesApiResponse>,
    ) -> Option<NextAction> {
        let status_code = response.and_then(KubernetesApiResponse::status_code);
        let decision = retry::strategy(packet)
            .map(|strategy| strategy.decide(status_code, self.conflict_step.is_some()))
            .unwrap_or(RetryDecision::GiveUp);

        match decision {
            RetryDecision::Retry(delay) => {
                let request = self.previous(packet)?;
                debug!(
                    status = ?status_code,
                    delay_ms = delay.as_millis() as u64,
                    call = request.detail().unwrap_or_default(),
                    "Retrying Kubernetes call"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry("retry");
                }
                Some(NextAction::delay(delay, Some(&request)))
            }
            RetryDecision::Conflict => {
                debug!(
                    call = self.previous(packet).and_then(|r| r.detail()).unwrap_or_default(),
                    "Conflict, rerouting to conflict step"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry("conflict");
                }
                self.conflict_step.clone().map(NextAction::Next)
            }
            RetryDecision::GiveUp => {
                self.log_no_retry(response);
                None
            }
        }
    }

    fn log_no_retry(&self, response: Option<&KubernetesApiResponse>) {
        let Some(failure) = response.and_then(KubernetesApiResponse::failure) else {
            return;
        };
        if failure.is_benign() {
            debug!(
                status = ?failure.status_code,
                call = %failure.request.describe(),
                "Kubernetes call not retried"
            );
            return;
        }

        let message = failure.message();
        warn!(
            status = ?failure.status_code,
            reason = %failure.reason(),
            message = %message,
            "Kubernetes call failed, not retrying"
        );
        if let Some(sink) = &self.status_sink {
            sink.record_failure_condition(KUBERNETES_FAILURE_REASON, &message);
        }
    }

    fn is_retry_of_request(&self, packet: &Packet, action: &NextAction) -> bool {
        match (action.target(), self.previous(packet)) {
            (Some(target), Some(request)) => same_step(target, &request),
            _ => false,
        }
    }

    fn is_conflict_reroute(&self, action: &NextAction) -> bool {
        match (action.target(), self.conflict_step.as_ref()) {
            (Some(target), Some(conflict)) => same_step(target, conflict),
            _ => false,
        }
    }
}

impl Step for ResponseStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        let response = packet.remove::<KubernetesApiResponse>(keys::RESPONSE);

        let action = match response.as_deref() {
            Some(response) if response.is_failure() => {
                self.handler.on_failure(&self, packet, response)
            }
            Some(response) => self.handler.on_success(&self, packet, response),
            None => self
                .potential_retry(packet, None)
                .unwrap_or(NextAction::Terminate(FiberError::InvalidState(
                    "no response to handle".to_string(),
                ))),
        };

        if !self.is_retry_of_request(packet, &action) {
            packet.remove::<StepRef>(keys::REQUEST);
            packet.remove::<String>(keys::CONTINUE);
            if !self.is_conflict_reroute(&action) {
                retry::clear(packet);
            }
        }
        action
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }
}
