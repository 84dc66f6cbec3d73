//! Request side of a Kubernetes call
//!
//! A [`RequestStep`] issues exactly one API call and suspends its fiber until the response
//! arrives. The response is stored in the packet under [`keys::RESPONSE`] and the paired
//! [`ResponseStep`] runs next. Steps are always created in pairs through [`RequestBuilder`].

use super::failure::{ApiFailure, StatusSink};
use super::response::{KubernetesApiResponse, ResponseStep};
use super::retry::{self, DefaultRetryStrategy, RetryTuning};
use super::transport::ApiTransport;
use crate::server::SharedMetrics;
use crate::work::{keys, NextAction, Packet, Resume, Step, StepRef};
use futures::FutureExt;
use kube::api::{DeleteParams, ListParams, Patch};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Group, version and kind of an API resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl ResourceDescriptor {
    pub const POD: ResourceDescriptor = ResourceDescriptor {
        group: "",
        version: "v1",
        kind: "Pod",
        plural: "pods",
    };

    pub const DOMAIN: ResourceDescriptor = ResourceDescriptor {
        group: "weblogic.oracle",
        version: "v9",
        kind: "Domain",
        plural: "domains",
    };

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.to_string(),
            version: self.version.to_string(),
            api_version: self.api_version(),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }

    /// Empty object of this kind, used as a request body
    pub fn new_object(&self, name: &str) -> DynamicObject {
        DynamicObject::new(name, &self.api_resource())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

impl ListOptions {
    pub fn labels(selector: impl Into<String>) -> Self {
        ListOptions {
            label_selector: Some(selector.into()),
            ..Default::default()
        }
    }

    pub fn to_list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(selector) = &self.label_selector {
            params = params.labels(selector);
        }
        if let Some(selector) = &self.field_selector {
            params = params.fields(selector);
        }
        if let Some(limit) = self.limit {
            params = params.limit(limit);
        }
        if let Some(token) = &self.continue_token {
            params = params.continue_token(token);
        }
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    Merge,
    Strategic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchBody {
    pub patch_type: PatchType,
    pub body: serde_json::Value,
}

impl PatchBody {
    pub fn merge(body: serde_json::Value) -> Self {
        PatchBody {
            patch_type: PatchType::Merge,
            body,
        }
    }

    pub fn to_kube(&self) -> Patch<&serde_json::Value> {
        match self.patch_type {
            PatchType::Merge => Patch::Merge(&self.body),
            PatchType::Strategic => Patch::Strategic(&self.body),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteOptions {
    pub grace_period_seconds: Option<u32>,
}

impl DeleteOptions {
    pub fn to_delete_params(&self) -> DeleteParams {
        DeleteParams {
            grace_period_seconds: self.grace_period_seconds,
            ..Default::default()
        }
    }
}

/// The operation a request step performs
#[derive(Debug, Clone)]
pub enum Operation {
    Get { name: String },
    List { options: ListOptions },
    Create { body: DynamicObject },
    Replace { name: String, body: DynamicObject },
    Patch { name: String, patch: PatchBody },
    PatchStatus { name: String, patch: PatchBody },
    Delete { name: String, options: DeleteOptions },
}

impl Operation {
    pub fn verb(&self) -> &'static str {
        match self {
            Operation::Get { .. } => "read",
            Operation::List { .. } => "list",
            Operation::Create { .. } => "create",
            Operation::Replace { .. } => "replace",
            Operation::Patch { .. } => "patch",
            Operation::PatchStatus { .. } => "patchStatus",
            Operation::Delete { .. } => "delete",
        }
    }
}

/// Everything needed to issue one call
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub resource: ResourceDescriptor,
    pub namespace: Option<String>,
    pub operation: Operation,
}

impl RequestParams {
    pub fn new(resource: ResourceDescriptor, namespace: Option<&str>, operation: Operation) -> Self {
        RequestParams {
            resource,
            namespace: namespace.map(ToString::to_string),
            operation,
        }
    }

    /// Name of the target object; `None` for lists
    pub fn name(&self) -> Option<&str> {
        match &self.operation {
            Operation::Get { name }
            | Operation::Replace { name, .. }
            | Operation::Patch { name, .. }
            | Operation::PatchStatus { name, .. }
            | Operation::Delete { name, .. } => Some(name),
            Operation::Create { body } => body.metadata.name.as_deref(),
            Operation::List { .. } => None,
        }
    }

    /// Call name such as `deletePod` or `patchStatusDomain`
    pub fn call_name(&self) -> String {
        format!("{}{}", self.operation.verb(), self.resource.kind)
    }

    /// Human readable description used in failure messages
    pub fn describe(&self) -> String {
        let mut text = self.call_name();
        if let Some(namespace) = &self.namespace {
            text.push_str(" in namespace ");
            text.push_str(namespace);
        }
        if let Some(name) = self.name() {
            text.push_str(", for ");
            text.push_str(name);
        }
        text
    }
}

/// Issues one call and suspends until the response is in the packet
pub struct RequestStep {
    params: RequestParams,
    transport: Arc<dyn ApiTransport>,
    tuning: RetryTuning,
    call_timeout: Duration,
    metrics: Option<SharedMetrics>,
    next: Option<StepRef>,
}

impl RequestStep {
    pub fn params(&self) -> &RequestParams {
        &self.params
    }
}

impl Step for RequestStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        if retry::strategy(packet).is_none() {
            retry::install(
                packet,
                Arc::new(DefaultRetryStrategy::new(self.tuning.clone())),
            );
        }

        let this: StepRef = self.clone();
        packet.put(keys::REQUEST, this);

        // the token stays in the packet until the page succeeds, so a retry refetches it
        let mut params = self.params.clone();
        if let Operation::List { options } = &mut params.operation {
            if let Some(token) = packet.get::<String>(keys::CONTINUE) {
                options.continue_token = Some(token.clone());
            }
        }

        debug!(call = %params.describe(), "Issuing Kubernetes call");

        let transport = self.transport.clone();
        let timeout = self.call_timeout;
        let metrics = self.metrics.clone();
        let pending = async move {
            let response = match tokio::time::timeout(timeout, transport.execute(&params)).await {
                Ok(response) => response,
                Err(_) => KubernetesApiResponse::Failure(ApiFailure::timed_out(params.clone(), timeout)),
            };
            if let Some(metrics) = &metrics {
                metrics.record_api_call(params.operation.verb(), response.outcome());
            }
            let resume: Resume = Box::new(move |packet: &mut Packet| {
                packet.put(keys::RESPONSE, response);
            });
            resume
        }
        .boxed();

        NextAction::Suspend {
            pending,
            then: self.next.clone(),
        }
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }

    fn detail(&self) -> Option<String> {
        Some(self.params.describe())
    }
}

/// Creates request/response step pairs sharing one transport and tuning
#[derive(Clone)]
pub struct RequestBuilder {
    transport: Arc<dyn ApiTransport>,
    status_sink: Option<Arc<dyn StatusSink>>,
    tuning: RetryTuning,
    call_timeout: Duration,
    page_size: Option<u32>,
    metrics: Option<SharedMetrics>,
}

impl RequestBuilder {
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(transport: Arc<dyn ApiTransport>) -> Self {
        RequestBuilder {
            transport,
            status_sink: None,
            tuning: RetryTuning::default(),
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
            page_size: None,
            metrics: None,
        }
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    pub fn with_retry_tuning(mut self, tuning: RetryTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Limit applied to list calls that do not set one
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size).filter(|size| *size > 0);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Pair a request with its response step; returns the request step
    pub fn call(&self, params: RequestParams, response: ResponseStep) -> StepRef {
        let response: StepRef =
            Arc::new(response.with_defaults(self.status_sink.clone(), self.metrics.clone()));
        Arc::new(RequestStep {
            params,
            transport: self.transport.clone(),
            tuning: self.tuning.clone(),
            call_timeout: self.call_timeout,
            metrics: self.metrics.clone(),
            next: Some(response),
        })
    }

    pub fn get(
        &self,
        resource: ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
        response: ResponseStep,
    ) -> StepRef {
        let operation = Operation::Get {
            name: name.to_string(),
        };
        self.call(RequestParams::new(resource, namespace, operation), response)
    }

    pub fn list(
        &self,
        resource: ResourceDescriptor,
        namespace: Option<&str>,
        mut options: ListOptions,
        response: ResponseStep,
    ) -> StepRef {
        if options.limit.is_none() {
            options.limit = self.page_size;
        }
        let operation = Operation::List { options };
        self.call(RequestParams::new(resource, namespace, operation), response)
    }

    pub fn create(
        &self,
        resource: ResourceDescriptor,
        namespace: Option<&str>,
        body: DynamicObject,
        response: ResponseStep,
    ) -> StepRef {
        let operation = Operation::Create { body };
        self.call(RequestParams::new(resource, namespace, operation), response)
    }

    pub fn replace(
        &self,
        resource: ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
        body: DynamicObject,
        response: ResponseStep,
    ) -> StepRef {
        let operation = Operation::Replace {
            name: name.to_string(),
            body,
        };
        self.call(RequestParams::new(resource, namespace, operation), response)
    }

    pub fn patch(
        &self,
        resource: ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
        patch: PatchBody,
        response: ResponseStep,
    ) -> StepRef {
        let operation = Operation::Patch {
            name: name.to_string(),
            patch,
        };
        self.call(RequestParams::new(resource, namespace, operation), response)
    }

    pub fn patch_status(
        &self,
        resource: ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
        patch: PatchBody,
        response: ResponseStep,
    ) -> StepRef {
        let operation = Operation::PatchStatus {
            name: name.to_string(),
            patch,
        };
        self.call(RequestParams::new(resource, namespace, operation), response)
    }

    pub fn delete(
        &self,
        resource: ResourceDescriptor,
        namespace: Option<&str>,
        name: &str,
        options: DeleteOptions,
        response: ResponseStep,
    ) -> StepRef {
        let operation = Operation::Delete {
            name: name.to_string(),
            options,
        };
        self.call(RequestParams::new(resource, namespace, operation), response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_group_api_version() {
        assert_eq!(ResourceDescriptor::POD.api_version(), "v1");
        assert_eq!(ResourceDescriptor::DOMAIN.api_version(), "weblogic.oracle/v9");
        assert_eq!(ResourceDescriptor::DOMAIN.api_resource().plural, "domains");
    }

    #[test]
    fn test_describe_names_namespace_and_object() {
        let params = RequestParams::new(
            ResourceDescriptor::POD,
            Some("ns1"),
            Operation::Delete {
                name: "domain1-ms1".to_string(),
                options: DeleteOptions::default(),
            },
        );
        assert_eq!(params.describe(), "deletePod in namespace ns1, for domain1-ms1");
    }

    #[test]
    fn test_describe_list_has_no_object_name() {
        let params = RequestParams::new(
            ResourceDescriptor::DOMAIN,
            None,
            Operation::List {
                options: ListOptions::default(),
            },
        );
        assert_eq!(params.describe(), "listDomain");
        assert_eq!(params.name(), None);
    }

    #[test]
    fn test_create_takes_name_from_body() {
        let params = RequestParams::new(
            ResourceDescriptor::POD,
            Some("ns1"),
            Operation::Create {
                body: ResourceDescriptor::POD.new_object("domain1-admin"),
            },
        );
        assert_eq!(params.name(), Some("domain1-admin"));
    }
}
