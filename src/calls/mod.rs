//! Kubernetes calls as step pairs
//!
//! Every call is a [`RequestStep`] followed by its [`ResponseStep`]. The request suspends the
//! fiber while the transport talks to the API server; the response step decides between
//! success handling, retry, conflict reroute and failure.

pub mod failure;
pub mod request;
pub mod response;
pub mod retry;
pub mod transport;

pub use failure::{ApiFailure, StatusPayload, StatusSink, KUBERNETES_FAILURE_REASON};
pub use request::{
    DeleteOptions, ListOptions, Operation, PatchBody, PatchType, RequestBuilder, RequestParams,
    RequestStep, ResourceDescriptor,
};
pub use response::{ApiObject, KubernetesApiResponse, ResponseHandler, ResponseStep};
pub use retry::{DefaultRetryStrategy, RetryDecision, RetryStrategy, RetryTuning};
pub use transport::{ApiTransport, KubeTransport};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod testing;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "calls_test.rs"]
mod calls_tests;
