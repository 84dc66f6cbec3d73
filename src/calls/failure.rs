//! Failure payloads of Kubernetes calls and the conversions into fiber errors

use super::request::RequestParams;
use crate::work::FiberError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reason recorded on the domain when a Kubernetes call fails for good
pub const KUBERNETES_FAILURE_REASON: &str = "Kubernetes";

pub const HTTP_UNAUTHORIZED: u16 = 401;
pub const HTTP_FORBIDDEN: u16 = 403;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_CONFLICT: u16 = 409;
pub const HTTP_UNPROCESSABLE_ENTITY: u16 = 422;
pub const HTTP_TOO_MANY_REQUESTS: u16 = 429;

/// Records durable failure conditions against the owning domain
///
/// Implementations must not block the caller.
pub trait StatusSink: Send + Sync {
    fn record_failure_condition(&self, reason: &str, message: &str);
}

/// Kubernetes `Status` object as returned by the API server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub causes: Vec<StatusCause>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl StatusPayload {
    /// Parse a response body; a body that is not a `Status` becomes the message
    pub fn from_body(code: u16, body: &str) -> Self {
        match serde_json::from_str::<StatusPayload>(body) {
            Ok(mut status) => {
                if status.code == 0 {
                    status.code = code;
                }
                status
            }
            Err(_) => StatusPayload {
                code,
                message: body.to_string(),
                ..Default::default()
            },
        }
    }

    /// Most specific reason: the first cause's reason, else the status reason
    pub fn most_specific_reason(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.causes.first())
            .and_then(|c| c.reason.as_deref())
            .filter(|r| !r.is_empty())
            .or_else(|| Some(self.reason.as_str()).filter(|r| !r.is_empty()))
    }
}

/// A failed call, always carrying the request that produced it
#[derive(Debug, Clone)]
pub struct ApiFailure {
    /// HTTP status; `None` when the call timed out or never reached the server
    pub status_code: Option<u16>,
    pub status: Option<StatusPayload>,
    pub error: String,
    pub timed_out: bool,
    pub request: RequestParams,
}

impl ApiFailure {
    pub fn http(request: RequestParams, status: StatusPayload) -> Self {
        ApiFailure {
            status_code: Some(status.code),
            error: format!("HTTP {}: {}", status.code, status.message),
            status: Some(status),
            timed_out: false,
            request,
        }
    }

    pub fn transport(request: RequestParams, error: impl Into<String>) -> Self {
        ApiFailure {
            status_code: None,
            status: None,
            error: error.into(),
            timed_out: false,
            request,
        }
    }

    pub fn timed_out(request: RequestParams, after: Duration) -> Self {
        ApiFailure {
            status_code: None,
            status: None,
            error: format!("call timed out after {}ms", after.as_millis()),
            timed_out: true,
            request,
        }
    }

    pub fn from_kube_error(request: RequestParams, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => ApiFailure::http(
                request,
                StatusPayload {
                    code: response.code,
                    reason: response.reason.clone(),
                    message: response.message.clone(),
                    details: None,
                },
            ),
            other => ApiFailure::transport(request, other.to_string()),
        }
    }

    pub fn is_not_authorized(&self) -> bool {
        matches!(
            self.status_code,
            Some(HTTP_UNAUTHORIZED) | Some(HTTP_FORBIDDEN)
        )
    }

    /// True for failures that are expected races and never escalate to a failure condition
    pub fn is_benign(&self) -> bool {
        matches!(self.status_code, Some(HTTP_NOT_FOUND) | Some(HTTP_CONFLICT))
    }

    pub fn reason(&self) -> String {
        self.status
            .as_ref()
            .and_then(StatusPayload::most_specific_reason)
            .map(ToString::to_string)
            .unwrap_or_else(|| {
                if self.timed_out {
                    "Timeout".to_string()
                } else {
                    "TransportError".to_string()
                }
            })
    }

    /// Message naming the call followed by the server's explanation
    pub fn message(&self) -> String {
        let detail = self
            .status
            .as_ref()
            .map(|s| s.message.as_str())
            .filter(|m| !m.is_empty())
            .unwrap_or(self.error.as_str());
        format!("{}: {}", self.request.describe(), detail)
    }

    pub fn to_fiber_error(&self) -> FiberError {
        match self.status_code {
            Some(code) if self.is_not_authorized() => FiberError::NotAuthorized {
                status_code: code,
                message: self.message(),
            },
            status_code => FiberError::Api {
                status_code,
                reason: self.reason(),
                message: self.message(),
            },
        }
    }
}
