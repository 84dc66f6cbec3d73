//! Scripted transport and recording sinks for call tests

use super::failure::{ApiFailure, StatusPayload, StatusSink};
use super::request::RequestParams;
use super::response::KubernetesApiResponse;
use super::transport::ApiTransport;
use async_trait::async_trait;
use kube::core::{DynamicObject, ObjectList};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Canned reply of a scripted call
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Object(DynamicObject),
    List {
        continue_token: Option<String>,
        items: Vec<DynamicObject>,
    },
    /// HTTP failure with a raw response body
    Error(u16, String),
    /// Never answers
    Hang,
}

impl Reply {
    pub(crate) fn status(code: u16, reason: &str) -> Reply {
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "reason": reason,
            "message": format!("{reason} ({code})"),
            "code": code,
        });
        Reply::Error(code, body.to_string())
    }

    pub(crate) fn page(continue_token: Option<&str>) -> Reply {
        Reply::List {
            continue_token: continue_token.map(ToString::to_string),
            items: Vec::new(),
        }
    }
}

pub(crate) fn object_list(
    continue_token: Option<&str>,
    items: Vec<DynamicObject>,
) -> ObjectList<DynamicObject> {
    let items: Vec<serde_json::Value> = items
        .into_iter()
        .filter_map(|item| serde_json::to_value(item).ok())
        .collect();
    let list = serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "metadata": { "continue": continue_token.unwrap_or_default() },
        "items": items,
    });
    serde_json::from_value(list).expect("valid list")
}

/// Transport answering from a script, recording every request
///
/// Once the script is exhausted every call succeeds with an empty object of the requested
/// kind.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<RequestParams>>,
}

impl ScriptedTransport {
    pub(crate) fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        ScriptedTransport {
            script: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<RequestParams> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ApiTransport for ScriptedTransport {
    async fn execute(&self, request: &RequestParams) -> KubernetesApiResponse {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Object(object)) => KubernetesApiResponse::object(object, 200),
            Some(Reply::List {
                continue_token,
                items,
            }) => KubernetesApiResponse::list(object_list(continue_token.as_deref(), items)),
            Some(Reply::Error(code, body)) => KubernetesApiResponse::Failure(ApiFailure::http(
                request.clone(),
                StatusPayload::from_body(code, &body),
            )),
            Some(Reply::Hang) => std::future::pending().await,
            None => KubernetesApiResponse::object(
                request
                    .resource
                    .new_object(request.name().unwrap_or("unnamed")),
                200,
            ),
        }
    }
}

/// Status sink keeping every recorded condition
#[derive(Default)]
pub(crate) struct RecordingStatusSink {
    conditions: Mutex<Vec<(String, String)>>,
}

impl RecordingStatusSink {
    pub(crate) fn conditions(&self) -> Vec<(String, String)> {
        self.conditions.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingStatusSink {
    fn record_failure_condition(&self, reason: &str, message: &str) {
        self.conditions
            .lock()
            .unwrap()
            .push((reason.to_string(), message.to_string()));
    }
}
