//! Fixtures shared by controller tests

use super::presence::{server_name_of, DomainPresenceInfo};
use crate::calls::testing::object_list;
use crate::calls::{
    ApiFailure, ApiTransport, KubernetesApiResponse, Operation, RequestParams, StatusPayload,
};
use crate::crd::Domain;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const NAMESPACE: &str = "ns1";
pub(crate) const DOMAIN_UID: &str = "domain1";

/// Server pod labelled the way the operator labels them
pub(crate) fn server_pod(server: &str, cluster: Option<&str>, ready: bool) -> Pod {
    server_pod_with_version(server, cluster, ready, "1")
}

pub(crate) fn server_pod_with_version(
    server: &str,
    cluster: Option<&str>,
    ready: bool,
    restart_version: &str,
) -> Pod {
    let mut labels = serde_json::json!({
        "weblogic.domainUID": DOMAIN_UID,
        "weblogic.serverName": server,
        "weblogic.domainRestartVersion": restart_version,
        "weblogic.createdByOperator": "true",
    });
    if let Some(cluster) = cluster {
        labels["weblogic.clusterName"] = serde_json::Value::from(cluster);
    }
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": format!("{DOMAIN_UID}-{server}"),
            "namespace": NAMESPACE,
            "uid": format!("uid-{server}-{restart_version}"),
            "resourceVersion": "100",
            "labels": labels,
        },
        "spec": {
            "containers": [{ "name": "weblogic-server", "image": "weblogic:14" }]
        },
        "status": {
            "conditions": [{
                "type": "Ready",
                "status": if ready { "True" } else { "False" },
            }]
        }
    }))
    .expect("valid pod")
}

/// Domain with the given clusters as (name, replicas, maxUnavailable, servers)
pub(crate) fn domain(clusters: &[(&str, i32, i32, &[&str])], restart_version: &str) -> Domain {
    let clusters: Vec<serde_json::Value> = clusters
        .iter()
        .map(|(name, replicas, max_unavailable, servers)| {
            serde_json::json!({
                "clusterName": name,
                "replicas": replicas,
                "maxUnavailable": max_unavailable,
                "servers": servers,
            })
        })
        .collect();
    serde_json::from_value(serde_json::json!({
        "apiVersion": "weblogic.oracle/v9",
        "kind": "Domain",
        "metadata": {
            "name": DOMAIN_UID,
            "namespace": NAMESPACE,
            "generation": 2,
            "resourceVersion": "10",
        },
        "spec": {
            "domainUID": DOMAIN_UID,
            "restartVersion": restart_version,
            "clusters": clusters,
        }
    }))
    .expect("valid domain")
}

/// API server stand-in backed by a presence info
///
/// Deletes and creates are reflected in the presence info right away, the way the pod
/// watcher would report them. Created pods come up Ready. Statuses queued with
/// [`FakeCluster::fail`] are returned before a call name is served normally.
pub(crate) struct FakeCluster {
    presence: Arc<DomainPresenceInfo>,
    requests: Mutex<Vec<RequestParams>>,
    failures: Mutex<HashMap<String, VecDeque<u16>>>,
    created: AtomicUsize,
}

impl FakeCluster {
    pub(crate) fn new(presence: Arc<DomainPresenceInfo>) -> Arc<Self> {
        Arc::new(FakeCluster {
            presence,
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        })
    }

    /// Answer the next calls named `call_name` (e.g. `deletePod`) with these statuses
    pub(crate) fn fail(&self, call_name: &str, statuses: &[u16]) {
        self.failures
            .lock()
            .unwrap()
            .entry(call_name.to_string())
            .or_default()
            .extend(statuses);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(RequestParams::call_name)
            .collect()
    }

    /// Continue tokens sent with each pod list, in call order
    pub(crate) fn list_tokens(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|request| match &request.operation {
                Operation::List { options } => Some(options.continue_token.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, call_name: &str) -> usize {
        self.calls().iter().filter(|c| *c == call_name).count()
    }

    fn server_of_pod(&self, pod_name: &str) -> Option<String> {
        self.presence
            .servers()
            .iter()
            .find(|(_, pod)| pod.metadata.name.as_deref() == Some(pod_name))
            .map(|(server, _)| server.clone())
    }

    fn serve(&self, request: &RequestParams) -> Result<KubernetesApiResponse, u16> {
        match (&request.operation, request.resource.kind) {
            (Operation::List { options }, "Pod") => {
                // continue tokens are offsets into the server-name ordered pods
                let pods: Vec<DynamicObject> = self
                    .presence
                    .servers()
                    .values()
                    .map(|pod| to_dynamic(pod.as_ref()))
                    .collect();
                let start = options
                    .continue_token
                    .as_deref()
                    .and_then(|token| token.parse::<usize>().ok())
                    .unwrap_or(0)
                    .min(pods.len());
                let end = options
                    .limit
                    .map_or(pods.len(), |limit| (start + limit as usize).min(pods.len()));
                let token = (end < pods.len()).then(|| end.to_string());
                Ok(KubernetesApiResponse::list(object_list(
                    token.as_deref(),
                    pods[start..end].to_vec(),
                )))
            }
            (Operation::Delete { name, .. }, "Pod") => {
                let server = self.server_of_pod(name).ok_or(404_u16)?;
                let pod = self.presence.server_pod(&server).ok_or(404_u16)?;
                self.presence.remove_server_pod(&server);
                Ok(KubernetesApiResponse::object(to_dynamic(pod.as_ref()), 200))
            }
            (Operation::Create { body }, "Pod") => {
                let mut value = serde_json::to_value(body).unwrap();
                let n = self.created.fetch_add(1, Ordering::SeqCst);
                value["metadata"]["uid"] = serde_json::Value::from(format!("created-{n}"));
                value["status"] = serde_json::json!({
                    "conditions": [{ "type": "Ready", "status": "True" }]
                });
                let pod: Pod = serde_json::from_value(value).unwrap();
                let server = server_name_of(&pod).ok_or(422_u16)?.to_string();
                if self.presence.server_pod(&server).is_some() {
                    return Err(409);
                }
                self.presence.set_server_pod(&server, Arc::new(pod.clone()));
                Ok(KubernetesApiResponse::object(to_dynamic(&pod), 201))
            }
            (Operation::Get { .. } | Operation::PatchStatus { .. }, "Domain") => {
                let domain = self.presence.domain().ok_or(404_u16)?;
                Ok(KubernetesApiResponse::object(to_dynamic(domain.as_ref()), 200))
            }
            _ => Err(405),
        }
    }
}

fn to_dynamic<T: serde::Serialize>(object: &T) -> DynamicObject {
    serde_json::from_value(serde_json::to_value(object).unwrap()).unwrap()
}

#[async_trait]
impl ApiTransport for FakeCluster {
    async fn execute(&self, request: &RequestParams) -> KubernetesApiResponse {
        self.requests.lock().unwrap().push(request.clone());
        let queued = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&request.call_name())
            .and_then(VecDeque::pop_front);
        let result = match queued {
            Some(code) => Err(code),
            None => self.serve(request),
        };
        result.unwrap_or_else(|code| {
            let body = serde_json::json!({
                "kind": "Status",
                "status": "Failure",
                "reason": "Injected",
                "message": format!("injected {code}"),
                "code": code,
            });
            KubernetesApiResponse::Failure(ApiFailure::http(
                request.clone(),
                StatusPayload::from_body(code, &body.to_string()),
            ))
        })
    }
}
