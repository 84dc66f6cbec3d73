//! Transport executing calls against the Kubernetes API server

use super::failure::{ApiFailure, StatusPayload};
use super::request::{Operation, RequestParams};
use super::response::KubernetesApiResponse;
use async_trait::async_trait;
use kube::api::{Api, PostParams, PatchParams};
use kube::core::DynamicObject;
use kube::Client;

/// Executes one request and reports the outcome as a response value
///
/// Failures are never returned as `Err`: every outcome is a [`KubernetesApiResponse`].
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn execute(&self, request: &RequestParams) -> KubernetesApiResponse;
}

/// Transport backed by a `kube` client, using dynamic objects for every resource
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self {
        KubeTransport { client }
    }

    fn api(&self, request: &RequestParams) -> Api<DynamicObject> {
        let resource = request.resource.api_resource();
        match &request.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ApiTransport for KubeTransport {
    async fn execute(&self, request: &RequestParams) -> KubernetesApiResponse {
        let api = self.api(request);

        let result = match &request.operation {
            Operation::Get { name } => api
                .get(name)
                .await
                .map(|object| KubernetesApiResponse::object(object, 200)),
            Operation::List { options } => api
                .list(&options.to_list_params())
                .await
                .map(KubernetesApiResponse::list),
            Operation::Create { body } => api
                .create(&PostParams::default(), body)
                .await
                .map(|object| KubernetesApiResponse::object(object, 201)),
            Operation::Replace { name, body } => api
                .replace(name, &PostParams::default(), body)
                .await
                .map(|object| KubernetesApiResponse::object(object, 200)),
            Operation::Patch { name, patch } => api
                .patch(name, &PatchParams::default(), &patch.to_kube())
                .await
                .map(|object| KubernetesApiResponse::object(object, 200)),
            Operation::PatchStatus { name, patch } => api
                .patch_status(name, &PatchParams::default(), &patch.to_kube())
                .await
                .map(|object| KubernetesApiResponse::object(object, 200)),
            Operation::Delete { name, options } => api
                .delete(name, &options.to_delete_params())
                .await
                .map(|deleted| {
                    deleted.either(
                        |object| KubernetesApiResponse::object(object, 200),
                        |status| {
                            let body = serde_json::to_string(&status).unwrap_or_default();
                            KubernetesApiResponse::Status(StatusPayload::from_body(200, &body))
                        },
                    )
                }),
        };

        result.unwrap_or_else(|e| {
            KubernetesApiResponse::Failure(ApiFailure::from_kube_error(request.clone(), e))
        })
    }
}
