//! Access to the workload objects in the cluster
//!
//! [`WorkloadApi`] is the narrow get/patch surface the patcher needs;
//! [`KubeWorkloadApi`] implements it over a `kube::Client`.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::debug;

use crate::error::{ApiError, PatchError};

/// How a delta is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchStrategy {
    /// Server-side apply; only the fields in the delta are owned
    #[default]
    Apply,
    /// Strategic merge patch; containers are merged by `name`, so siblings
    /// and the fields the delta leaves out are kept
    Strategic,
}

/// Parameters and body the API server receives for `strategy`
fn patch_request<'a>(
    delta: &'a StatefulSet,
    strategy: PatchStrategy,
    field_manager: &str,
) -> (PatchParams, Patch<&'a StatefulSet>) {
    match strategy {
        PatchStrategy::Apply => (PatchParams::apply(field_manager), Patch::Apply(delta)),
        PatchStrategy::Strategic => (
            PatchParams {
                field_manager: Some(field_manager.to_string()),
                ..Default::default()
            },
            Patch::Strategic(delta),
        ),
    }
}

/// Get/patch capability over the workload's StatefulSet and pods
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<StatefulSet, ApiError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ApiError>;

    async fn patch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        delta: &StatefulSet,
        strategy: PatchStrategy,
        field_manager: &str,
    ) -> Result<(), ApiError>;
}

/// [`WorkloadApi`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeWorkloadApi {
    client: Client,
}

impl KubeWorkloadApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster service account or kubeconfig
    pub async fn try_default() -> Result<Self, PatchError> {
        let client = Client::try_default()
            .await
            .map_err(|e| PatchError::Client(e.to_string()))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<StatefulSet, ApiError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ApiError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn patch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        delta: &StatefulSet,
        strategy: PatchStrategy,
        field_manager: &str,
    ) -> Result<(), ApiError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        debug!(
            namespace = %namespace,
            statefulset = %name,
            strategy = ?strategy,
            field_manager = %field_manager,
            "Patching StatefulSet"
        );

        let (params, patch) = patch_request(delta, strategy, field_manager);
        api.patch(name, &params, &patch).await?;
        Ok(())
    }
}
