//! StatefulSet resource patching for one container
//!
//! The patcher compares the resources declared in the StatefulSet pod
//! template with the desired ones and only patches when they differ. The
//! patch is a delta that touches nothing but the container's `resources`
//! block, so fields owned by Juju or other controllers are left alone.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use super::api::{PatchStrategy, WorkloadApi};
use super::spec::ResourceRequirements;
use crate::error::PatchError;
use crate::observability::LibMetrics;
use crate::retry::{retry_with_backoff, RetryPolicy};

pub const DEFAULT_FIELD_MANAGER: &str = "KubernetesComputeResourcesPatch";

/// Result of [`ResourcePatcher::apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The template already matched; no request was sent
    AlreadyConverged,
    /// A patch was sent
    Patched,
}

/// Patches the resources of one container in a StatefulSet
pub struct ResourcePatcher {
    api: Arc<dyn WorkloadApi>,
    namespace: String,
    statefulset_name: String,
    container_name: String,
    field_manager: String,
    strategy: PatchStrategy,
    retry: RetryPolicy,
    metrics: LibMetrics,
}

impl ResourcePatcher {
    pub fn new(
        api: Arc<dyn WorkloadApi>,
        namespace: impl Into<String>,
        statefulset_name: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            statefulset_name: statefulset_name.into(),
            container_name: container_name.into(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            strategy: PatchStrategy::Apply,
            retry: RetryPolicy::default(),
            metrics: LibMetrics::new(),
        }
    }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    pub fn with_strategy(mut self, strategy: PatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn statefulset_name(&self) -> &str {
        &self.statefulset_name
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn stateful_set(&self) -> Result<StatefulSet, PatchError> {
        Ok(self
            .api
            .get_stateful_set(&self.namespace, &self.statefulset_name)
            .await?)
    }

    fn find_container<'a>(&self, containers: &'a [Container]) -> Result<&'a Container, PatchError> {
        containers
            .iter()
            .find(|c| c.name == self.container_name)
            .ok_or_else(|| PatchError::ContainerNotFound(self.container_name.clone()))
    }

    fn templated_from(&self, statefulset: &StatefulSet) -> Result<ResourceRequirements, PatchError> {
        let containers = statefulset
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers.as_slice())
            .unwrap_or_default();
        let container = self.find_container(containers)?;
        Ok(ResourceRequirements::from_k8s(container.resources.as_ref()))
    }

    /// Resources declared for the container in the StatefulSet template
    pub async fn get_templated(&self) -> Result<ResourceRequirements, PatchError> {
        let statefulset = self.stateful_set().await?;
        self.templated_from(&statefulset)
    }

    /// Resources in effect for the container in the given pod
    pub async fn get_actual(&self, pod_name: &str) -> Result<ResourceRequirements, PatchError> {
        let pod = self.api.get_pod(&self.namespace, pod_name).await?;
        let containers = pod
            .spec
            .as_ref()
            .map(|p| p.containers.as_slice())
            .unwrap_or_default();
        let container = self.find_container(containers)?;
        Ok(ResourceRequirements::from_k8s(container.resources.as_ref()))
    }

    /// Whether the template already declares `desired`
    pub async fn is_patched(&self, desired: &ResourceRequirements) -> Result<bool, PatchError> {
        Ok(desired.is_converged(&self.get_templated().await?))
    }

    /// Declared in the template and in effect on the running pod
    pub async fn is_ready(
        &self,
        pod_name: &str,
        desired: &ResourceRequirements,
    ) -> Result<bool, PatchError> {
        if !self.is_patched(desired).await? {
            return Ok(false);
        }
        Ok(desired.is_converged(&self.get_actual(pod_name).await?))
    }

    /// Whether the StatefulSet controller has yet to act on the latest spec
    pub async fn is_in_progress(&self) -> Result<bool, PatchError> {
        let statefulset = self.stateful_set().await?;
        let generation = statefulset.metadata.generation;
        let observed = statefulset.status.as_ref().and_then(|s| s.observed_generation);
        Ok(generation.is_some() && generation != observed)
    }

    /// Delta that sets only the container's resources
    pub fn patched_delta(&self, current: &StatefulSet, desired: &ResourceRequirements) -> StatefulSet {
        let spec = current.spec.clone().unwrap_or_default();
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(self.statefulset_name.clone()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                selector: spec.selector,
                service_name: spec.service_name,
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: self.container_name.clone(),
                            resources: Some(desired.to_k8s()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    async fn apply_once(&self, desired: &ResourceRequirements) -> Result<ApplyOutcome, PatchError> {
        let statefulset = self.stateful_set().await?;
        let observed = self.templated_from(&statefulset)?;
        if desired.is_converged(&observed) {
            debug!(
                statefulset = %self.statefulset_name,
                container = %self.container_name,
                "Resources already converged, not patching"
            );
            return Ok(ApplyOutcome::AlreadyConverged);
        }

        let delta = self.patched_delta(&statefulset, desired);
        self.api
            .patch_stateful_set(
                &self.namespace,
                &self.statefulset_name,
                &delta,
                self.strategy,
                &self.field_manager,
            )
            .await?;
        self.metrics.inc_patches_applied();
        debug!(
            statefulset = %self.statefulset_name,
            strategy = ?self.strategy,
            "StatefulSet patch accepted"
        );
        Ok(ApplyOutcome::Patched)
    }

    /// Converge the template to `desired`
    ///
    /// No request is sent when the template already matches. Conflicts and
    /// transient API failures are retried within the retry policy's budget.
    pub async fn apply(&self, desired: &ResourceRequirements) -> Result<ApplyOutcome, PatchError> {
        retry_with_backoff(
            &self.retry,
            "patch_statefulset_resources",
            PatchError::is_transient,
            || self.apply_once(desired),
        )
        .await
    }
}
