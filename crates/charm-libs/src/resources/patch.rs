//! Compute-resources patch component
//!
//! Re-applies the container's resource limits and requests on every
//! config-changed (and any extra refresh event). Config-changed fires on
//! every startup and upgrade, after storage, leadership and peer events, so
//! the workload exists by then.
//!
//! Failures never propagate into the host's event loop; they are reported as
//! [`LibraryEvent::PatchFailed`] and through [`KubernetesComputeResourcesPatch::status`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use super::api::{KubeWorkloadApi, WorkloadApi};
use super::patcher::{ApplyOutcome, ResourcePatcher};
use super::spec::{is_valid_spec, ResourceRequirements, ResourceSpec};
use crate::config::LibConfig;
use crate::error::{PatchError, SpecError};
use crate::framework::{EventEmitter, EventKind, HostEvent, LibraryEvent, Observer};
use crate::host::{pod_name, UnitContext};
use crate::observability::{LibMetrics, StructuredLogger};
use crate::status::UnitStatus;

/// Produces a resource spec on demand; `Ok(None)` means "no constraint"
pub type SpecFn = Box<dyn Fn() -> Result<Option<ResourceSpec>, SpecError> + Send + Sync>;

pub const WAITING_FOR_PATCH: &str = "waiting for resources patch to apply";

/// Keeps one container's compute resources in line with the charm's config
pub struct KubernetesComputeResourcesPatch {
    container_name: String,
    pod_name: String,
    patcher: ResourcePatcher,
    limits_fn: SpecFn,
    requests_fn: SpecFn,
    refresh_events: Vec<EventKind>,
    emitter: EventEmitter,
    metrics: LibMetrics,
    logger: StructuredLogger,
    last_failure: Option<String>,
}

impl KubernetesComputeResourcesPatch {
    /// Manage `container_name` through an existing patcher
    pub fn new(
        unit: &dyn UnitContext,
        container_name: impl Into<String>,
        patcher: ResourcePatcher,
        emitter: EventEmitter,
    ) -> Self {
        let unit_name = unit.unit_name();
        Self {
            container_name: container_name.into(),
            pod_name: pod_name(&unit_name),
            patcher,
            limits_fn: Box::new(|| Ok(None)),
            requests_fn: Box::new(|| Ok(None)),
            refresh_events: Vec::new(),
            emitter,
            metrics: LibMetrics::new(),
            logger: StructuredLogger::new(unit_name),
            last_failure: None,
        }
    }

    /// Manage `container_name` in the application's StatefulSet via `api`
    ///
    /// The StatefulSet is named after the application; the namespace and
    /// patch settings come from `config`.
    pub fn attach(
        unit: &dyn UnitContext,
        container_name: impl Into<String>,
        api: Arc<dyn WorkloadApi>,
        config: &LibConfig,
        emitter: EventEmitter,
    ) -> Result<Self, PatchError> {
        let container_name = container_name.into();
        let namespace = config
            .resolve_namespace()
            .map_err(|e| PatchError::Namespace(format!("{e:#}")))?;
        let patcher = ResourcePatcher::new(api, namespace, unit.app_name(), container_name.clone())
            .with_field_manager(config.field_manager.clone())
            .with_retry_policy(config.retry_policy());
        Ok(Self::new(unit, container_name, patcher, emitter))
    }

    /// Like [`attach`](Self::attach), talking to the cluster the pod runs in
    pub async fn in_cluster(
        unit: &dyn UnitContext,
        container_name: impl Into<String>,
        config: &LibConfig,
        emitter: EventEmitter,
    ) -> Result<Self, PatchError> {
        let api = KubeWorkloadApi::try_default().await?;
        Self::attach(unit, container_name, Arc::new(api), config, emitter)
    }

    pub fn limits<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<Option<ResourceSpec>, SpecError> + Send + Sync + 'static,
    {
        self.limits_fn = Box::new(f);
        self
    }

    pub fn requests<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<Option<ResourceSpec>, SpecError> + Send + Sync + 'static,
    {
        self.requests_fn = Box::new(f);
        self
    }

    /// Extra host events that re-apply the patch
    pub fn refresh_events(mut self, events: Vec<EventKind>) -> Self {
        self.refresh_events = events;
        self
    }

    pub fn patcher(&self) -> &ResourcePatcher {
        &self.patcher
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Message of the last failed reconciliation, cleared on success
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// Evaluate the spec functions, validate and sanitize their output
    pub fn desired(&self) -> Result<ResourceRequirements, PatchError> {
        let limits = (self.limits_fn)().map_err(PatchError::SpecFunction)?;
        let requests = (self.requests_fn)().map_err(PatchError::SpecFunction)?;

        for spec in [&limits, &requests] {
            if !is_valid_spec(spec.as_ref()) {
                let shown = spec
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "None".to_string());
                return Err(PatchError::InvalidSpec(shown));
            }
        }

        ResourceRequirements::from_specs(limits.as_ref(), requests.as_ref())
            .map_err(PatchError::SpecFunction)
    }

    fn fail(&mut self, err: &PatchError) {
        let message = err.to_string();
        error!(
            container = %self.container_name,
            error = %message,
            "Compute resources patch failed"
        );
        self.metrics.inc_patch_failures();
        self.logger.log_patch_failed(&message);
        self.emitter.emit(LibraryEvent::PatchFailed {
            message: message.clone(),
        });
        self.last_failure = Some(message);
    }

    /// Bring the StatefulSet template in line with the desired resources
    ///
    /// Any failure is emitted as `PatchFailed` and recorded for `status`
    /// before being returned.
    pub async fn reconcile(&mut self) -> Result<ApplyOutcome, PatchError> {
        self.metrics.inc_patch_attempts();

        let result = match self.desired() {
            Ok(desired) => self.patcher.apply(&desired).await.map(|o| (o, desired)),
            Err(e) => Err(e),
        };

        match result {
            Ok((outcome, desired)) => {
                self.last_failure = None;
                if outcome == ApplyOutcome::Patched {
                    self.logger.log_patch_applied(
                        self.patcher.namespace(),
                        self.patcher.statefulset_name(),
                        &self.container_name,
                        &desired.to_string(),
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Whether the patch is declared and in effect on this unit's pod
    ///
    /// A missing StatefulSet or pod just means "not ready"; other API errors
    /// are emitted as `PatchFailed`.
    pub async fn is_ready(&mut self) -> bool {
        let desired = match self.desired() {
            Ok(desired) => desired,
            Err(e) => {
                error!(error = %e, "Failed obtaining resource limit spec");
                return false;
            }
        };

        match self.patcher.is_ready(&self.pod_name, &desired).await {
            Ok(ready) => ready,
            Err(PatchError::Api(e)) if e.is_not_found() => {
                debug!(pod = %self.pod_name, error = %e, "Workload not found, not ready");
                false
            }
            Err(e) => {
                self.fail(&e);
                false
            }
        }
    }

    /// Status contribution of this component
    pub async fn status(&self) -> UnitStatus {
        if let Some(message) = &self.last_failure {
            return UnitStatus::blocked(message.clone());
        }
        match self.patcher.is_in_progress().await {
            Ok(true) => UnitStatus::waiting(WAITING_FOR_PATCH),
            Ok(false) => UnitStatus::active(),
            Err(e) => UnitStatus::blocked(e.to_string()),
        }
    }
}

#[async_trait]
impl Observer for KubernetesComputeResourcesPatch {
    fn name(&self) -> &str {
        "kubernetes-compute-resources-patch"
    }

    fn observed_events(&self) -> Vec<EventKind> {
        let mut kinds = vec![EventKind::ConfigChanged];
        for kind in &self.refresh_events {
            if !kinds.contains(kind) {
                kinds.push(kind.clone());
            }
        }
        kinds
    }

    async fn handle(&mut self, event: &HostEvent) {
        debug!(event = ?event.kind(), container = %self.container_name, "Reconciling compute resources");
        // failures were already emitted
        let _ = self.reconcile().await;
    }
}
