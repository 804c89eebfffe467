//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use charm_libs::certs::handler::{DEFAULT_CERTIFICATES_RELATION, DEFAULT_PEER_RELATION};
use charm_libs::certs::InMemoryCertificates;
use charm_libs::resources::{PatchStrategy, WorkloadApi};
use charm_libs::{ApiError, InMemoryModel, LibraryEvent, RelationInfo};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

pub const UNIT: &str = "alertmanager/0";

pub fn model() -> Arc<InMemoryModel> {
    Arc::new(InMemoryModel::new(UNIT).with_hostname("alertmanager-0.alertmanager-endpoints.cos.svc.cluster.local"))
}

pub fn certificates() -> Arc<InMemoryCertificates> {
    Arc::new(InMemoryCertificates::new(7))
}

/// Certificates relation with a CA that has published its app data
pub fn join_ca(model: &InMemoryModel) {
    model.add_relation(
        RelationInfo::new(7, DEFAULT_CERTIFICATES_RELATION)
            .with_app("self-signed-certificates")
            .with_unit("self-signed-certificates/0")
            .with_app_data(),
    );
}

pub fn add_peers(model: &InMemoryModel) {
    model.add_relation(RelationInfo::new(1, DEFAULT_PEER_RELATION).with_app("alertmanager"));
}

pub fn drain(events: &mut UnboundedReceiver<LibraryEvent>) -> Vec<LibraryEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// One StatefulSet with a `charm` and a workload container, plus its pod
pub struct FakeCluster {
    pub statefulset: Mutex<StatefulSet>,
    pub pod: Mutex<Pod>,
    pub patch_failures: Mutex<VecDeque<ApiError>>,
    pub patches: Mutex<usize>,
}

impl FakeCluster {
    pub fn new(app: &str, container: &str) -> Arc<Self> {
        let containers = json!([
            {"name": "charm", "image": "charm-base"},
            {"name": container, "image": "workload", "resources": {}}
        ]);
        let statefulset = serde_json::from_value(json!({
            "metadata": {"name": app, "namespace": "cos", "generation": 1},
            "spec": {
                "selector": {"matchLabels": {"app.kubernetes.io/name": app}},
                "serviceName": format!("{app}-endpoints"),
                "template": {"spec": {"containers": containers.clone()}}
            },
            "status": {"replicas": 1, "observedGeneration": 1}
        }))
        .unwrap();
        let pod = serde_json::from_value(json!({
            "metadata": {"name": format!("{app}-0"), "namespace": "cos"},
            "spec": {"containers": containers}
        }))
        .unwrap();

        Arc::new(Self {
            statefulset: Mutex::new(statefulset),
            pod: Mutex::new(pod),
            patch_failures: Mutex::new(VecDeque::new()),
            patches: Mutex::new(0),
        })
    }

    pub fn fail_next_patch(&self, err: ApiError) {
        self.patch_failures.lock().unwrap().push_back(err);
    }

    pub fn patches(&self) -> usize {
        *self.patches.lock().unwrap()
    }

    /// Let the controller catch up and roll the pod
    pub fn rollout(&self) {
        let mut sts = self.statefulset.lock().unwrap();
        let generation = sts.metadata.generation;
        sts.status.get_or_insert_with(Default::default).observed_generation = generation;
        let template = sts.spec.as_ref().and_then(|s| s.template.spec.clone());
        self.pod.lock().unwrap().spec = template;
    }

    pub fn container_resources(&self, container: &str) -> serde_json::Value {
        let sts = self.statefulset.lock().unwrap();
        let resources = sts
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.iter().find(|c| c.name == container))
            .and_then(|c| c.resources.clone());
        serde_json::to_value(resources).unwrap()
    }
}

#[async_trait]
impl WorkloadApi for FakeCluster {
    async fn get_stateful_set(&self, _namespace: &str, _name: &str) -> Result<StatefulSet, ApiError> {
        Ok(self.statefulset.lock().unwrap().clone())
    }

    async fn get_pod(&self, _namespace: &str, _name: &str) -> Result<Pod, ApiError> {
        Ok(self.pod.lock().unwrap().clone())
    }

    async fn patch_stateful_set(
        &self,
        _namespace: &str,
        _name: &str,
        delta: &StatefulSet,
        _strategy: PatchStrategy,
        _field_manager: &str,
    ) -> Result<(), ApiError> {
        if let Some(err) = self.patch_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        *self.patches.lock().unwrap() += 1;

        let patched = delta
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers.clone())
            .unwrap_or_default();
        let mut sts = self.statefulset.lock().unwrap();
        sts.metadata.generation = sts.metadata.generation.map(|g| g + 1);
        if let Some(pod_spec) = sts.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            for update in patched {
                if let Some(c) = pod_spec.containers.iter_mut().find(|c| c.name == update.name) {
                    c.resources = update.resources;
                }
            }
        }
        Ok(())
    }
}
