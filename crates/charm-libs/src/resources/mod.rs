//! Kubernetes compute-resource patching
//!
//! This module provides:
//! - Quantity parsing and canonical comparison
//! - Resource spec validation, sanitization and request derivation
//! - A patcher that converges a StatefulSet container's resources
//! - The charm-facing component driven by host events

pub mod api;
pub mod patch;
pub mod patcher;
pub mod quantity;
pub mod spec;


pub use api::{KubeWorkloadApi, PatchStrategy, WorkloadApi};
pub use patch::{KubernetesComputeResourcesPatch, SpecFn, WAITING_FOR_PATCH};
pub use patcher::{ApplyOutcome, ResourcePatcher, DEFAULT_FIELD_MANAGER};
pub use quantity::{equals_canonically, Quantity};
pub use spec::{
    adjust_resource_requirements, is_valid_spec, requests_from_limits, sanitize_resource_spec,
    NormalizedResourceSpec, ResourceRequirements, ResourceSpec, CPU, MEMORY,
};
