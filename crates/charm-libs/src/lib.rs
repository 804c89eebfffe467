//! Charm libraries for Kubernetes workloads
//!
//! This crate provides:
//! - Compute-resource patching of a charm's StatefulSet container
//! - Request derivation from limits and spec validation helpers
//! - TLS certificate handling over the certificates relation
//! - A private vault for key material (secrets or peer relation data)
//! - Host model, event dispatch, status and observability plumbing

pub mod certs;
pub mod config;
pub mod error;
pub mod framework;
pub mod host;
pub mod observability;
pub mod resources;
pub mod retry;
pub mod status;

pub use certs::{CertHandler, CertHandlerBuilder};
pub use config::LibConfig;
pub use error::{ApiError, CertError, HostError, PatchError, SpecError, VaultError};
pub use framework::{EventEmitter, EventKind, Framework, HostEvent, LibraryEvent, Observer};
pub use host::{InMemoryModel, JujuVersion, Model, RelationInfo};
pub use observability::{LibMetrics, StructuredLogger};
pub use resources::{
    adjust_resource_requirements, is_valid_spec, requests_from_limits, sanitize_resource_spec,
    KubernetesComputeResourcesPatch, ResourcePatcher, ResourceRequirements, ResourceSpec,
};
pub use retry::RetryPolicy;
pub use status::UnitStatus;
