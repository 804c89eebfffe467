//! Observability infrastructure for the charm libraries
//!
//! Provides:
//! - Prometheus counters for patch attempts and certificate requests
//! - Structured logging with tracing

use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use std::sync::OnceLock;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<LibMetricsInner> = OnceLock::new();

struct LibMetricsInner {
    patch_attempts: IntCounter,
    patches_applied: IntCounter,
    patch_failures: IntCounter,
    csr_requests: IntCounterVec,
    cert_changed: IntCounter,
}

impl LibMetricsInner {
    fn new() -> Self {
        Self {
            patch_attempts: register_int_counter!(
                "charm_libs_resource_patch_attempts_total",
                "Number of compute-resource reconciliations started"
            )
            .expect("Failed to register patch_attempts"),

            patches_applied: register_int_counter!(
                "charm_libs_resource_patches_applied_total",
                "Number of StatefulSet resource patches sent to the API server"
            )
            .expect("Failed to register patches_applied"),

            patch_failures: register_int_counter!(
                "charm_libs_resource_patch_failures_total",
                "Number of reconciliations that ended in a PatchFailed event"
            )
            .expect("Failed to register patch_failures"),

            csr_requests: register_int_counter_vec!(
                "charm_libs_csr_requests_total",
                "Certificate signing requests sent to the CA, by kind",
                &["kind"]
            )
            .expect("Failed to register csr_requests"),

            cert_changed: register_int_counter!(
                "charm_libs_cert_changed_total",
                "Number of cert-changed signals emitted"
            )
            .expect("Failed to register cert_changed"),
        }
    }
}

/// Handle to the library's Prometheus metrics
///
/// Clones share the same underlying global metrics.
#[derive(Clone)]
pub struct LibMetrics {
    _private: (),
}

impl Default for LibMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LibMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(LibMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &LibMetricsInner {
        GLOBAL_METRICS.get_or_init(LibMetricsInner::new)
    }

    pub fn inc_patch_attempts(&self) {
        self.inner().patch_attempts.inc();
    }

    pub fn inc_patches_applied(&self) {
        self.inner().patches_applied.inc();
    }

    pub fn inc_patch_failures(&self) {
        self.inner().patch_failures.inc();
    }

    /// Count a CSR sent to the CA; `kind` is "creation" or "renewal"
    pub fn inc_csr_requests(&self, kind: &str) {
        self.inner().csr_requests.with_label_values(&[kind]).inc();
    }

    pub fn inc_cert_changed(&self) {
        self.inner().cert_changed.inc();
    }

    pub fn patch_failures(&self) -> u64 {
        self.inner().patch_failures.get()
    }

    pub fn csr_requests(&self, kind: &str) -> u64 {
        self.inner().csr_requests.with_label_values(&[kind]).get()
    }
}

/// Install the global tracing subscriber
///
/// Filter comes from `RUST_LOG`, defaulting to `info`. Calling this more than
/// once is harmless; later calls leave the first subscriber in place.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
    };

    if result.is_ok() {
        info!(event = "tracing_initialized", json = json, "Tracing initialized");
    }
}

/// Structured logger for library events
#[derive(Clone)]
pub struct StructuredLogger {
    unit: String,
}

impl StructuredLogger {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Log a StatefulSet patch that was sent
    pub fn log_patch_applied(&self, namespace: &str, statefulset: &str, container: &str, resources: &str) {
        info!(
            event = "resources_patched",
            unit = %self.unit,
            namespace = %namespace,
            statefulset = %statefulset,
            container = %container,
            resources = %resources,
            "Patched StatefulSet resources"
        );
    }

    /// Log a reconciliation that ended in failure
    pub fn log_patch_failed(&self, message: &str) {
        warn!(
            event = "resources_patch_failed",
            unit = %self.unit,
            message = %message,
            "Compute resources patch failed"
        );
    }

    /// Log a CSR sent to the CA
    pub fn log_csr_requested(&self, kind: &str, common_name: &str, sans: usize) {
        info!(
            event = "csr_requested",
            unit = %self.unit,
            kind = %kind,
            common_name = %common_name,
            sans = sans,
            "Certificate signing request sent"
        );
    }

    /// Log a certificate change
    pub fn log_cert_changed(&self, reason: &str) {
        info!(
            event = "cert_changed",
            unit = %self.unit,
            reason = %reason,
            "Certificate material changed"
        );
    }

    /// Log a vault migration
    pub fn log_vault_migrated(&self, keys: usize) {
        info!(
            event = "vault_migrated",
            unit = %self.unit,
            keys = keys,
            "Migrated certificate vault from peer relation to secret"
        );
    }
}
