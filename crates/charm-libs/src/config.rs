//! Library configuration
//!
//! Values come from `CHARM_LIBS_*` environment variables, falling back to
//! defaults that match what a charm running in a Kubernetes pod needs.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::host::JujuVersion;
use crate::resources::DEFAULT_FIELD_MANAGER;
use crate::retry::RetryPolicy;

/// Service account namespace file mounted into every pod
pub const DEFAULT_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

const ENV_PREFIX: &str = "CHARM_LIBS";

/// Configuration shared by the library components
#[derive(Debug, Clone, Deserialize)]
pub struct LibConfig {
    /// Namespace override; read from `namespace_file` when unset
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_namespace_file")]
    pub namespace_file: PathBuf,

    /// Field manager recorded on server-side-apply patches
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    #[serde(default = "default_initial_backoff_ms")]
    pub patch_retry_initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub patch_retry_max_backoff_ms: u64,

    /// Time budget for patch retries; 0 disables retrying
    #[serde(default = "default_stop_after_secs")]
    pub patch_retry_stop_after_secs: u64,

    /// Juju version override; `JUJU_VERSION` is used when unset
    #[serde(default)]
    pub juju_version: Option<String>,

    /// Refuse certificate handling when the host has no secrets support
    #[serde(default)]
    pub require_secrets: bool,
}

fn default_namespace_file() -> PathBuf {
    PathBuf::from(DEFAULT_NAMESPACE_FILE)
}

fn default_field_manager() -> String {
    DEFAULT_FIELD_MANAGER.to_string()
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    20_000
}

fn default_stop_after_secs() -> u64 {
    20
}

impl Default for LibConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            namespace_file: default_namespace_file(),
            field_manager: default_field_manager(),
            patch_retry_initial_backoff_ms: default_initial_backoff_ms(),
            patch_retry_max_backoff_ms: default_max_backoff_ms(),
            patch_retry_stop_after_secs: default_stop_after_secs(),
            juju_version: None,
            require_secrets: false,
        }
    }
}

impl LibConfig {
    /// Load configuration from `CHARM_LIBS_*` environment variables
    pub fn load() -> Result<Self> {
        Self::load_with_prefix(ENV_PREFIX)
    }

    pub fn load_with_prefix(prefix: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(prefix).try_parsing(true))
            .build()
            .context("failed to read configuration sources")?;

        config
            .try_deserialize()
            .context("invalid charm-libs configuration")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.patch_retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.patch_retry_max_backoff_ms),
            stop_after: Duration::from_secs(self.patch_retry_stop_after_secs),
            ..Default::default()
        }
    }

    /// Namespace of the running workload
    pub fn resolve_namespace(&self) -> Result<String> {
        if let Some(ns) = self.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            return Ok(ns.to_string());
        }
        let raw = std::fs::read_to_string(&self.namespace_file).with_context(|| {
            format!("failed to read namespace from {}", self.namespace_file.display())
        })?;
        let ns = raw.trim();
        anyhow::ensure!(!ns.is_empty(), "namespace file {} is empty", self.namespace_file.display());
        Ok(ns.to_string())
    }

    /// Juju version from the override or the environment
    pub fn juju_version(&self) -> Option<JujuVersion> {
        match &self.juju_version {
            Some(v) => v.parse().ok(),
            None => JujuVersion::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LibConfig::default();
        assert_eq!(config.field_manager, DEFAULT_FIELD_MANAGER);
        assert_eq!(DEFAULT_FIELD_MANAGER, "KubernetesComputeResourcesPatch");
        assert_eq!(config.namespace_file, PathBuf::from(DEFAULT_NAMESPACE_FILE));
        assert_eq!(config.retry_policy().stop_after, Duration::from_secs(20));
        assert!(!config.require_secrets);
    }

    #[test]
    fn test_load_without_env_uses_defaults() {
        let config = LibConfig::load_with_prefix("CHARM_LIBS_TEST_EMPTY").unwrap();
        assert_eq!(config.field_manager, default_field_manager());
        assert_eq!(config.patch_retry_max_backoff_ms, 20_000);
    }

    #[test]
    fn test_load_from_env() {
        std::env::set_var("CHARM_LIBS_TEST_ENV_FIELD_MANAGER", "my-charm");
        std::env::set_var("CHARM_LIBS_TEST_ENV_PATCH_RETRY_STOP_AFTER_SECS", "0");
        std::env::set_var("CHARM_LIBS_TEST_ENV_REQUIRE_SECRETS", "true");

        let config = LibConfig::load_with_prefix("CHARM_LIBS_TEST_ENV").unwrap();
        assert_eq!(config.field_manager, "my-charm");
        assert_eq!(config.retry_policy().stop_after, Duration::ZERO);
        assert!(config.require_secrets);
    }

    #[test]
    fn test_namespace_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "observability").unwrap();

        let config = LibConfig {
            namespace_file: file.path().to_path_buf(),
            ..Default::default()
        };
        assert_eq!(config.resolve_namespace().unwrap(), "observability");

        let overridden = LibConfig {
            namespace: Some("cos".into()),
            ..config
        };
        assert_eq!(overridden.resolve_namespace().unwrap(), "cos");
    }

    #[test]
    fn test_missing_namespace_file_is_an_error() {
        let config = LibConfig {
            namespace_file: PathBuf::from("/nonexistent/namespace"),
            ..Default::default()
        };
        assert!(config.resolve_namespace().is_err());
    }

    #[test]
    fn test_juju_version_override() {
        let config = LibConfig {
            juju_version: Some("2.9.44".into()),
            ..Default::default()
        };
        assert_eq!(config.juju_version(), Some(JujuVersion::new(2, 9, 44)));
    }
}
