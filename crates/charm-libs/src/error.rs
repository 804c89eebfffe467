//! Error types for the charm libraries
//!
//! Each concern gets its own enum so callers can tell validation problems
//! (never retried) apart from infrastructure problems (retried, then surfaced)
//! and permission problems (operator action required).

use thiserror::Error;

/// Errors produced while validating or transforming resource specs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    /// A value could not be parsed as a Kubernetes quantity
    #[error("invalid quantity '{0}'")]
    InvalidQuantity(String),

    /// The limits spec failed validation
    #[error("Invalid limits spec: {0}")]
    InvalidLimits(String),

    /// The (default) requests spec failed validation
    #[error("Invalid requests spec: {0}")]
    InvalidRequests(String),

    /// Scaling factor outside of the open interval (0, 1)
    #[error("scaling_factor must be in the range (0, 1), got {0}")]
    ScalingFactorOutOfRange(String),

    /// Raised by a caller-supplied spec function
    #[error("{0}")]
    Invalid(String),
}

impl SpecError {
    /// Create an error for a caller-supplied spec function
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Error returned by the cluster resource API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The API server answered with an error status
    #[error("{message}")]
    Status { code: u16, message: String },

    /// The request never got a response (connection, TLS, decoding)
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// HTTP status code, if the server answered
    pub fn code(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            ApiError::Transport(_) => None,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.code() == Some(403)
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    /// Conflicts, throttling, server-side and transport errors are worth retrying
    pub fn is_transient(&self) -> bool {
        match self.code() {
            Some(code) => code == 409 || code == 429 || code >= 500,
            None => true,
        }
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => ApiError::Status {
                code: resp.code,
                message: resp.message,
            },
            other => ApiError::Transport(other.to_string()),
        }
    }
}

/// Errors surfaced by the compute-resources patch
///
/// The `Display` output is the human-readable message carried by the
/// `PatchFailed` event and by the blocked status.
#[derive(Debug, Error)]
pub enum PatchError {
    /// A limits/requests spec function failed
    #[error("Failed obtaining resource limit spec: {0}")]
    SpecFunction(SpecError),

    /// A spec function returned something that does not validate
    #[error("Invalid resource limit spec: {0}")]
    InvalidSpec(String),

    /// The Kubernetes client could not be created
    #[error("Error creating k8s client: {0}")]
    Client(String),

    /// The application lacks the RBAC permissions to patch
    #[error("Kubernetes resources patch failed: `juju trust` this application. {0}")]
    Forbidden(ApiError),

    /// Any other API failure (after retries where applicable)
    #[error("Kubernetes resources patch failed: {0}")]
    Api(ApiError),

    /// The managed container is missing from the workload
    #[error("Kubernetes resources patch failed: Container '{0}' not found")]
    ContainerNotFound(String),

    /// The namespace could not be determined
    #[error("cannot determine kubernetes namespace: {0}")]
    Namespace(String),
}

impl From<ApiError> for PatchError {
    fn from(err: ApiError) -> Self {
        if err.is_forbidden() {
            PatchError::Forbidden(err)
        } else {
            PatchError::Api(err)
        }
    }
}

impl PatchError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, PatchError::Api(e) if e.is_transient())
    }
}

/// Errors raised by the host model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("relation '{0}' not found")]
    RelationNotFound(String),

    #[error("secret '{0}' not found")]
    SecretNotFound(String),

    #[error("juju {0} does not support secrets")]
    SecretsUnsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by vault backends
#[derive(Debug, Error)]
pub enum VaultError {
    /// The backing relation does not exist yet (or any more)
    #[error("vault backend not ready: {0}")]
    NotReady(#[source] HostError),

    #[error("vault host error: {0}")]
    Host(#[from] HostError),

    #[error("vault contents are not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the certificate handler
#[derive(Debug, Error)]
pub enum CertError {
    /// Secret support is required but the host lacks it
    #[error("juju {0} does not support secrets; juju >= 3.0.3 is needed")]
    SecretsUnsupported(String),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("private key generation failed: {0}")]
    KeyGeneration(String),

    #[error("CSR generation failed: {0}")]
    Csr(String),

    /// The CA peer rejected or could not take a request
    #[error("certificates relation error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_maps_to_trust_message() {
        let err: PatchError = ApiError::status(403, "forbidden").into();
        assert!(matches!(err, PatchError::Forbidden(_)));
        assert_eq!(
            err.to_string(),
            "Kubernetes resources patch failed: `juju trust` this application. forbidden"
        );
    }

    #[test]
    fn test_generic_api_error_message() {
        let err: PatchError = ApiError::status(401, "unauthorized").into();
        assert_eq!(err.to_string(), "Kubernetes resources patch failed: unauthorized");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::status(409, "conflict").is_transient());
        assert!(ApiError::status(503, "unavailable").is_transient());
        assert!(ApiError::Transport("reset".into()).is_transient());
        assert!(!ApiError::status(403, "nope").is_transient());
        assert!(!ApiError::status(422, "invalid").is_transient());
        assert!(ApiError::status(404, "missing").is_not_found());
    }
}
