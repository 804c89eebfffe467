//! Requirer side of the certificates relation
//!
//! The CA peer is a request/response channel: the unit submits CSRs and the
//! provider answers with certificates, or later tells it a certificate is
//! expiring or was invalidated.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CertError;

/// A CSR this unit has published on the relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirerCsr {
    pub relation_id: u32,
    pub csr: String,
    pub is_ca: bool,
}

/// A certificate the provider has published for one of our CSRs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCertificate {
    pub relation_id: u32,
    pub application_name: String,
    pub csr: String,
    pub certificate: String,
    pub ca: String,
    pub chain: Vec<String>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub expiry_time: Option<DateTime<Utc>>,
}

impl ProviderCertificate {
    /// Chain as a single PEM bundle
    pub fn chain_as_pem(&self) -> String {
        self.chain.join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateAvailable {
    pub certificate: String,
    pub certificate_signing_request: String,
    pub ca: String,
    pub chain: Vec<String>,
}

impl CertificateAvailable {
    pub fn chain_as_pem(&self) -> String {
        self.chain.join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateExpiring {
    pub certificate: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationReason {
    Revoked,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInvalidated {
    pub reason: InvalidationReason,
    pub certificate: String,
    pub certificate_signing_request: String,
    pub ca: String,
    pub chain: Vec<String>,
}

/// Requests the unit can make to its CA peer
pub trait CertificatesRequirer: Send + Sync {
    fn request_certificate_creation(&self, csr: &str) -> Result<(), CertError>;

    fn request_certificate_renewal(&self, old_csr: &str, new_csr: &str) -> Result<(), CertError>;

    fn get_requirer_csrs(&self) -> Vec<RequirerCsr>;

    fn get_provider_certificates(&self) -> Vec<ProviderCertificate>;
}

/// Requirer that keeps the relation state in memory
///
/// Useful for tests and local harnesses: `issue` plays the provider's part.
#[derive(Debug, Default)]
pub struct InMemoryCertificates {
    relation_id: u32,
    state: RwLock<RequirerState>,
}

#[derive(Debug, Default)]
struct RequirerState {
    csrs: Vec<RequirerCsr>,
    certificates: Vec<ProviderCertificate>,
    creations: usize,
    renewals: usize,
    rejection: Option<String>,
}

impl InMemoryCertificates {
    pub fn new(relation_id: u32) -> Self {
        Self {
            relation_id,
            ..Default::default()
        }
    }

    /// Publish a certificate for `csr`, as the provider would
    pub fn issue(&self, csr: &str, certificate: &str, ca: &str, chain: Vec<String>) -> ProviderCertificate {
        let issued = ProviderCertificate {
            relation_id: self.relation_id,
            application_name: "ca".to_string(),
            csr: csr.to_string(),
            certificate: certificate.to_string(),
            ca: ca.to_string(),
            chain,
            revoked: false,
            expiry_time: None,
        };
        let mut state = self.write();
        state.certificates.retain(|c| c.csr != csr);
        state.certificates.push(issued.clone());
        issued
    }

    /// Fail the next creation or renewal request with `reason`
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.write().rejection = Some(reason.into());
    }

    /// Number of creation requests received
    pub fn creations(&self) -> usize {
        self.read().creations
    }

    /// Number of renewal requests received
    pub fn renewals(&self) -> usize {
        self.read().renewals
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RequirerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RequirerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl CertificatesRequirer for InMemoryCertificates {
    fn request_certificate_creation(&self, csr: &str) -> Result<(), CertError> {
        let mut state = self.write();
        if let Some(reason) = state.rejection.take() {
            return Err(CertError::Protocol(reason));
        }
        if !state.csrs.iter().any(|c| c.csr == csr) {
            state.csrs.push(RequirerCsr {
                relation_id: self.relation_id,
                csr: csr.to_string(),
                is_ca: false,
            });
        }
        state.creations += 1;
        Ok(())
    }

    fn request_certificate_renewal(&self, old_csr: &str, new_csr: &str) -> Result<(), CertError> {
        let mut state = self.write();
        if let Some(reason) = state.rejection.take() {
            return Err(CertError::Protocol(reason));
        }
        state.csrs.retain(|c| c.csr != old_csr);
        state.csrs.push(RequirerCsr {
            relation_id: self.relation_id,
            csr: new_csr.to_string(),
            is_ca: false,
        });
        state.renewals += 1;
        Ok(())
    }

    fn get_requirer_csrs(&self) -> Vec<RequirerCsr> {
        self.read().csrs.clone()
    }

    fn get_provider_certificates(&self) -> Vec<ProviderCertificate> {
        self.read().certificates.clone()
    }
}
