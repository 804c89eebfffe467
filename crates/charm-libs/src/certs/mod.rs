//! TLS certificate management for a unit
//!
//! - `vault`: where the private key, CSR and certificates are kept
//! - `csr`: key and CSR generation
//! - `protocol`: the CA peer on the certificates relation
//! - `handler`: the certificate state machine

pub mod csr;
pub mod handler;
pub mod protocol;
pub mod vault;

pub use csr::{generate_csr, generate_private_key, is_ipv4, Sans};
pub use handler::{CertHandler, CertHandlerBuilder};
pub use protocol::{
    CertificateAvailable, CertificateExpiring, CertificateInvalidated, CertificatesRequirer,
    InMemoryCertificates, InvalidationReason, ProviderCertificate, RequirerCsr,
};
pub use vault::{RelationVaultBackend, SecretVaultBackend, Vault, VaultBackend, VaultContents};
