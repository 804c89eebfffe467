//! TLS certificate lifecycle for one unit identity
//!
//! The handler keeps a private key and a CSR in a [`Vault`] for the lifetime
//! of the unit, talks to the CA over the certificates relation and stores the
//! certificate it gets back. Callers learn about changes through
//! [`LibraryEvent::CertChanged`] and re-read the material from the handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::csr::{generate_csr, generate_private_key, Sans};
use super::protocol::{
    CertificateAvailable, CertificateExpiring, CertificateInvalidated, CertificatesRequirer,
};
use super::vault::{
    RelationVaultBackend, SecretVaultBackend, Vault, VaultContents, DEFAULT_SECRET_LABEL,
};
use crate::config::LibConfig;
use crate::error::{CertError, VaultError};
use crate::framework::{EventEmitter, EventKind, HostEvent, LibraryEvent, Observer};
use crate::host::{pod_name, JujuVersion, Model};
use crate::observability::{LibMetrics, StructuredLogger};
use crate::status::UnitStatus;

pub const DEFAULT_CERTIFICATES_RELATION: &str = "certificates";
pub const DEFAULT_PEER_RELATION: &str = "peers";

/// Vault keys
pub mod keys {
    pub const PRIVATE_KEY: &str = "private-key";
    pub const CSR: &str = "csr";
    pub const CSR_IDENTITY: &str = "csr-identity";
    pub const SERVER_CERT: &str = "server-cert";
    pub const CA_CERT: &str = "ca-cert";
    pub const CHAIN: &str = "chain";

    /// Material supplied by the CA
    pub const CERT_MATERIAL: [&str; 3] = [SERVER_CERT, CA_CERT, CHAIN];
}

/// Builder for [`CertHandler`]
pub struct CertHandlerBuilder {
    model: Arc<dyn Model>,
    certificates: Arc<dyn CertificatesRequirer>,
    relation_name: String,
    peer_relation_name: String,
    secret_label: String,
    cert_subject: Option<String>,
    sans: Vec<String>,
    juju_version: Option<JujuVersion>,
    require_secrets: bool,
    refresh_events: Vec<EventKind>,
}

impl CertHandlerBuilder {
    pub fn new(model: Arc<dyn Model>, certificates: Arc<dyn CertificatesRequirer>) -> Self {
        Self {
            model,
            certificates,
            relation_name: DEFAULT_CERTIFICATES_RELATION.to_string(),
            peer_relation_name: DEFAULT_PEER_RELATION.to_string(),
            secret_label: DEFAULT_SECRET_LABEL.to_string(),
            cert_subject: None,
            sans: Vec::new(),
            juju_version: None,
            require_secrets: false,
            refresh_events: Vec::new(),
        }
    }

    /// Must match the relation name in the charm metadata
    pub fn relation_name(mut self, name: impl Into<String>) -> Self {
        self.relation_name = name.into();
        self
    }

    pub fn peer_relation_name(mut self, name: impl Into<String>) -> Self {
        self.peer_relation_name = name.into();
        self
    }

    pub fn secret_label(mut self, label: impl Into<String>) -> Self {
        self.secret_label = label.into();
        self
    }

    /// Certificate subject; defaults to the unit name with `/` replaced by `-`
    pub fn cert_subject(mut self, subject: impl Into<String>) -> Self {
        self.cert_subject = Some(subject.into());
        self
    }

    /// SANs to request; defaults to the unit's FQDN
    pub fn sans<I, S>(mut self, sans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sans = sans.into_iter().map(Into::into).collect();
        self
    }

    /// Override the Juju version reported by the model
    pub fn juju_version(mut self, version: JujuVersion) -> Self {
        self.juju_version = Some(version);
        self
    }

    /// Fail instead of falling back to the peer relation on old Juju
    pub fn require_secrets(mut self, require: bool) -> Self {
        self.require_secrets = require;
        self
    }

    /// Extra host events that re-check the CSR identity, like config-changed
    pub fn refresh_events(mut self, events: Vec<EventKind>) -> Self {
        self.refresh_events = events;
        self
    }

    /// Apply the relevant settings from a [`LibConfig`]
    pub fn with_config(mut self, config: &LibConfig) -> Self {
        if let Some(version) = config.juju_version() {
            self.juju_version = Some(version);
        }
        self.require_secrets = config.require_secrets;
        self
    }

    pub fn build(self, emitter: EventEmitter) -> Result<CertHandler, CertError> {
        let version = self.juju_version.unwrap_or_else(|| self.model.juju_version());
        let unit = self.model.unit_name();

        let vault = if version.has_secrets() {
            Vault::new(Box::new(SecretVaultBackend::new(
                self.model.clone(),
                self.secret_label.clone(),
            )))
        } else if self.require_secrets {
            error!(juju_version = %version, "Juju does not support secrets; juju >= 3.0.3 is needed");
            return Err(CertError::SecretsUnsupported(version.to_string()));
        } else {
            warn!(
                juju_version = %version,
                relation = %self.peer_relation_name,
                "Juju does not support secrets, storing certificate material in the peer relation"
            );
            Vault::new(Box::new(RelationVaultBackend::new(
                self.model.clone(),
                self.peer_relation_name.clone(),
            )))
        };

        let cert_subject = self.cert_subject.unwrap_or_else(|| pod_name(&unit));
        let sans = Sans::resolve(self.sans.as_slice(), &self.model.hostname());

        Ok(CertHandler {
            model: self.model,
            certificates: self.certificates,
            vault,
            relation_name: self.relation_name,
            peer_relation_name: self.peer_relation_name,
            cert_subject,
            sans,
            refresh_events: self.refresh_events,
            emitter,
            metrics: LibMetrics::new(),
            logger: StructuredLogger::new(unit),
            last_error: None,
        })
    }
}

/// Requirer side of the TLS certificates relation for this unit
pub struct CertHandler {
    model: Arc<dyn Model>,
    certificates: Arc<dyn CertificatesRequirer>,
    vault: Vault,
    relation_name: String,
    peer_relation_name: String,
    cert_subject: String,
    sans: Sans,
    refresh_events: Vec<EventKind>,
    emitter: EventEmitter,
    metrics: LibMetrics,
    logger: StructuredLogger,
    last_error: Option<String>,
}

impl CertHandler {
    pub fn builder(
        model: Arc<dyn Model>,
        certificates: Arc<dyn CertificatesRequirer>,
    ) -> CertHandlerBuilder {
        CertHandlerBuilder::new(model, certificates)
    }

    pub fn cert_subject(&self) -> &str {
        &self.cert_subject
    }

    pub fn sans(&self) -> &Sans {
        &self.sans
    }

    pub fn sans_dns(&self) -> &[String] {
        &self.sans.dns
    }

    pub fn sans_ip(&self) -> &[String] {
        &self.sans.ips
    }

    /// Name of the active vault backend ("secret" or "relation")
    pub fn vault_backend(&self) -> &'static str {
        self.vault.backend_name()
    }

    /// Whether the certificates relation is established with a CA
    pub fn enabled(&self) -> bool {
        self.model
            .relation(&self.relation_name)
            .map(|rel| rel.is_established())
            .unwrap_or(false)
    }

    /// Enabled, and a key and certificate are in hand
    pub fn available(&self) -> Result<bool, CertError> {
        if !self.enabled() {
            return Ok(false);
        }
        Ok(self.vault.get_value(keys::PRIVATE_KEY)?.is_some()
            && self.server_cert()?.is_some()
            && self.ca_cert()?.is_some())
    }

    /// The private key, generated and stored on first access
    ///
    /// A stored key is never replaced here: certificates already issued were
    /// signed for it.
    pub fn private_key(&self) -> Result<String, CertError> {
        if let Some(key) = self.vault.get_value(keys::PRIVATE_KEY)? {
            return Ok(key);
        }
        let key = generate_private_key()?;
        self.vault
            .store(VaultContents::from([(keys::PRIVATE_KEY.to_string(), key.clone())]), false)?;
        debug!(unit = %self.logger.unit(), "Generated private key");
        Ok(key)
    }

    /// The CSR currently tracked with the CA
    pub fn csr(&self) -> Result<Option<String>, CertError> {
        Ok(self.vault.get_value(keys::CSR)?)
    }

    pub fn server_cert(&self) -> Result<Option<String>, CertError> {
        Ok(self.vault.get_value(keys::SERVER_CERT)?)
    }

    pub fn ca_cert(&self) -> Result<Option<String>, CertError> {
        Ok(self.vault.get_value(keys::CA_CERT)?)
    }

    /// CA chain as a single PEM bundle
    pub fn chain(&self) -> Result<Option<String>, CertError> {
        Ok(self.vault.get_value(keys::CHAIN)?)
    }

    /// Status contribution: blocked after a failure, waiting for the CA
    pub fn status(&self) -> UnitStatus {
        if let Some(message) = &self.last_error {
            return UnitStatus::blocked(message.clone());
        }
        match self.available() {
            Ok(true) => UnitStatus::active(),
            Ok(false) if self.enabled() => UnitStatus::waiting("waiting for certificate"),
            Ok(false) => UnitStatus::active(),
            Err(e) => UnitStatus::blocked(e.to_string()),
        }
    }

    /// Message of the last failed event, if any
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn identity(&self) -> String {
        format!("cn={};{}", self.cert_subject, self.sans.fingerprint())
    }

    /// Create a CSR and send it to the CA
    ///
    /// An existing CSR is only replaced when `overwrite` or `renew` is set;
    /// with `renew` and an existing CSR a renewal (old, new) is requested
    /// instead of a creation. `clear_cert` drops the stored certificate
    /// material but keeps the private key. Nothing is emitted here.
    pub fn generate_csr(&self, overwrite: bool, renew: bool, clear_cert: bool) -> Result<(), CertError> {
        if self.model.relation(&self.relation_name).is_none() {
            warn!(relation = %self.relation_name, "No relation found, cannot generate csr");
            return Ok(());
        }

        let existing = self.csr()?;
        if overwrite || renew || existing.is_none() {
            let private_key = self.private_key()?;
            let csr = generate_csr(&private_key, &self.cert_subject, &self.sans)?;

            let previous_identity = self.vault.get_value(keys::CSR_IDENTITY)?;
            self.vault.store(
                VaultContents::from([
                    (keys::CSR.to_string(), csr.clone()),
                    (keys::CSR_IDENTITY.to_string(), self.identity()),
                ]),
                false,
            )?;

            let submitted = match existing.as_deref() {
                Some(old) if renew => self
                    .certificates
                    .request_certificate_renewal(old, &csr)
                    .map(|()| "renewal"),
                _ => {
                    info!(
                        subject = %self.cert_subject,
                        dns = ?self.sans.dns,
                        ips = ?self.sans.ips,
                        "Creating CSR"
                    );
                    self.certificates
                        .request_certificate_creation(&csr)
                        .map(|()| "creation")
                }
            };
            let kind = match submitted {
                Ok(kind) => kind,
                Err(e) => {
                    if let Err(restore) = self.restore_csr(existing, previous_identity) {
                        error!(error = %restore, "Failed to restore previous CSR");
                    }
                    return Err(e);
                }
            };

            self.metrics.inc_csr_requests(kind);
            self.logger.log_csr_requested(kind, &self.cert_subject, self.sans.len());
        }

        if clear_cert {
            self.vault.remove(&keys::CERT_MATERIAL)?;
        }

        Ok(())
    }

    /// Put back the CSR a failed submission replaced; absent values are removed
    fn restore_csr(&self, csr: Option<String>, identity: Option<String>) -> Result<(), VaultError> {
        let mut previous = VaultContents::new();
        let mut absent = Vec::new();
        for (key, value) in [(keys::CSR, csr), (keys::CSR_IDENTITY, identity)] {
            match value {
                Some(value) => {
                    previous.insert(key.to_string(), value);
                }
                None => absent.push(key),
            }
        }
        if !previous.is_empty() {
            self.vault.store(previous, false)?;
        }
        self.vault.remove(&absent)
    }

    /// Adopt the provider's certificate for our CSR if we do not hold it yet
    ///
    /// Covers certificate-available events that were missed. Returns whether
    /// anything changed; a cert-changed event is emitted in that case.
    pub fn sync_from_provider(&self) -> Result<bool, CertError> {
        let Some(csr) = self.csr()? else {
            return Ok(false);
        };

        let issued = self
            .certificates
            .get_provider_certificates()
            .into_iter()
            .find(|c| !c.revoked && same_pem(&c.csr, &csr));
        let Some(issued) = issued else {
            return Ok(false);
        };

        if self
            .server_cert()?
            .map(|held| same_pem(&held, &issued.certificate))
            .unwrap_or(false)
        {
            return Ok(false);
        }

        let chain = issued.chain_as_pem();
        self.store_cert(issued.certificate, issued.ca, chain)?;
        self.signal_changed("provider_sync");
        Ok(true)
    }

    /// Drop all stored material, private key included
    pub fn reset(&self) -> Result<(), CertError> {
        self.vault.nuke()?;
        self.signal_changed("reset");
        Ok(())
    }

    fn store_cert(&self, certificate: String, ca: String, chain: String) -> Result<(), CertError> {
        self.vault.store(
            VaultContents::from([
                (keys::SERVER_CERT.to_string(), certificate),
                (keys::CA_CERT.to_string(), ca),
                (keys::CHAIN.to_string(), chain),
            ]),
            false,
        )?;
        Ok(())
    }

    fn signal_changed(&self, reason: &str) {
        self.metrics.inc_cert_changed();
        self.logger.log_cert_changed(reason);
        self.emitter.emit(LibraryEvent::CertChanged);
    }

    fn holds_certificate(&self, certificate: &str) -> Result<bool, CertError> {
        Ok(self
            .server_cert()?
            .map(|held| same_pem(&held, certificate))
            .unwrap_or(false))
    }

    fn on_relation_joined(&self) -> Result<(), CertError> {
        if self.csr()?.is_none() {
            self.generate_csr(false, false, false)?;
        }
        Ok(())
    }

    fn on_config_changed(&self) -> Result<(), CertError> {
        if self.model.relation(&self.relation_name).is_none() {
            return Ok(());
        }
        let stored = self.vault.get_value(keys::CSR_IDENTITY)?;
        if self.csr()?.is_some() && stored.as_deref() == Some(self.identity().as_str()) {
            debug!(subject = %self.cert_subject, "CSR identity unchanged, not renewing");
            return Ok(());
        }
        self.generate_csr(false, true, false)
    }

    fn on_certificate_available(&self, event: &CertificateAvailable) -> Result<(), CertError> {
        let tracked = self.csr()?;
        if !tracked
            .as_deref()
            .map(|csr| same_pem(csr, &event.certificate_signing_request))
            .unwrap_or(false)
        {
            debug!("Ignoring certificate issued for a CSR that is not ours");
            return Ok(());
        }

        self.store_cert(
            event.certificate.clone(),
            event.ca.clone(),
            event.chain_as_pem(),
        )?;
        self.signal_changed("certificate_available");
        Ok(())
    }

    fn on_certificate_expiring(&self, event: &CertificateExpiring) -> Result<(), CertError> {
        if self.holds_certificate(&event.certificate)? {
            info!(expiry = %event.expiry, "Certificate expiring, requesting renewal");
            self.generate_csr(false, true, false)?;
        }
        Ok(())
    }

    fn on_certificate_invalidated(&self, event: &CertificateInvalidated) -> Result<(), CertError> {
        if !self.holds_certificate(&event.certificate)? {
            debug!(reason = ?event.reason, "Ignoring invalidation of a certificate we do not hold");
            return Ok(());
        }
        self.generate_csr(true, false, true)?;
        self.signal_changed("certificate_invalidated");
        Ok(())
    }

    fn on_all_certificates_invalidated(&self) -> Result<(), CertError> {
        self.generate_csr(true, false, true)?;
        self.signal_changed("all_certificates_invalidated");
        Ok(())
    }

    fn on_relation_broken(&self) -> Result<(), CertError> {
        let mut cleared: Vec<&str> = keys::CERT_MATERIAL.to_vec();
        cleared.extend([keys::CSR, keys::CSR_IDENTITY]);
        self.vault.remove(&cleared)?;
        self.signal_changed("relation_broken");
        Ok(())
    }

    fn on_upgrade_charm(&self) -> Result<(), CertError> {
        if self.vault.backend_name() != "secret" {
            return Ok(());
        }
        let peer = RelationVaultBackend::new(self.model.clone(), self.peer_relation_name.clone());
        let moved = self.vault.migrate_from(&peer)?;
        if moved > 0 {
            self.logger.log_vault_migrated(moved);
        }
        Ok(())
    }

    fn dispatch(&self, event: &HostEvent) -> Result<(), CertError> {
        match event {
            HostEvent::RelationJoined { relation } if *relation == self.relation_name => {
                self.on_relation_joined()
            }
            HostEvent::RelationBroken { relation } if *relation == self.relation_name => {
                self.on_relation_broken()
            }
            HostEvent::UpgradeCharm => self.on_upgrade_charm(),
            HostEvent::CertificateAvailable(e) => self.on_certificate_available(e),
            HostEvent::CertificateExpiring(e) => self.on_certificate_expiring(e),
            HostEvent::CertificateInvalidated(e) => self.on_certificate_invalidated(e),
            HostEvent::AllCertificatesInvalidated => self.on_all_certificates_invalidated(),
            HostEvent::ConfigChanged => self.on_config_changed(),
            other if self.refresh_events.contains(&other.kind()) => self.on_config_changed(),
            _ => Ok(()),
        }
    }
}

/// Compare PEM blobs ignoring surrounding whitespace
fn same_pem(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

#[async_trait]
impl Observer for CertHandler {
    fn name(&self) -> &str {
        "cert-handler"
    }

    fn observed_events(&self) -> Vec<EventKind> {
        let mut kinds = vec![
            EventKind::ConfigChanged,
            EventKind::UpgradeCharm,
            EventKind::RelationJoined(self.relation_name.clone()),
            EventKind::RelationBroken(self.relation_name.clone()),
            EventKind::CertificateAvailable,
            EventKind::CertificateExpiring,
            EventKind::CertificateInvalidated,
            EventKind::AllCertificatesInvalidated,
        ];
        for kind in &self.refresh_events {
            if !kinds.contains(kind) {
                kinds.push(kind.clone());
            }
        }
        kinds
    }

    async fn handle(&mut self, event: &HostEvent) {
        match self.dispatch(event) {
            Ok(()) => self.last_error = None,
            Err(e) => {
                error!(event = ?event.kind(), error = %e, "Certificate handler failed");
                self.last_error = Some(e.to_string());
            }
        }
    }
}
