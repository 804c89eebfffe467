//! Key-value secret storage for certificate material
//!
//! Two backends exist: the unit databag of the peer relation (plaintext, for
//! Juju versions without secrets) and an application-owned Juju secret. The
//! backend is picked once when the [`Vault`] is built.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{HostError, VaultError};
use crate::host::Model;

pub type VaultContents = BTreeMap<String, String>;

/// Key under which the relation backend nests its JSON blob
pub const DEFAULT_NEST_UNDER: &str = "secret-contents";

/// Label of the secret used by the secret backend
pub const DEFAULT_SECRET_LABEL: &str = "cert-handler-private-vault";

/// Placeholder written when a secret is created; secrets cannot be empty
const UNINITIALIZED_KEY: &str = "uninitialized-secret-key";

/// Storage strategy behind a [`Vault`]
pub trait VaultBackend: Send + Sync {
    /// Merge `contents` into what is stored, or replace it when `clear`
    fn store(&self, contents: VaultContents, clear: bool) -> Result<(), VaultError>;

    fn get_value(&self, key: &str) -> Result<Option<String>, VaultError> {
        Ok(self.retrieve()?.remove(key))
    }

    fn retrieve(&self) -> Result<VaultContents, VaultError>;

    /// Drop everything
    fn nuke(&self) -> Result<(), VaultError>;

    fn name(&self) -> &'static str;
}

/// Stores the vault as JSON in this unit's databag on a relation
pub struct RelationVaultBackend {
    model: Arc<dyn Model>,
    relation_name: String,
    nest_under: String,
}

impl RelationVaultBackend {
    pub fn new(model: Arc<dyn Model>, relation_name: impl Into<String>) -> Self {
        Self {
            model,
            relation_name: relation_name.into(),
            nest_under: DEFAULT_NEST_UNDER.to_string(),
        }
    }

    /// Nest under a different databag key; it must be unique within the charm
    pub fn with_nest_under(mut self, key: impl Into<String>) -> Self {
        self.nest_under = key.into();
        self
    }

    fn check_ready(&self) -> Result<(), VaultError> {
        match self.model.relation(&self.relation_name) {
            Some(_) => Ok(()),
            None => Err(VaultError::NotReady(HostError::RelationNotFound(
                self.relation_name.clone(),
            ))),
        }
    }

    fn read(&self) -> Result<VaultContents, VaultError> {
        self.check_ready()?;
        let raw = self
            .model
            .unit_data_get(&self.relation_name, &self.nest_under)
            .map_err(not_ready)?;
        match raw.filter(|v| !v.is_empty()) {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(VaultContents::new()),
        }
    }

    fn write(&self, contents: &VaultContents) -> Result<(), VaultError> {
        let raw = serde_json::to_string(contents)?;
        self.model
            .unit_data_set(&self.relation_name, &self.nest_under, Some(raw))
            .map_err(not_ready)
    }
}

fn not_ready(err: HostError) -> VaultError {
    match err {
        HostError::RelationNotFound(_) => VaultError::NotReady(err),
        other => VaultError::Host(other),
    }
}

impl VaultBackend for RelationVaultBackend {
    fn store(&self, contents: VaultContents, clear: bool) -> Result<(), VaultError> {
        let mut current = if clear { VaultContents::new() } else { self.read()? };
        current.extend(contents);
        self.check_ready()?;
        self.write(&current)
    }

    fn retrieve(&self) -> Result<VaultContents, VaultError> {
        self.read()
    }

    fn nuke(&self) -> Result<(), VaultError> {
        self.check_ready()?;
        self.model
            .unit_data_set(&self.relation_name, &self.nest_under, None)
            .map_err(not_ready)
    }

    fn name(&self) -> &'static str {
        "relation"
    }
}

/// Stores the vault in an application-owned Juju secret
pub struct SecretVaultBackend {
    model: Arc<dyn Model>,
    label: String,
}

impl SecretVaultBackend {
    pub fn new(model: Arc<dyn Model>, label: impl Into<String>) -> Self {
        Self {
            model,
            label: label.into(),
        }
    }

    /// Current content, `None` when the secret does not exist yet
    fn current(&self) -> Result<Option<VaultContents>, VaultError> {
        match self.model.get_secret_content(&self.label, true) {
            Ok(content) => Ok(Some(content)),
            Err(HostError::SecretNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl VaultBackend for SecretVaultBackend {
    fn store(&self, contents: VaultContents, clear: bool) -> Result<(), VaultError> {
        let mut current = match self.current()? {
            Some(current) => current,
            None => {
                debug!(label = %self.label, "Creating vault secret");
                let placeholder =
                    VaultContents::from([(UNINITIALIZED_KEY.to_string(), "42".to_string())]);
                self.model.add_secret(&self.label, placeholder.clone())?;
                placeholder
            }
        };

        if clear {
            current.clear();
        } else {
            current.remove(UNINITIALIZED_KEY);
        }
        current.extend(contents);
        self.model.set_secret_content(&self.label, current)?;
        Ok(())
    }

    fn retrieve(&self) -> Result<VaultContents, VaultError> {
        let mut content = self.current()?.unwrap_or_default();
        content.remove(UNINITIALIZED_KEY);
        Ok(content)
    }

    fn nuke(&self) -> Result<(), VaultError> {
        match self.model.remove_all_revisions(&self.label) {
            Ok(()) | Err(HostError::SecretNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "secret"
    }
}

/// Secret storage facade used by the certificate handler
pub struct Vault {
    backend: Box<dyn VaultBackend>,
}

impl Vault {
    pub fn new(backend: Box<dyn VaultBackend>) -> Self {
        Self { backend }
    }

    /// Store `contents`, merging with or replacing (`clear`) what is there
    pub fn store(&self, contents: VaultContents, clear: bool) -> Result<(), VaultError> {
        self.backend.store(contents, clear)
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>, VaultError> {
        self.backend.get_value(key)
    }

    pub fn retrieve(&self) -> Result<VaultContents, VaultError> {
        self.backend.retrieve()
    }

    pub fn nuke(&self) -> Result<(), VaultError> {
        self.backend.nuke()
    }

    /// Remove some keys and keep the rest
    ///
    /// Removing the last key drops the whole vault, as a Juju secret cannot
    /// hold empty content.
    pub fn remove(&self, keys: &[&str]) -> Result<(), VaultError> {
        let mut current = self.retrieve()?;
        let before = current.len();
        current.retain(|k, _| !keys.contains(&k.as_str()));
        if current.len() == before {
            return Ok(());
        }
        if current.is_empty() {
            return self.nuke();
        }
        self.store(current, true)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Move everything from `source` into this vault, then clear `source`
    ///
    /// Does nothing when this vault already holds data or `source` is empty
    /// or not ready. Returns the number of keys moved.
    pub fn migrate_from(&self, source: &dyn VaultBackend) -> Result<usize, VaultError> {
        if !self.retrieve()?.is_empty() {
            return Ok(0);
        }

        let contents = match source.retrieve() {
            Ok(contents) => contents,
            Err(VaultError::NotReady(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        if contents.is_empty() {
            return Ok(0);
        }

        let moved = contents.len();
        self.store(contents, false)?;
        source.nuke()?;
        Ok(moved)
    }
}
