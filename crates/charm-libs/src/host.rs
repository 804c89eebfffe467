//! Host model seen by the libraries
//!
//! The charm runtime owns the unit's identity, its relations and its secrets.
//! Components only talk to it through the traits below, which keeps them
//! testable against [`InMemoryModel`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// A Juju agent version such as `3.1.6` or `2.9.44.1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JujuVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl JujuVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// First version with a usable secrets API
    pub const SECRETS_MIN: JujuVersion = JujuVersion::new(3, 0, 3);

    /// Read the version from `JUJU_VERSION`
    pub fn from_env() -> Option<Self> {
        std::env::var("JUJU_VERSION").ok()?.parse().ok()
    }

    pub fn has_secrets(&self) -> bool {
        *self >= Self::SECRETS_MIN
    }
}

impl FromStr for JujuVersion {
    type Err = HostError;

    /// Accepts `major.minor.patch[.build]` and `major.minor-tag[patch]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HostError::Other(format!("invalid juju version '{s}'"));

        let (numeric, tag) = match s.split_once('-') {
            Some((numeric, tag)) => (numeric, Some(tag)),
            None => (s, None),
        };

        let mut parts = numeric.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let patch = match (parts.next(), tag) {
            (Some(p), _) => p.parse().map_err(|_| invalid())?,
            (None, Some(tag)) => {
                let digits: String = tag.chars().skip_while(|c| !c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            }
            (None, None) => 0,
        };

        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for JujuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Snapshot of a relation as seen from this unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationInfo {
    pub id: u32,
    pub name: String,
    /// Remote application, once known
    pub app: Option<String>,
    /// Remote units that have joined
    pub units: Vec<String>,
    /// Whether the remote application databag holds anything
    pub has_app_data: bool,
}

impl RelationInfo {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.units.push(unit.into());
        self
    }

    pub fn with_app_data(mut self) -> Self {
        self.has_app_data = true;
        self
    }

    /// Established: remote units joined, app known, app data present
    pub fn is_established(&self) -> bool {
        !self.units.is_empty() && self.app.is_some() && self.has_app_data
    }
}

/// Identity of the unit and its view of the model
pub trait UnitContext: Send + Sync {
    fn app_name(&self) -> String;

    /// Unit name, e.g. `prometheus/0`
    fn unit_name(&self) -> String;

    /// Fully qualified domain name of the unit
    fn hostname(&self) -> String;

    fn juju_version(&self) -> JujuVersion;

    fn relation(&self, name: &str) -> Option<RelationInfo>;
}

/// This unit's databag on a relation
pub trait RelationStore: Send + Sync {
    fn unit_data_get(&self, relation: &str, key: &str) -> Result<Option<String>, HostError>;

    /// Set a key; `None` deletes it
    fn unit_data_set(&self, relation: &str, key: &str, value: Option<String>)
        -> Result<(), HostError>;
}

/// Application-owned secrets addressed by label
pub trait SecretStore: Send + Sync {
    /// Content of the latest revision; `SecretNotFound` when there is none
    fn get_secret_content(
        &self,
        label: &str,
        refresh: bool,
    ) -> Result<BTreeMap<String, String>, HostError>;

    fn add_secret(&self, label: &str, content: BTreeMap<String, String>) -> Result<(), HostError>;

    /// Publish a new revision
    fn set_secret_content(
        &self,
        label: &str,
        content: BTreeMap<String, String>,
    ) -> Result<(), HostError>;

    fn remove_all_revisions(&self, label: &str) -> Result<(), HostError>;
}

/// Everything the libraries need from the host
pub trait Model: UnitContext + RelationStore + SecretStore {}

impl<T: UnitContext + RelationStore + SecretStore> Model for T {}

/// Convert a unit name to the name of its pod (`app/0` -> `app-0`)
pub fn pod_name(unit_name: &str) -> String {
    unit_name.replace('/', "-")
}

/// Model kept in memory, for tests and local harnesses
#[derive(Debug)]
pub struct InMemoryModel {
    unit: String,
    hostname: String,
    juju_version: JujuVersion,
    state: RwLock<ModelState>,
}

#[derive(Debug, Default)]
struct ModelState {
    relations: BTreeMap<String, RelationInfo>,
    unit_data: BTreeMap<String, BTreeMap<String, String>>,
    secrets: BTreeMap<String, Vec<BTreeMap<String, String>>>,
}

impl InMemoryModel {
    pub fn new(unit: impl Into<String>) -> Self {
        let unit = unit.into();
        let hostname = format!("{}.local", pod_name(&unit));
        Self {
            unit,
            hostname,
            juju_version: JujuVersion::new(3, 1, 6),
            state: RwLock::new(ModelState::default()),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_juju_version(mut self, version: JujuVersion) -> Self {
        self.juju_version = version;
        self
    }

    /// Create or replace a relation; an existing databag is kept
    pub fn add_relation(&self, relation: RelationInfo) {
        let mut state = self.write();
        state.unit_data.entry(relation.name.clone()).or_default();
        state.relations.insert(relation.name.clone(), relation);
    }

    /// Remove a relation and its databag
    pub fn remove_relation(&self, name: &str) {
        let mut state = self.write();
        state.relations.remove(name);
        state.unit_data.remove(name);
    }

    /// Full unit databag of a relation
    pub fn unit_data(&self, relation: &str) -> BTreeMap<String, String> {
        self.read().unit_data.get(relation).cloned().unwrap_or_default()
    }

    pub fn secret_revisions(&self, label: &str) -> usize {
        self.read().secrets.get(label).map(Vec::len).unwrap_or(0)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ModelState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ModelState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl UnitContext for InMemoryModel {
    fn app_name(&self) -> String {
        self.unit
            .split_once('/')
            .map(|(app, _)| app.to_string())
            .unwrap_or_else(|| self.unit.clone())
    }

    fn unit_name(&self) -> String {
        self.unit.clone()
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn juju_version(&self) -> JujuVersion {
        self.juju_version
    }

    fn relation(&self, name: &str) -> Option<RelationInfo> {
        self.read().relations.get(name).cloned()
    }
}

impl RelationStore for InMemoryModel {
    fn unit_data_get(&self, relation: &str, key: &str) -> Result<Option<String>, HostError> {
        let state = self.read();
        if !state.relations.contains_key(relation) {
            return Err(HostError::RelationNotFound(relation.to_string()));
        }
        Ok(state
            .unit_data
            .get(relation)
            .and_then(|bag| bag.get(key))
            .cloned())
    }

    fn unit_data_set(
        &self,
        relation: &str,
        key: &str,
        value: Option<String>,
    ) -> Result<(), HostError> {
        let mut state = self.write();
        if !state.relations.contains_key(relation) {
            return Err(HostError::RelationNotFound(relation.to_string()));
        }
        let bag = state.unit_data.entry(relation.to_string()).or_default();
        match value {
            Some(value) => bag.insert(key.to_string(), value),
            None => bag.remove(key),
        };
        Ok(())
    }
}

impl SecretStore for InMemoryModel {
    fn get_secret_content(
        &self,
        label: &str,
        _refresh: bool,
    ) -> Result<BTreeMap<String, String>, HostError> {
        if !self.juju_version.has_secrets() {
            return Err(HostError::SecretsUnsupported(self.juju_version.to_string()));
        }
        self.read()
            .secrets
            .get(label)
            .and_then(|revisions| revisions.last())
            .cloned()
            .ok_or_else(|| HostError::SecretNotFound(label.to_string()))
    }

    fn add_secret(&self, label: &str, content: BTreeMap<String, String>) -> Result<(), HostError> {
        if !self.juju_version.has_secrets() {
            return Err(HostError::SecretsUnsupported(self.juju_version.to_string()));
        }
        if content.is_empty() {
            return Err(HostError::Other("secret content cannot be empty".to_string()));
        }
        let mut state = self.write();
        if state.secrets.contains_key(label) {
            return Err(HostError::Other(format!("secret label '{label}' already in use")));
        }
        state.secrets.insert(label.to_string(), vec![content]);
        Ok(())
    }

    fn set_secret_content(
        &self,
        label: &str,
        content: BTreeMap<String, String>,
    ) -> Result<(), HostError> {
        if content.is_empty() {
            return Err(HostError::Other("secret content cannot be empty".to_string()));
        }
        let mut state = self.write();
        let revisions = state
            .secrets
            .get_mut(label)
            .ok_or_else(|| HostError::SecretNotFound(label.to_string()))?;
        revisions.push(content);
        Ok(())
    }

    fn remove_all_revisions(&self, label: &str) -> Result<(), HostError> {
        self.write()
            .secrets
            .remove(label)
            .map(|_| ())
            .ok_or_else(|| HostError::SecretNotFound(label.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_juju_version_parsing() {
        assert_eq!("3.0.3".parse::<JujuVersion>().unwrap(), JujuVersion::new(3, 0, 3));
        assert_eq!("2.9.44.1".parse::<JujuVersion>().unwrap(), JujuVersion::new(2, 9, 44));
        assert_eq!("3.1-beta1".parse::<JujuVersion>().unwrap(), JujuVersion::new(3, 1, 1));
        assert_eq!("3.4".parse::<JujuVersion>().unwrap(), JujuVersion::new(3, 4, 0));
        assert!("three".parse::<JujuVersion>().is_err());
        assert!("3".parse::<JujuVersion>().is_err());
    }

    #[test]
    fn test_secrets_support_threshold() {
        assert!(!JujuVersion::new(2, 9, 44).has_secrets());
        assert!(!JujuVersion::new(3, 0, 2).has_secrets());
        assert!(JujuVersion::new(3, 0, 3).has_secrets());
        assert!(JujuVersion::new(3, 1, 0).has_secrets());
    }

    #[test]
    fn test_pod_name() {
        assert_eq!(pod_name("prometheus/0"), "prometheus-0");
        assert_eq!(pod_name("my-app/12"), "my-app-12");
    }

    #[test]
    fn test_relation_databag_requires_relation() {
        let model = InMemoryModel::new("app/0");
        assert!(matches!(
            model.unit_data_set("peers", "k", Some("v".into())),
            Err(HostError::RelationNotFound(_))
        ));

        model.add_relation(RelationInfo::new(1, "peers"));
        model.unit_data_set("peers", "k", Some("v".into())).unwrap();
        assert_eq!(model.unit_data_get("peers", "k").unwrap(), Some("v".into()));
        model.unit_data_set("peers", "k", None).unwrap();
        assert_eq!(model.unit_data_get("peers", "k").unwrap(), None);
    }

    #[test]
    fn test_secret_revisions() {
        let model = InMemoryModel::new("app/0");
        let content = |v: &str| BTreeMap::from([("k".to_string(), v.to_string())]);

        assert!(matches!(
            model.get_secret_content("label", false),
            Err(HostError::SecretNotFound(_))
        ));
        model.add_secret("label", content("1")).unwrap();
        model.set_secret_content("label", content("2")).unwrap();
        assert_eq!(model.secret_revisions("label"), 2);
        assert_eq!(model.get_secret_content("label", true).unwrap(), content("2"));
        model.remove_all_revisions("label").unwrap();
        assert_eq!(model.secret_revisions("label"), 0);
    }

    #[test]
    fn test_empty_secret_content_is_rejected() {
        let model = InMemoryModel::new("app/0");
        assert!(model.add_secret("label", BTreeMap::new()).is_err());
        model
            .add_secret("label", BTreeMap::from([("k".to_string(), "v".to_string())]))
            .unwrap();
        assert!(model.set_secret_content("label", BTreeMap::new()).is_err());
        assert_eq!(model.secret_revisions("label"), 1);
    }

    #[test]
    fn test_old_juju_has_no_secrets() {
        let model = InMemoryModel::new("app/0").with_juju_version(JujuVersion::new(2, 9, 44));
        assert!(matches!(
            model.add_secret("label", BTreeMap::new()),
            Err(HostError::SecretsUnsupported(_))
        ));
    }

    #[test]
    fn test_relation_establishment() {
        let rel = RelationInfo::new(3, "certificates");
        assert!(!rel.is_established());
        let rel = rel.with_app("ca").with_unit("ca/0");
        assert!(!rel.is_established());
        assert!(rel.with_app_data().is_established());
    }
}
