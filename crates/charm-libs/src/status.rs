//! Unit status reporting
//!
//! Components report how their managed resource is doing; the charm picks
//! the most severe one and sets it on the unit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Workload status of a unit, ordered from least to most severe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    /// Everything is in place
    Active,
    /// Work is in progress and no operator action is needed
    Maintenance(String),
    /// Waiting on something outside of this unit
    Waiting(String),
    /// Operator intervention is required
    Blocked(String),
}

impl UnitStatus {
    pub fn active() -> Self {
        UnitStatus::Active
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        UnitStatus::Maintenance(message.into())
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        UnitStatus::Waiting(message.into())
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        UnitStatus::Blocked(message.into())
    }

    pub fn name(&self) -> &'static str {
        match self {
            UnitStatus::Active => "active",
            UnitStatus::Maintenance(_) => "maintenance",
            UnitStatus::Waiting(_) => "waiting",
            UnitStatus::Blocked(_) => "blocked",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            UnitStatus::Active => "",
            UnitStatus::Maintenance(m) | UnitStatus::Waiting(m) | UnitStatus::Blocked(m) => m,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, UnitStatus::Active)
    }

    fn severity(&self) -> u8 {
        match self {
            UnitStatus::Active => 0,
            UnitStatus::Maintenance(_) => 1,
            UnitStatus::Waiting(_) => 2,
            UnitStatus::Blocked(_) => 3,
        }
    }

    /// Collapse several component statuses into the most severe one
    pub fn most_severe<I>(statuses: I) -> UnitStatus
    where
        I: IntoIterator<Item = UnitStatus>,
    {
        statuses
            .into_iter()
            .fold(UnitStatus::Active, |worst, s| {
                if s.severity() > worst.severity() {
                    s
                } else {
                    worst
                }
            })
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Active => write!(f, "active"),
            other => write!(f, "{}: {}", other.name(), other.message()),
        }
    }
}
