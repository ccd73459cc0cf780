//! Condition ledger: a chronological, append-only trail of status entries.
//!
//! Entries are never deduplicated, trimmed or rewritten. The list is an audit log, so
//! "the current state of type T" is whatever the last entry of that type says (see [`latest`]).

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use serde::{Deserialize, Serialize};

/// Tri-state condition status, serialized the way Kubernetes spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "True" => Ok(ConditionStatus::True),
            "False" => Ok(ConditionStatus::False),
            "Unknown" => Ok(ConditionStatus::Unknown),
            other => Err(format!("invalid condition status: {other}")),
        }
    }
}

/// Entry types the synchronizer writes onto a Source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Heartbeat written at the start of every reconciliation.
    Reconciling,
    CreatedTarget,
    UpdatedTarget,
    /// Only written when failure recording is switched on.
    SyncFailed,
}

impl ConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConditionType::Reconciling => "Reconciling",
            ConditionType::CreatedTarget => "CreatedTarget",
            ConditionType::UpdatedTarget => "UpdatedTarget",
            ConditionType::SyncFailed => "SyncFailed",
        }
    }

    pub const fn status(self) -> ConditionStatus {
        match self {
            ConditionType::SyncFailed => ConditionStatus::False,
            _ => ConditionStatus::True,
        }
    }

    pub const fn reason(self) -> &'static str {
        match self {
            ConditionType::Reconciling => "ReconcilingSource",
            ConditionType::CreatedTarget => "TargetCreated",
            ConditionType::UpdatedTarget => "TargetUpdated",
            ConditionType::SyncFailed => "SyncFailed",
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            ConditionType::Reconciling => "Reconciling Source resource",
            ConditionType::CreatedTarget => "Target resource has been created in target cluster",
            ConditionType::UpdatedTarget => "Target resource has been updated in target cluster",
            ConditionType::SyncFailed => "Synchronizing Target failed",
        }
    }

    /// Canonical entry for this type.
    pub fn entry(self) -> Entry<'static> {
        Entry::new(self.as_str(), self.status(), self.reason(), self.message())
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry to append; the timestamp is assigned by [`append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<'a> {
    pub type_: Cow<'a, str>,
    pub status: ConditionStatus,
    pub reason: Cow<'a, str>,
    pub message: Cow<'a, str>,
    pub observed_generation: Option<i64>,
}

impl<'a> Entry<'a> {
    pub fn new(
        type_: impl Into<Cow<'a, str>>,
        status: ConditionStatus,
        reason: impl Into<Cow<'a, str>>,
        message: impl Into<Cow<'a, str>>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<Cow<'a, str>>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<Cow<'a, str>>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Append `entry` stamped with `now`. Prior entries are left untouched.
pub fn append(mut conditions: Vec<Condition>, entry: Entry<'_>, now: DateTime<Utc>) -> Vec<Condition> {
    conditions.push(Condition {
        type_: entry.type_.into_owned(),
        status: entry.status.as_str().to_string(),
        reason: entry.reason.into_owned(),
        message: entry.message.into_owned(),
        observed_generation: entry.observed_generation,
        last_transition_time: Time(now),
    });
    conditions
}

/// Most recent entry of `type_`, scanning from the tail.
pub fn latest<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().rev().find(|c| c.type_ == type_)
}

/// Number of entries of `type_` in the trail.
pub fn count(conditions: &[Condition], type_: &str) -> usize {
    conditions.iter().filter(|c| c.type_ == type_).count()
}

/// Condition types in order, handy for assertions and for printing a trail.
pub fn types(conditions: &[Condition]) -> Vec<&str> {
    conditions.iter().map(|c| c.type_.as_str()).collect()
}
