//! Conditions attached to deployment and member status.
//!
//! A condition is a named boolean flag with a reason, a message and an
//! optional hash. The hash records which spec checksum the condition was
//! computed against, so a later tick can tell whether the spec moved on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Known condition types
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
pub enum ConditionType {
    /// Member pod is ready
    Ready,
    /// Current spec checksum matches the accepted spec version
    SpecAccepted,
    /// Deployment has converged to the accepted spec
    UpToDate,
    /// Deployment answers requests with a healthy quorum
    Reachable,
    /// Agency supervision is in maintenance mode
    Maintenance,
    /// Secrets referenced by the deployment changed since they were recorded
    SecretsChanged,
    BootstrapCompleted,
    BootstrapSucceeded,
    /// Members are spread over topology zones
    TopologyAware,
    /// Member must be restarted at the next opportunity
    PendingRestart,
    /// Member restart was requested
    Restart,
    /// Member volume is being resized
    #[serde(rename = "PVCResizePending")]
    PvcResizePending,
    /// Member is scheduled for removal
    MarkedToRemove,
    /// Member pod terminated
    Terminated,
    /// Written by another controller version, kept as is
    #[serde(other)]
    Unknown,
}

impl ConditionType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::SpecAccepted => "SpecAccepted",
            ConditionType::UpToDate => "UpToDate",
            ConditionType::Reachable => "Reachable",
            ConditionType::Maintenance => "Maintenance",
            ConditionType::SecretsChanged => "SecretsChanged",
            ConditionType::BootstrapCompleted => "BootstrapCompleted",
            ConditionType::BootstrapSucceeded => "BootstrapSucceeded",
            ConditionType::TopologyAware => "TopologyAware",
            ConditionType::PendingRestart => "PendingRestart",
            ConditionType::Restart => "Restart",
            ConditionType::PvcResizePending => "PVCResizePending",
            ConditionType::MarkedToRemove => "MarkedToRemove",
            ConditionType::Terminated => "Terminated",
            ConditionType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ready" => Ok(ConditionType::Ready),
            "SpecAccepted" => Ok(ConditionType::SpecAccepted),
            "UpToDate" => Ok(ConditionType::UpToDate),
            "Reachable" => Ok(ConditionType::Reachable),
            "Maintenance" => Ok(ConditionType::Maintenance),
            "SecretsChanged" => Ok(ConditionType::SecretsChanged),
            "BootstrapCompleted" => Ok(ConditionType::BootstrapCompleted),
            "BootstrapSucceeded" => Ok(ConditionType::BootstrapSucceeded),
            "TopologyAware" => Ok(ConditionType::TopologyAware),
            "PendingRestart" => Ok(ConditionType::PendingRestart),
            "Restart" => Ok(ConditionType::Restart),
            "PVCResizePending" => Ok(ConditionType::PvcResizePending),
            "MarkedToRemove" => Ok(ConditionType::MarkedToRemove),
            "Terminated" => Ok(ConditionType::Terminated),
            other => Err(format!("unknown condition type: {other}")),
        }
    }
}

/// A single status condition
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// "True" or "False"
    pub status: String,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// Spec checksum this condition was computed against
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,

    pub last_update_time: DateTime<Utc>,

    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == condition_status::TRUE
    }
}

fn status_str(status: bool) -> &'static str {
    if status {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Ordered list of conditions, at most one per type
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(transparent)]
pub struct ConditionList(pub Vec<Condition>);

impl ConditionList {
    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Set a condition without a hash. Returns true if anything changed.
    pub fn update(
        &mut self,
        type_: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.update_with_hash(type_, status, reason, message, "", now)
    }

    /// Set a condition at `now`. The transition time moves only when the
    /// status flips; the update time moves on every effective change.
    pub fn update_with_hash(
        &mut self,
        type_: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        hash: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let status = status_str(status);

        if let Some(existing) = self.0.iter_mut().find(|c| c.type_ == type_) {
            if existing.status == status
                && existing.reason == reason
                && existing.message == message
                && existing.hash == hash
            {
                return false;
            }
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.hash = hash.to_string();
            existing.last_update_time = now;
            return true;
        }

        self.0.push(Condition {
            type_,
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            hash: hash.to_string(),
            last_update_time: now,
            last_transition_time: now,
        });
        true
    }

    /// Remove a condition. Returns true if it was present.
    pub fn remove(&mut self, type_: ConditionType) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.type_ != type_);
        self.0.len() != before
    }
}
