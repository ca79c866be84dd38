//! Status persistence and derived deployment conditions
//!
//! The controller owns `status` exclusively. Every change goes through
//! [`StatusManager::update`], which writes the whole status subresource
//! when it differs from what was last read or written.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::controller::error::{Result, ResultExt};
use crate::crd::{ArangoDeploymentStatus, ConditionType};
use crate::kube_client::KubeClient;

/// Reasons recorded on deployment level conditions
pub mod reasons {
    pub const SPEC_ACCEPTED: &str = "Spec Accepted";
    pub const SPEC_NOT_ACCEPTED: &str = "Spec Not Accepted";
    pub const UP_TO_DATE: &str = "Up To Date";
    pub const PLAN_PENDING: &str = "Plan Pending";
    pub const SPEC_NOT_APPLIED: &str = "Spec Not Applied";
    pub const NOT_REACHABLE: &str = "Not Reachable";
    pub const RESTART_PENDING: &str = "Restart Pending";
    pub const REACHABLE: &str = "Reachable";
    pub const SECRETS_CHANGED: &str = "Secrets Changed";
    pub const SECRETS_UNCHANGED: &str = "Secrets Unchanged";
}

/// Writes the status subresource of one deployment
pub struct StatusManager<'a> {
    client: &'a dyn KubeClient,
    namespace: &'a str,
    name: &'a str,
    /// Status as last read or written
    stored: Mutex<Option<ArangoDeploymentStatus>>,
}

impl<'a> StatusManager<'a> {
    pub fn new(client: &'a dyn KubeClient, namespace: &'a str, name: &'a str) -> Self {
        Self {
            client,
            namespace,
            name,
            stored: Mutex::new(None),
        }
    }

    /// Start from the status the deployment was read with
    pub fn with_stored(self, status: Option<ArangoDeploymentStatus>) -> Self {
        *self.lock() = status;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<ArangoDeploymentStatus>> {
        self.stored.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist the full status unless it equals the stored one. Returns true
    /// if a patch was sent.
    pub async fn update(&self, status: &ArangoDeploymentStatus) -> Result<bool> {
        let unchanged = self.lock().as_ref() == Some(status);
        if unchanged {
            debug!(name = self.name, "Status unchanged, skipping update");
            return Ok(false);
        }

        debug!(
            name = self.name,
            plan = status.plan.len(),
            "Updating deployment status"
        );
        self.client
            .patch_deployment_status(self.namespace, self.name, status)
            .await
            .context(format!("Updating status of {}/{}", self.namespace, self.name))?;
        *self.lock() = Some(status.clone());
        Ok(true)
    }
}

/// Desired value of a derived condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedCondition {
    pub status: bool,
    pub reason: &'static str,
    pub message: String,
}

/// `SpecAccepted` holds iff the current checksum is the accepted version
pub fn spec_accepted(status: &ArangoDeploymentStatus, checksum: &str) -> DerivedCondition {
    if status.accepted_spec_version.as_deref() == Some(checksum) {
        DerivedCondition {
            status: true,
            reason: reasons::SPEC_ACCEPTED,
            message: String::new(),
        }
    } else {
        DerivedCondition {
            status: false,
            reason: reasons::SPEC_NOT_ACCEPTED,
            message: "spec changed since it was last accepted".to_string(),
        }
    }
}

/// `UpToDate` requires an empty plan, the accepted spec fully applied, the
/// spec accepted, the deployment reachable and no member waiting for a
/// restart or volume resize.
pub fn up_to_date(status: &ArangoDeploymentStatus) -> DerivedCondition {
    let not = |reason, message: String| DerivedCondition {
        status: false,
        reason,
        message,
    };

    if !status.plan.is_empty() {
        return not(
            reasons::PLAN_PENDING,
            format!("{} action(s) pending", status.plan.len()),
        );
    }
    if status.accepted_spec_version.is_none() || status.applied_version != status.accepted_spec_version {
        return not(
            reasons::SPEC_NOT_APPLIED,
            "accepted spec not yet applied".to_string(),
        );
    }
    if !status.conditions.is_true(ConditionType::SpecAccepted) {
        return not(reasons::SPEC_NOT_ACCEPTED, String::new());
    }
    if !status.conditions.is_true(ConditionType::Reachable) {
        return not(reasons::NOT_REACHABLE, String::new());
    }
    let pending: Vec<&str> = status
        .members
        .iter()
        .filter(|(_, m)| {
            m.conditions.is_true(ConditionType::Restart)
                || m.conditions.is_true(ConditionType::PendingRestart)
                || m.conditions.is_true(ConditionType::PvcResizePending)
        })
        .map(|(_, m)| m.id.as_str())
        .collect();
    if !pending.is_empty() {
        return not(reasons::RESTART_PENDING, pending.join(", "));
    }

    DerivedCondition {
        status: true,
        reason: reasons::UP_TO_DATE,
        message: String::new(),
    }
}
