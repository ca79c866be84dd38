//! Actions acting on the deployment as a whole

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{parse_param, required_param};
use crate::client::post_json;
use crate::controller::error::Result;
use crate::crd::{Action, ConditionType, RestoreState, RestoreStatus, ServerGroup};
use crate::reconcile::action::{ActionContext, ActionImpl};

pub const RESTORE_PATH: &str = "/_admin/backup/restore";

/// Does nothing. Used to force a plan round trip.
pub struct Idle(pub Action);

#[async_trait]
impl ActionImpl for Idle {
    async fn start(&self, _ctx: &mut ActionContext<'_>) -> Result<bool> {
        Ok(true)
    }
}

/// Params: `condition`, `status`, `reason`, `message`. Without `status`
/// the condition is removed.
pub struct SetCondition(pub Action);

#[async_trait]
impl ActionImpl for SetCondition {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let condition: ConditionType = parse_param(&self.0, "condition")?;
        let now = ctx.now();
        match self.0.param("status") {
            Some(status) => {
                ctx.status.conditions.update(
                    condition,
                    status == "True",
                    self.0.param("reason").unwrap_or_default(),
                    self.0.param("message").unwrap_or_default(),
                    now,
                );
            }
            None => {
                ctx.status.conditions.remove(condition);
            }
        }
        Ok(true)
    }
}

/// Mark the initial bootstrap of the deployment as done
pub struct BootstrapUpdate(pub Action);

#[async_trait]
impl ActionImpl for BootstrapUpdate {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        info!(deployment = ctx.name, "Bootstrap completed");
        let now = ctx.now();
        ctx.status
            .conditions
            .update(ConditionType::BootstrapCompleted, true, "Bootstrap Completed", "", now);
        ctx.status
            .conditions
            .update(ConditionType::BootstrapSucceeded, true, "Bootstrap Succeeded", "", now);
        Ok(true)
    }
}

/// Restore a backup into the running deployment. Params: `backup`
pub struct BackupRestore(pub Action);

#[async_trait]
impl ActionImpl for BackupRestore {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let backup = required_param(&self.0, "backup")?.to_string();
        if ctx
            .status
            .restore
            .as_ref()
            .is_some_and(|r| r.backup == backup)
        {
            return Ok(true);
        }

        let connection = ctx.admin_connection()?;
        let restore = match post_json::<Value>(connection.as_ref(), RESTORE_PATH, json!({ "id": backup }))
            .await
        {
            Ok(_) => {
                info!(backup = %backup, "Backup restored");
                RestoreStatus {
                    backup,
                    state: RestoreState::Restored,
                    message: None,
                }
            }
            Err(e) if e.is_transient() => {
                // retried by the executor, nothing is recorded
                warn!(backup = %backup, error = %e, "Backup restore interrupted");
                return Err(e.into());
            }
            Err(e) => {
                warn!(backup = %backup, error = %e, "Backup restore failed");
                RestoreStatus {
                    backup,
                    state: RestoreState::Failed,
                    message: Some(e.to_string()),
                }
            }
        };
        ctx.status.restore = Some(restore);
        Ok(true)
    }
}

/// Forget the restore result once `restoreFrom` is cleared
pub struct BackupRestoreClean(pub Action);

#[async_trait]
impl ActionImpl for BackupRestoreClean {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        ctx.status.restore = None;
        Ok(true)
    }
}

/// Drop zone bookkeeping after topology awareness was switched off
pub struct TopologyDisable(pub Action);

#[async_trait]
impl ActionImpl for TopologyDisable {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        if ctx.status.topology.take().is_some() {
            info!(deployment = ctx.name, "Topology awareness disabled");
        }
        ctx.status.conditions.remove(ConditionType::TopologyAware);
        for group in ServerGroup::ALL {
            for member in ctx.status.members.group_mut(group).iter_mut() {
                member.zone = None;
            }
        }
        Ok(true)
    }
}
