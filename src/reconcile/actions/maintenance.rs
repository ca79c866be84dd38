//! Cluster maintenance mode and scaling switches

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::client::{Request, send_json};
use crate::controller::error::Result;
use crate::crd::{Action, ConditionType, DeploymentMode};
use crate::reconcile::action::{ActionContext, ActionImpl, Progress};

pub const MAINTENANCE_PATH: &str = "/_admin/cluster/maintenance";

async fn set_maintenance(ctx: &ActionContext<'_>, enabled: bool) -> Result<()> {
    let connection = ctx.admin_connection()?;
    let mode = if enabled { "on" } else { "off" };
    info!(mode, "Switching cluster maintenance mode");
    send_json::<Value>(connection.as_ref(), Request::put(MAINTENANCE_PATH, json!(mode))).await?;
    Ok(())
}

/// Maintenance mode as last seen in the agency, `None` without valid data
fn agency_maintenance(ctx: &ActionContext<'_>) -> Option<bool> {
    ctx.agency_state().map(|state| state.maintenance_enabled())
}

pub struct EnableMaintenance(pub Action);

#[async_trait]
impl ActionImpl for EnableMaintenance {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        if ctx.mode() == DeploymentMode::Single || agency_maintenance(ctx) == Some(true) {
            return Ok(true);
        }
        set_maintenance(ctx, true).await?;
        Ok(false)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        Ok((agency_maintenance(ctx) == Some(true)).into())
    }
}

pub struct DisableMaintenance(pub Action);

#[async_trait]
impl ActionImpl for DisableMaintenance {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        if ctx.mode() == DeploymentMode::Single || agency_maintenance(ctx) == Some(false) {
            return Ok(true);
        }
        set_maintenance(ctx, false).await?;
        Ok(false)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        Ok((agency_maintenance(ctx) == Some(false)).into())
    }
}

/// Mirror the agency's maintenance flag into the `Maintenance` condition
pub struct SetMaintenanceCondition(pub Action);

#[async_trait]
impl ActionImpl for SetMaintenanceCondition {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let Some(enabled) = agency_maintenance(ctx) else {
            return Ok(true);
        };
        let now = ctx.now();
        if enabled {
            ctx.status
                .conditions
                .update(ConditionType::Maintenance, true, "Maintenance Enabled", "", now);
        } else {
            ctx.status.conditions.remove(ConditionType::Maintenance);
        }
        Ok(true)
    }
}

/// Resume scale up and scale down planning
pub struct EnableClusterScaling(pub Action);

#[async_trait]
impl ActionImpl for EnableClusterScaling {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        if std::mem::replace(&mut ctx.status.scaling_disabled, false) {
            info!(deployment = ctx.name, "Cluster scaling enabled");
        }
        Ok(true)
    }
}

/// Pause scale up and scale down planning. Members already marked for
/// removal are still removed.
pub struct DisableClusterScaling(pub Action);

#[async_trait]
impl ActionImpl for DisableClusterScaling {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        if !std::mem::replace(&mut ctx.status.scaling_disabled, true) {
            info!(deployment = ctx.name, "Cluster scaling disabled");
        }
        Ok(true)
    }
}
