//! Built in action implementations

mod deployment;
mod drain;
mod maintenance;
mod member;
mod pvc;
mod rotate;

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

pub use deployment::{
    BackupRestore, BackupRestoreClean, BootstrapUpdate, Idle, RESTORE_PATH, SetCondition,
    TopologyDisable,
};
pub use drain::{CleanOutMember, ResignLeadership, ShutdownMember};
pub use maintenance::{
    DisableClusterScaling, DisableMaintenance, EnableClusterScaling, EnableMaintenance,
    MAINTENANCE_PATH, SetMaintenanceCondition,
};
pub use member::{
    AddMember, KillMemberPod, MarkToRemoveMember, MemberPhaseUpdate, RecreateMember, RemoveMember,
    SetMemberCondition, WaitForMemberUp,
};
pub use pvc::PvcResize;
pub use rotate::{RotateMember, RuntimeContainerImageUpdate, SetCurrentImage, UpgradeMember};

use super::registry::ActionRegistry;
use crate::controller::error::{Error, Result};
use crate::crd::{Action, ActionType};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Register every built in action type. Types without a timeout of their
/// own get `default_timeout`.
pub fn register_all(registry: &mut ActionRegistry, default_timeout: Duration) -> Result<()> {
    let secs = Duration::from_secs;

    registry.register(ActionType::Idle, default_timeout, |a| Box::new(Idle(a)))?;
    registry.register(ActionType::AddMember, secs(10 * MINUTE), |a| Box::new(AddMember(a)))?;
    registry.register(ActionType::RemoveMember, secs(15 * MINUTE), |a| {
        Box::new(RemoveMember(a))
    })?;
    registry.register(ActionType::MarkToRemoveMember, default_timeout, |a| {
        Box::new(MarkToRemoveMember(a))
    })?;
    registry.register(ActionType::CleanOutMember, secs(48 * HOUR), |a| {
        Box::new(CleanOutMember(a))
    })?;
    registry.register(ActionType::ShutdownMember, secs(30 * MINUTE), |a| {
        Box::new(ShutdownMember(a))
    })?;
    registry.register(ActionType::ResignLeadership, secs(30 * MINUTE), |a| {
        Box::new(ResignLeadership(a))
    })?;
    registry.register(ActionType::WaitForMemberUp, secs(30 * MINUTE), |a| {
        Box::new(WaitForMemberUp(a))
    })?;
    registry.register(ActionType::RotateMember, secs(15 * MINUTE), |a| {
        Box::new(RotateMember(a))
    })?;
    registry.register(ActionType::RecreateMember, secs(15 * MINUTE), |a| {
        Box::new(RecreateMember(a))
    })?;
    registry.register(ActionType::UpgradeMember, secs(6 * HOUR), |a| {
        Box::new(UpgradeMember(a))
    })?;
    registry.register(ActionType::KillMemberPod, default_timeout, |a| {
        Box::new(KillMemberPod(a))
    })?;
    registry.register(ActionType::RuntimeContainerImageUpdate, secs(10 * MINUTE), |a| {
        Box::new(RuntimeContainerImageUpdate(a))
    })?;
    registry.register(ActionType::PvcResize, secs(30 * MINUTE), |a| Box::new(PvcResize(a)))?;
    registry.register(ActionType::SetMemberCondition, default_timeout, |a| {
        Box::new(SetMemberCondition(a))
    })?;
    registry.register(ActionType::MemberPhaseUpdate, default_timeout, |a| {
        Box::new(MemberPhaseUpdate(a))
    })?;
    registry.register(ActionType::SetCondition, default_timeout, |a| {
        Box::new(SetCondition(a))
    })?;
    registry.register(ActionType::SetCurrentImage, secs(6 * HOUR), |a| {
        Box::new(SetCurrentImage(a))
    })?;
    registry.register(ActionType::BootstrapUpdate, default_timeout, |a| {
        Box::new(BootstrapUpdate(a))
    })?;
    registry.register(ActionType::EnableMaintenance, secs(MINUTE), |a| {
        Box::new(EnableMaintenance(a))
    })?;
    registry.register(ActionType::DisableMaintenance, secs(MINUTE), |a| {
        Box::new(DisableMaintenance(a))
    })?;
    registry.register(ActionType::SetMaintenanceCondition, default_timeout, |a| {
        Box::new(SetMaintenanceCondition(a))
    })?;
    registry.register(ActionType::EnableClusterScaling, default_timeout, |a| {
        Box::new(EnableClusterScaling(a))
    })?;
    registry.register(ActionType::DisableClusterScaling, default_timeout, |a| {
        Box::new(DisableClusterScaling(a))
    })?;
    registry.register(ActionType::BackupRestore, secs(15 * MINUTE), |a| {
        Box::new(BackupRestore(a))
    })?;
    registry.register(ActionType::BackupRestoreClean, default_timeout, |a| {
        Box::new(BackupRestoreClean(a))
    })?;
    registry.register(ActionType::TopologyDisable, default_timeout, |a| {
        Box::new(TopologyDisable(a))
    })?;
    Ok(())
}

/// A parameter the action cannot run without
pub(crate) fn required_param<'a>(action: &'a Action, key: &str) -> Result<&'a str> {
    action.param(key).ok_or_else(|| {
        Error::ActionFailed(format!(
            "{} action {} is missing parameter {key}",
            action.type_, action.id
        ))
    })
}

pub(crate) fn parse_param<T>(action: &Action, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    required_param(action, key)?
        .parse()
        .map_err(|e: T::Err| Error::ActionFailed(format!("{} action {}: {e}", action.type_, action.id)))
}
