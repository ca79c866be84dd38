//! Persisted plan actions
//!
//! Actions are plain data stored in `status.plan`. They survive controller
//! restarts, so the serialized shape must stay backward compatible: the type is
//! kept as a string and only resolved to an [`ActionType`] when the action is
//! about to run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::member::ServerGroup;

/// Returned when a persisted action names a type this controller does not know
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown action type: {0}")]
pub struct UnknownActionType(pub String);

/// Every action type the executor can run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionType {
    Idle,
    AddMember,
    RemoveMember,
    MarkToRemoveMember,
    CleanOutMember,
    ShutdownMember,
    ResignLeadership,
    WaitForMemberUp,
    RotateMember,
    RecreateMember,
    UpgradeMember,
    KillMemberPod,
    RuntimeContainerImageUpdate,
    PvcResize,
    SetMemberCondition,
    MemberPhaseUpdate,
    SetCondition,
    SetCurrentImage,
    BootstrapUpdate,
    EnableMaintenance,
    DisableMaintenance,
    SetMaintenanceCondition,
    EnableClusterScaling,
    DisableClusterScaling,
    BackupRestore,
    BackupRestoreClean,
    TopologyDisable,
}

impl ActionType {
    pub const ALL: [ActionType; 27] = [
        ActionType::Idle,
        ActionType::AddMember,
        ActionType::RemoveMember,
        ActionType::MarkToRemoveMember,
        ActionType::CleanOutMember,
        ActionType::ShutdownMember,
        ActionType::ResignLeadership,
        ActionType::WaitForMemberUp,
        ActionType::RotateMember,
        ActionType::RecreateMember,
        ActionType::UpgradeMember,
        ActionType::KillMemberPod,
        ActionType::RuntimeContainerImageUpdate,
        ActionType::PvcResize,
        ActionType::SetMemberCondition,
        ActionType::MemberPhaseUpdate,
        ActionType::SetCondition,
        ActionType::SetCurrentImage,
        ActionType::BootstrapUpdate,
        ActionType::EnableMaintenance,
        ActionType::DisableMaintenance,
        ActionType::SetMaintenanceCondition,
        ActionType::EnableClusterScaling,
        ActionType::DisableClusterScaling,
        ActionType::BackupRestore,
        ActionType::BackupRestoreClean,
        ActionType::TopologyDisable,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ActionType::Idle => "Idle",
            ActionType::AddMember => "AddMember",
            ActionType::RemoveMember => "RemoveMember",
            ActionType::MarkToRemoveMember => "MarkToRemoveMember",
            ActionType::CleanOutMember => "CleanOutMember",
            ActionType::ShutdownMember => "ShutdownMember",
            ActionType::ResignLeadership => "ResignLeadership",
            ActionType::WaitForMemberUp => "WaitForMemberUp",
            ActionType::RotateMember => "RotateMember",
            ActionType::RecreateMember => "RecreateMember",
            ActionType::UpgradeMember => "UpgradeMember",
            ActionType::KillMemberPod => "KillMemberPod",
            ActionType::RuntimeContainerImageUpdate => "RuntimeContainerImageUpdate",
            ActionType::PvcResize => "PVCResize",
            ActionType::SetMemberCondition => "SetMemberCondition",
            ActionType::MemberPhaseUpdate => "MemberPhaseUpdate",
            ActionType::SetCondition => "SetCondition",
            ActionType::SetCurrentImage => "SetCurrentImage",
            ActionType::BootstrapUpdate => "BootstrapUpdate",
            ActionType::EnableMaintenance => "EnableMaintenance",
            ActionType::DisableMaintenance => "DisableMaintenance",
            ActionType::SetMaintenanceCondition => "SetMaintenanceCondition",
            ActionType::EnableClusterScaling => "EnableClusterScaling",
            ActionType::DisableClusterScaling => "DisableClusterScaling",
            ActionType::BackupRestore => "BackupRestore",
            ActionType::BackupRestoreClean => "BackupRestoreClean",
            ActionType::TopologyDisable => "TopologyDisable",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = UnknownActionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownActionType(s.to_string()))
    }
}

/// A single planned operation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,

    #[serde(rename = "type")]
    pub type_: String,

    #[serde(rename = "memberID", default, skip_serializing_if = "String::is_empty")]
    pub member_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<ServerGroup>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,

    /// Set once Start returned not-ready; the timeout window counts from here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Action {
    pub fn new(type_: ActionType, group: Option<ServerGroup>, member_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            type_: type_.as_str().to_string(),
            member_id: member_id.to_string(),
            group,
            params: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            reason: None,
        }
    }

    /// Action on a single member
    pub fn for_member(type_: ActionType, group: ServerGroup, member_id: &str) -> Self {
        Self::new(type_, Some(group), member_id)
    }

    /// Action on the deployment as a whole
    pub fn for_deployment(type_: ActionType) -> Self {
        Self::new(type_, None, "")
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn action_type(&self) -> Result<ActionType, UnknownActionType> {
        self.type_.parse()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }
}

/// Ordered list of pending actions
pub type Plan = Vec<Action>;
