//! Server groups and per-member status

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{ConditionList, ConditionType};

/// Role a member plays in the deployment
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServerGroup {
    Single,
    Agents,
    #[serde(rename = "dbservers")]
    DBServers,
    Coordinators,
}

impl ServerGroup {
    /// All groups in the order members are created and upgraded
    pub const ALL: [ServerGroup; 4] = [
        ServerGroup::Single,
        ServerGroup::Agents,
        ServerGroup::DBServers,
        ServerGroup::Coordinators,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ServerGroup::Single => "single",
            ServerGroup::Agents => "agents",
            ServerGroup::DBServers => "dbservers",
            ServerGroup::Coordinators => "coordinators",
        }
    }

    /// Role name used in pod names and labels
    pub const fn as_role(&self) -> &'static str {
        match self {
            ServerGroup::Single => "single",
            ServerGroup::Agents => "agent",
            ServerGroup::DBServers => "dbserver",
            ServerGroup::Coordinators => "coordinator",
        }
    }

    /// Short prefix used for generated member IDs
    pub const fn as_role_abbreviated(&self) -> &'static str {
        match self {
            ServerGroup::Single => "sngl",
            ServerGroup::Agents => "agnt",
            ServerGroup::DBServers => "prmr",
            ServerGroup::Coordinators => "crdn",
        }
    }

    /// Fresh member ID such as `PRMR-k3x9q2ab`
    pub fn new_member_id(&self) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        format!("{}-{suffix}", self.as_role_abbreviated().to_uppercase())
    }
}

impl fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ServerGroup::Single),
            "agents" => Ok(ServerGroup::Agents),
            "dbservers" => Ok(ServerGroup::DBServers),
            "coordinators" => Ok(ServerGroup::Coordinators),
            other => Err(format!("unknown server group: {other}")),
        }
    }
}

/// Lifecycle phase of a single member
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum MemberPhase {
    /// Member is known but no pod was requested yet
    #[default]
    None,
    /// Pod must be (re)created
    Pending,
    /// Pod exists and is starting
    Creating,
    /// Member is being replaced with a new image
    Upgrading,
    Ready,
    Failed,
    /// Member is being drained before removal
    Drain,
}

impl MemberPhase {
    /// Whether the member should currently own a pod
    pub fn expects_pod(&self) -> bool {
        matches!(
            self,
            MemberPhase::Creating | MemberPhase::Ready | MemberPhase::Upgrading | MemberPhase::Drain
        )
    }
}

impl fmt::Display for MemberPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberPhase::None => "None",
            MemberPhase::Pending => "Pending",
            MemberPhase::Creating => "Creating",
            MemberPhase::Upgrading => "Upgrading",
            MemberPhase::Ready => "Ready",
            MemberPhase::Failed => "Failed",
            MemberPhase::Drain => "Drain",
        };
        f.write_str(s)
    }
}

impl FromStr for MemberPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(MemberPhase::None),
            "Pending" => Ok(MemberPhase::Pending),
            "Creating" => Ok(MemberPhase::Creating),
            "Upgrading" => Ok(MemberPhase::Upgrading),
            "Ready" => Ok(MemberPhase::Ready),
            "Failed" => Ok(MemberPhase::Failed),
            "Drain" => Ok(MemberPhase::Drain),
            other => Err(format!("unknown member phase: {other}")),
        }
    }
}

/// Persisted status of one member
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub id: String,

    #[serde(default)]
    pub phase: MemberPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name: Option<String>,

    /// Image the member pod runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "ConditionList::is_empty")]
    pub conditions: ConditionList,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Agency job currently driving this member (clean out, resign)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Topology zone the member is pinned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<i32>,
}

impl MemberStatus {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at: Some(created_at),
            ..Default::default()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == MemberPhase::Ready && self.conditions.is_true(ConditionType::Ready)
    }

    pub fn is_marked_to_remove(&self) -> bool {
        self.conditions.is_true(ConditionType::MarkedToRemove)
    }
}

/// Members of a deployment, grouped by role
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMembers {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub single: Vec<MemberStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<MemberStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dbservers: Vec<MemberStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coordinators: Vec<MemberStatus>,
}

impl DeploymentMembers {
    pub fn group(&self, group: ServerGroup) -> &[MemberStatus] {
        match group {
            ServerGroup::Single => &self.single,
            ServerGroup::Agents => &self.agents,
            ServerGroup::DBServers => &self.dbservers,
            ServerGroup::Coordinators => &self.coordinators,
        }
    }

    pub fn group_mut(&mut self, group: ServerGroup) -> &mut Vec<MemberStatus> {
        match group {
            ServerGroup::Single => &mut self.single,
            ServerGroup::Agents => &mut self.agents,
            ServerGroup::DBServers => &mut self.dbservers,
            ServerGroup::Coordinators => &mut self.coordinators,
        }
    }

    /// Iterate over every member together with its group
    pub fn iter(&self) -> impl Iterator<Item = (ServerGroup, &MemberStatus)> {
        ServerGroup::ALL
            .into_iter()
            .flat_map(move |g| self.group(g).iter().map(move |m| (g, m)))
    }

    pub fn len(&self) -> usize {
        ServerGroup::ALL.iter().map(|g| self.group(*g).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, group: ServerGroup, id: &str) -> Option<&MemberStatus> {
        self.group(group).iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, group: ServerGroup, id: &str) -> Option<&mut MemberStatus> {
        self.group_mut(group).iter_mut().find(|m| m.id == id)
    }

    pub fn find_by_id(&self, id: &str) -> Option<(ServerGroup, &MemberStatus)> {
        self.iter().find(|(_, m)| m.id == id)
    }

    /// Add a member. Returns false if a member with this ID already exists.
    pub fn add(&mut self, group: ServerGroup, member: MemberStatus) -> bool {
        if self.find_by_id(&member.id).is_some() {
            return false;
        }
        self.group_mut(group).push(member);
        true
    }

    /// Remove a member. Returns false if it was not present.
    pub fn remove(&mut self, group: ServerGroup, id: &str) -> bool {
        let list = self.group_mut(group);
        let before = list.len();
        list.retain(|m| m.id != id);
        list.len() != before
    }

    /// Member IDs of a group, for agency bookkeeping
    pub fn ids(&self, group: ServerGroup) -> Vec<String> {
        self.group(group).iter().map(|m| m.id.clone()).collect()
    }
}
