//! Actions that add, remove and restate single members

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::parse_param;
use crate::client::{ConnectionError, post_json};
use crate::controller::error::Result;
use crate::crd::{
    Action, AgencyStatus, ConditionType, DeploymentMode, MemberPhase, MemberStatus, ServerGroup,
    TopologyStatus,
};
use crate::reconcile::action::{ActionContext, ActionImpl, Progress, action_target};

const TOPOLOGY_REASON: &str = "Topology Enabled";

/// Add a member with the ID chosen at planning time
pub struct AddMember(pub Action);

#[async_trait]
impl ActionImpl for AddMember {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        if ctx.member(group, id).is_some() {
            return Ok(true);
        }

        let now = ctx.now();
        let mut member = MemberStatus::new(id, now);
        member.phase = MemberPhase::Pending;

        if let Some(spec) = &ctx.spec.topology {
            if ctx.status.topology.is_none() {
                ctx.status.topology = Some(TopologyStatus::new(spec));
                ctx.status
                    .conditions
                    .update(ConditionType::TopologyAware, true, TOPOLOGY_REASON, "", now);
            }
            if let Some(topology) = ctx.status.topology.as_mut()
                && let Some(zone) = topology.least_used_zone(group)
            {
                topology.add_member(zone, group, id);
                member.zone = Some(zone);
            }
        }

        if group == ServerGroup::Agents {
            let agency = ctx.status.agency.get_or_insert_with(AgencyStatus::default);
            if !agency.ids.iter().any(|a| a == id) {
                agency.ids.push(id.to_string());
            }
        }

        info!(group = %group, member = id, "Adding member");
        ctx.status.members.add(group, member);
        Ok(true)
    }
}

/// Remove a member from the cluster, its pod, its volume and its status
pub struct RemoveMember(pub Action);

#[async_trait]
impl ActionImpl for RemoveMember {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let Some(member) = ctx.member(group, id).cloned() else {
            return Ok(true);
        };

        if ctx.mode() == DeploymentMode::Cluster
            && matches!(group, ServerGroup::DBServers | ServerGroup::Coordinators)
        {
            let connection = ctx.admin_connection()?;
            match post_json::<Value>(connection.as_ref(), "/_admin/cluster/removeServer", json!(id)).await {
                Ok(_) => {}
                Err(ConnectionError::Status { status: 404, .. }) => {
                    debug!(member = id, "Server already unknown to the cluster");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(pod) = &member.pod_name {
            ctx.delete_pod(pod).await?;
        }
        if let Some(pvc) = &member.pvc_name {
            ctx.kube.delete_pvc(ctx.namespace, pvc).await?;
        }

        ctx.status.members.remove(group, id);
        if let Some(topology) = ctx.status.topology.as_mut() {
            topology.remove_member(group, id);
        }
        if group == ServerGroup::Agents
            && let Some(agency) = ctx.status.agency.as_mut()
        {
            agency.ids.retain(|a| a != id);
        }
        ctx.clients.forget(group, id);

        info!(group = %group, member = id, "Removed member");
        Ok(true)
    }
}

pub struct MarkToRemoveMember(pub Action);

#[async_trait]
impl ActionImpl for MarkToRemoveMember {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let now = ctx.now();
        if let Some(member) = ctx.member_mut(group, id) {
            member
                .conditions
                .update(ConditionType::MarkedToRemove, true, "Scale Down", "", now);
        }
        Ok(true)
    }
}

/// Replace the pod of a failed member, keeping its ID and volume
pub struct RecreateMember(pub Action);

#[async_trait]
impl ActionImpl for RecreateMember {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let Some(member) = ctx.member(group, id).cloned() else {
            return Ok(true);
        };
        if member.phase != MemberPhase::Failed {
            return Ok(true);
        }

        if let Some(pod) = &member.pod_name {
            ctx.delete_pod(pod).await?;
        }
        let now = ctx.now();
        if let Some(member) = ctx.member_mut(group, id) {
            warn!(group = %group, member = id, "Recreating failed member");
            member.phase = MemberPhase::Pending;
            member.pod_uid = None;
            member.conditions.remove(ConditionType::Terminated);
            member
                .conditions
                .update(ConditionType::Ready, false, "Recreating", "", now);
        }
        Ok(true)
    }
}

/// Wait until a member serves requests and, in a cluster, the agency reports it good
pub struct WaitForMemberUp(pub Action);

impl WaitForMemberUp {
    fn is_up(&self, ctx: &ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let Some(member) = ctx.member(group, id) else {
            return Ok(true);
        };
        if !member.is_ready() || !ctx.members.is_member_reachable(id) {
            return Ok(false);
        }
        if ctx.mode() == DeploymentMode::Cluster && group != ServerGroup::Agents {
            return Ok(ctx
                .agency_state()
                .is_some_and(|state| state.is_server_good(id)));
        }
        Ok(true)
    }
}

#[async_trait]
impl ActionImpl for WaitForMemberUp {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        self.is_up(ctx)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        Ok(self.is_up(ctx)?.into())
    }
}

pub struct KillMemberPod(pub Action);

#[async_trait]
impl ActionImpl for KillMemberPod {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        if let Some(pod) = ctx.member(group, id).and_then(|m| m.pod_name.clone()) {
            ctx.delete_pod(&pod).await?;
        }
        Ok(true)
    }
}

/// Params: `phase`
pub struct MemberPhaseUpdate(pub Action);

#[async_trait]
impl ActionImpl for MemberPhaseUpdate {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let phase: MemberPhase = parse_param(&self.0, "phase")?;
        if let Some(member) = ctx.member_mut(group, id) {
            member.phase = phase;
        }
        Ok(true)
    }
}

/// Params: `condition`, `status`, `reason`, `message`. Without `status`
/// the condition is removed.
pub struct SetMemberCondition(pub Action);

#[async_trait]
impl ActionImpl for SetMemberCondition {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let condition: ConditionType = parse_param(&self.0, "condition")?;
        let status = self.0.param("status").map(|s| s == "True");
        let reason = self.0.param("reason").unwrap_or_default();
        let message = self.0.param("message").unwrap_or_default();
        let now = ctx.now();

        if let Some(member) = ctx.member_mut(group, id) {
            match status {
                Some(value) => {
                    member.conditions.update(condition, value, reason, message, now);
                }
                None => {
                    member.conditions.remove(condition);
                }
            }
        }
        Ok(true)
    }
}

