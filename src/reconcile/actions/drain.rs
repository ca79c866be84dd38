//! Actions that move data or leadership off a member before it goes away

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agency::JobStatus;
use crate::client::{Request, post_json};
use crate::controller::error::Result;
use crate::crd::{Action, DeploymentMode, MemberPhase, ServerGroup};
use crate::reconcile::action::{ActionContext, ActionImpl, Progress, action_target};

/// Response of endpoints that create an agency job
#[derive(Deserialize)]
struct JobResponse {
    id: String,
}

/// A job recorded on a member is still worth waiting for. Without valid
/// agency data the job is assumed to be running.
fn job_in_flight(ctx: &ActionContext<'_>, job_id: &str) -> bool {
    ctx.agency_state().is_none_or(|state| {
        matches!(state.job_status(job_id), JobStatus::ToDo | JobStatus::Pending)
    })
}

/// Drop a job id left behind by an earlier plan. Returns whether one was
/// still in flight.
fn resume_or_forget_job(ctx: &mut ActionContext<'_>, group: ServerGroup, id: &str) -> bool {
    let Some(job_id) = ctx.member(group, id).and_then(|m| m.job_id.clone()) else {
        return false;
    };
    if job_in_flight(ctx, &job_id) {
        return true;
    }
    info!(member = id, job = %job_id, "Forgetting stale agency job");
    if let Some(member) = ctx.member_mut(group, id) {
        member.job_id = None;
    }
    false
}

/// Clean out a DB-Server: the agency moves all its shards elsewhere
pub struct CleanOutMember(pub Action);

#[async_trait]
impl ActionImpl for CleanOutMember {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        if ctx.member(group, id).is_none() {
            return Ok(true);
        }
        if ctx
            .agency_state()
            .is_some_and(|state| state.is_cleaned_out(id))
        {
            return Ok(true);
        }
        if resume_or_forget_job(ctx, group, id) {
            return Ok(false);
        }

        let connection = ctx.admin_connection()?;
        let job: JobResponse = post_json(
            connection.as_ref(),
            "/_admin/cluster/cleanOutServer",
            json!({ "server": id }),
        )
        .await?;

        info!(member = id, job = %job.id, "Clean out started");
        if let Some(member) = ctx.member_mut(group, id) {
            member.job_id = Some(job.id);
            member.phase = MemberPhase::Drain;
        }
        Ok(false)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        let (group, id) = action_target(&self.0)?;
        let Some(member) = ctx.member(group, id) else {
            return Ok(Progress::ready());
        };
        let Some(state) = ctx.agency_state() else {
            return Ok(Progress::pending());
        };
        if state.is_cleaned_out(id) {
            return Ok(Progress::ready());
        }
        let Some(job_id) = member.job_id.clone() else {
            return Ok(Progress::pending());
        };
        match state.job_status(&job_id) {
            JobStatus::Failed => {
                warn!(member = id, job = %job_id, "Clean out job failed");
                // a re-planned clean out must issue a new job
                if let Some(member) = ctx.member_mut(group, id) {
                    member.job_id = None;
                }
                Ok(Progress::abort())
            }
            _ => Ok(Progress::pending()),
        }
    }

    async fn post(&self, ctx: &mut ActionContext<'_>) -> Result<()> {
        let (group, id) = action_target(&self.0)?;
        if let Some(member) = ctx.member_mut(group, id) {
            member.job_id = None;
        }
        Ok(())
    }
}

/// Ask a member to shut down gracefully, then delete its pod
pub struct ShutdownMember(pub Action);

impl ShutdownMember {
    fn pod_gone(&self, ctx: &ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        Ok(ctx
            .member(group, id)
            .and_then(|m| m.pod_name.as_deref())
            .is_none_or(|pod| ctx.snapshot.pod(pod).is_none()))
    }
}

#[async_trait]
impl ActionImpl for ShutdownMember {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        if self.pod_gone(ctx)? {
            return Ok(true);
        }
        let Some(pod) = ctx.member(group, id).and_then(|m| m.pod_name.clone()) else {
            return Ok(true);
        };

        if ctx.members.is_member_reachable(id) {
            match ctx.clients.get(group, id) {
                Ok(connection) => {
                    if let Err(e) = connection.request(Request::delete("/_admin/shutdown")).await {
                        debug!(member = id, error = %e, "Graceful shutdown request failed");
                    }
                }
                Err(e) => debug!(member = id, error = %e, "No connection for shutdown"),
            }
        }

        ctx.delete_pod(&pod).await?;
        Ok(false)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        Ok(self.pod_gone(ctx)?.into())
    }
}

/// Move shard leadership away from a DB-Server before it restarts
pub struct ResignLeadership(pub Action);

#[async_trait]
impl ActionImpl for ResignLeadership {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        if group != ServerGroup::DBServers || ctx.mode() != DeploymentMode::Cluster {
            return Ok(true);
        }
        if ctx.member(group, id).is_none() {
            return Ok(true);
        }
        if resume_or_forget_job(ctx, group, id) {
            return Ok(false);
        }

        let connection = ctx.admin_connection()?;
        let job: JobResponse = post_json(
            connection.as_ref(),
            "/_admin/cluster/resignLeadership",
            json!({ "server": id }),
        )
        .await?;

        info!(member = id, job = %job.id, "Resign leadership started");
        if let Some(member) = ctx.member_mut(group, id) {
            member.job_id = Some(job.id);
        }
        Ok(false)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        let (group, id) = action_target(&self.0)?;
        let Some(job_id) = ctx.member(group, id).and_then(|m| m.job_id.clone()) else {
            return Ok(Progress::ready());
        };
        let Some(state) = ctx.agency_state() else {
            return Ok(Progress::pending());
        };
        match state.job_status(&job_id) {
            JobStatus::Finished => Ok(Progress::ready()),
            JobStatus::Failed => {
                // the restart proceeds without a clean handover
                warn!(member = id, job = %job_id, "Resign leadership job failed");
                Ok(Progress::ready())
            }
            _ => Ok(Progress::pending()),
        }
    }

    async fn post(&self, ctx: &mut ActionContext<'_>) -> Result<()> {
        let (group, id) = action_target(&self.0)?;
        if let Some(member) = ctx.member_mut(group, id) {
            member.job_id = None;
        }
        Ok(())
    }
}
