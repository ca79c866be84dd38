//! Restarts and image changes of single members

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::required_param;
use crate::controller::error::{Error, Result};
use crate::crd::{Action, ConditionType, MemberPhase};
use crate::reconcile::action::{ActionContext, ActionImpl, Progress, action_target};
use crate::resources::pod::{
    SERVER_CONTAINER, container_image, container_status, is_pod_ready, pod_restart_policy,
};

/// How long a container may keep crashing after an in place image change
const RESTART_GRACE: Duration = Duration::from_secs(20);

/// Delete a member's pod so it is recreated from the current spec
pub struct RotateMember(pub Action);

#[async_trait]
impl ActionImpl for RotateMember {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let Some(member) = ctx.member(group, id).cloned() else {
            return Ok(true);
        };
        if let Some(pod) = &member.pod_name {
            ctx.delete_pod(pod).await?;
        }
        let now = ctx.now();
        if let Some(member) = ctx.member_mut(group, id) {
            info!(group = %group, member = id, "Rotating member");
            member.phase = MemberPhase::Pending;
            member.pod_uid = None;
            member
                .conditions
                .update(ConditionType::Ready, false, "Rotating", "", now);
        }
        Ok(false)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        let (group, id) = action_target(&self.0)?;
        Ok(ctx.member(group, id).is_none_or(|m| m.is_ready()).into())
    }

    async fn post(&self, ctx: &mut ActionContext<'_>) -> Result<()> {
        let (group, id) = action_target(&self.0)?;
        if let Some(member) = ctx.member_mut(group, id) {
            member.conditions.remove(ConditionType::Restart);
            member.conditions.remove(ConditionType::PendingRestart);
        }
        Ok(())
    }
}

/// Restart a member on a new image. Params: `image`
pub struct UpgradeMember(pub Action);

#[async_trait]
impl ActionImpl for UpgradeMember {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let image = required_param(&self.0, "image")?.to_string();
        let Some(member) = ctx.member(group, id).cloned() else {
            return Ok(true);
        };
        if let Some(pod) = &member.pod_name {
            ctx.delete_pod(pod).await?;
        }
        let now = ctx.now();
        if let Some(member) = ctx.member_mut(group, id) {
            info!(group = %group, member = id, image = %image, "Upgrading member");
            member.image = Some(image);
            member.phase = MemberPhase::Pending;
            member.pod_uid = None;
            member
                .conditions
                .update(ConditionType::Ready, false, "Upgrading", "", now);
        }
        Ok(false)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        let (group, id) = action_target(&self.0)?;
        Ok(ctx.member(group, id).is_none_or(|m| m.is_ready()).into())
    }
}

/// Swap the server container image in place, without recreating the pod.
/// Params: `image`
pub struct RuntimeContainerImageUpdate(pub Action);

/// Images match, ignoring a registry prefix the runtime may report
fn same_image(reported: &str, wanted: &str) -> bool {
    reported == wanted || reported.ends_with(&format!("/{wanted}"))
}

#[async_trait]
impl ActionImpl for RuntimeContainerImageUpdate {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let image = required_param(&self.0, "image")?;
        let Some(pod_name) = ctx.member(group, id).and_then(|m| m.pod_name.clone()) else {
            return Ok(true);
        };
        let Some(pod) = ctx.snapshot.pod(&pod_name) else {
            return Ok(true);
        };
        if container_image(pod, SERVER_CONTAINER) == Some(image) {
            debug!(member = id, image, "Server container already runs the image");
            return Ok(true);
        }

        info!(member = id, image, "Updating server container image");
        tokio::time::timeout(
            ctx.pod_update_timeout,
            ctx.kube
                .update_pod_image(ctx.namespace, &pod_name, SERVER_CONTAINER, image),
        )
        .await
        .map_err(|_| Error::TimeoutError(format!("updating image of pod {pod_name}")))??;
        Ok(false)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        let (group, id) = action_target(&self.0)?;
        let image = required_param(&self.0, "image")?;
        let Some(pod) = ctx
            .member(group, id)
            .and_then(|m| m.pod_name.as_deref())
            .and_then(|name| ctx.snapshot.pod(name))
        else {
            debug!(member = id, "Member or pod gone");
            return Ok(Progress::ready());
        };

        if container_image(pod, SERVER_CONTAINER) != Some(image) {
            // spec changed underneath us, nothing left to wait for
            return Ok(Progress::ready());
        }
        let Some(cstatus) = container_status(pod, SERVER_CONTAINER) else {
            return Ok(Progress::pending());
        };
        let state = cstatus.state.as_ref();

        if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
            if !same_image(&cstatus.image, image) {
                return Ok(Progress::pending());
            }
            warn!(
                member = id,
                exit_code = terminated.exit_code,
                reason = terminated.reason.as_deref().unwrap_or_default(),
                "Container failed during image replacement"
            );
            return Ok(Progress::abort());
        }

        if state.is_some_and(|s| s.waiting.is_some()) {
            if pod_restart_policy(pod) == Some("Always")
                && let Some(finished_at) = cstatus
                    .last_state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .and_then(|t| t.finished_at.as_ref())
            {
                let crashed_for = ctx.now().timestamp() - finished_at.0.as_second();
                if crashed_for > RESTART_GRACE.as_secs() as i64 {
                    warn!(member = id, "Container continuously failing during image replacement");
                    return Ok(Progress::abort());
                }
            }
            return Ok(Progress::pending());
        }

        if state.is_some_and(|s| s.running.is_some()) {
            return Ok((same_image(&cstatus.image, image) && is_pod_ready(pod)).into());
        }
        Ok(Progress::pending())
    }

    async fn post(&self, ctx: &mut ActionContext<'_>) -> Result<()> {
        let (group, id) = action_target(&self.0)?;
        let image = required_param(&self.0, "image")?.to_string();
        if let Some(member) = ctx.member_mut(group, id) {
            member.image = Some(image);
        }
        Ok(())
    }
}

/// Record the image every member runs. Params: `image`
pub struct SetCurrentImage(pub Action);

#[async_trait]
impl ActionImpl for SetCurrentImage {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let image = required_param(&self.0, "image")?;
        info!(image, "Deployment runs new image");
        ctx.status.current_image = Some(image.to_string());
        Ok(true)
    }
}
