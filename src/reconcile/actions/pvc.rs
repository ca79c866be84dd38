use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::controller::error::{Error, Result};
use crate::crd::{Action, ConditionType};
use crate::reconcile::action::{ActionContext, ActionImpl, Progress, action_target};
use crate::resources::pvc::{capacity, parse_quantity, requested_size};

const FS_RESIZE_PENDING: &str = "FileSystemResizePending";

/// Grow a member's volume claim to the size in the spec
pub struct PvcResize(pub Action);

impl PvcResize {
    fn desired(&self, ctx: &ActionContext<'_>) -> Result<(String, u64)> {
        let (group, _) = action_target(&self.0)?;
        let size = ctx
            .spec
            .volume_size(group)
            .ok_or_else(|| Error::ActionFailed(format!("group {group} has no volume")))?;
        let bytes = parse_quantity(size)
            .ok_or_else(|| Error::ActionFailed(format!("invalid volume size {size}")))?;
        Ok((size.to_string(), bytes))
    }
}

#[async_trait]
impl ActionImpl for PvcResize {
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool> {
        let (group, id) = action_target(&self.0)?;
        let Some(pvc_name) = ctx.member(group, id).and_then(|m| m.pvc_name.clone()) else {
            return Ok(true);
        };
        let Some(pvc) = ctx.snapshot.pvc(&pvc_name) else {
            return Ok(true);
        };
        let (size, bytes) = self.desired(ctx)?;

        if requested_size(pvc).is_none_or(|current| current < bytes) {
            info!(member = id, pvc = %pvc_name, size = %size, "Resizing volume");
            let patch = json!({
                "spec": { "resources": { "requests": { "storage": size } } }
            });
            ctx.kube.patch_pvc(ctx.namespace, &pvc_name, &patch).await?;
        }
        let now = ctx.now();
        if let Some(member) = ctx.member_mut(group, id) {
            member.conditions.update(
                ConditionType::PvcResizePending,
                true,
                "Resize Requested",
                &size,
                now,
            );
        }
        Ok(false)
    }

    async fn check_progress(&self, ctx: &mut ActionContext<'_>) -> Result<Progress> {
        let (group, id) = action_target(&self.0)?;
        let Some(pvc) = ctx
            .member(group, id)
            .and_then(|m| m.pvc_name.as_deref())
            .and_then(|name| ctx.snapshot.pvc(name))
        else {
            return Ok(Progress::ready());
        };
        let (_, bytes) = self.desired(ctx)?;

        let fs_pending = pvc
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == FS_RESIZE_PENDING && c.status == "True")
            });
        if fs_pending {
            // the file system only grows once the pod restarts
            let now = ctx.now();
            if let Some(member) = ctx.member_mut(group, id) {
                member.conditions.update(
                    ConditionType::PendingRestart,
                    true,
                    FS_RESIZE_PENDING,
                    "",
                    now,
                );
            }
            return Ok(Progress::ready());
        }

        Ok(capacity(pvc).is_some_and(|c| c >= bytes).into())
    }

    async fn post(&self, ctx: &mut ActionContext<'_>) -> Result<()> {
        let (group, id) = action_target(&self.0)?;
        if let Some(member) = ctx.member_mut(group, id) {
            member.conditions.remove(ConditionType::PvcResizePending);
        }
        Ok(())
    }
}
