//! Plan execution
//!
//! Runs the head of the persisted plan. Finished actions are removed and the
//! status is saved after every step, so a restarted controller resumes the
//! plan where it stopped. At most `max_actions` actions finish per tick.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument, warn};

use super::action::{ActionContext, ActionImpl, Progress};
use super::registry::ActionRegistry;
use super::timeouts::{action_timeout, is_expired};
use crate::controller::error::{Error, Result};
use crate::controller::status::StatusManager;
use crate::crd::{Action, ActionType, RestoreState, UnknownActionType};
use crate::events::{EventPublisher, actions as event_actions, reasons};

/// What happened to an action during a tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    Started,
    Finished,
    Aborted,
    TimedOut,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Started => "started",
            ActionOutcome::Finished => "finished",
            ActionOutcome::Aborted => "aborted",
            ActionOutcome::TimedOut => "timeout",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub outcomes: Vec<(ActionType, ActionOutcome)>,
    /// Actions are left in the plan after this tick
    pub plan_pending: bool,
}

impl ExecutionReport {
    fn record(&mut self, type_: ActionType, outcome: ActionOutcome) {
        self.outcomes.push((type_, outcome));
    }

    pub fn count(&self, outcome: ActionOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }
}

pub struct PlanExecutor<'r> {
    registry: &'r ActionRegistry,
    events: &'r dyn EventPublisher,
    max_actions: usize,
}

impl<'r> PlanExecutor<'r> {
    pub fn new(registry: &'r ActionRegistry, events: &'r dyn EventPublisher, max_actions: usize) -> Self {
        Self {
            registry,
            events,
            max_actions: max_actions.max(1),
        }
    }

    /// Drive the plan in `ctx.status` forward.
    ///
    /// On error the working status may hold partial changes and must not be
    /// persisted by the caller; the stored plan is unchanged.
    #[instrument(skip(self, ctx, status), fields(name = ctx.name, namespace = ctx.namespace))]
    pub async fn execute(
        &self,
        ctx: &mut ActionContext<'_>,
        status: &StatusManager<'_>,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();
        let object = ctx.deployment.object_ref(&());

        for _ in 0..self.max_actions {
            let Some(action) = ctx.status.plan.first().cloned() else {
                break;
            };
            let type_ = action.action_type()?;
            let action_impl = self.registry.build(&action)?;

            if !action.is_started() {
                debug!(action = %type_, id = %action.id, member = %action.member_id, "Starting action");
                report.record(type_, ActionOutcome::Started);
                let ready = match action_impl.start(ctx).await {
                    Ok(ready) => ready,
                    Err(e) if is_action_fatal(&e) => {
                        self.abort(ctx, status, &object, &action, reasons::ACTION_ABORTED, e.to_string())
                            .await?;
                        report.record(type_, ActionOutcome::Aborted);
                        break;
                    }
                    Err(e) => return Err(e.wrap(format!("starting {type_} action"))),
                };
                if ready {
                    self.finish(ctx, status, &object, action_impl.as_ref(), &action).await?;
                    report.record(type_, ActionOutcome::Finished);
                    continue;
                }
                let now = ctx.now();
                if let Some(head) = ctx.status.plan.first_mut() {
                    head.started_at = Some(now);
                }
                status.update(ctx.status).await?;
                break;
            }

            let progress = match action_impl.check_progress(ctx).await {
                Ok(progress) => progress,
                Err(e) if is_action_fatal(&e) => {
                    warn!(action = %type_, error = %e, "Action cannot complete");
                    Progress::abort()
                }
                Err(e) => return Err(e.wrap(format!("checking {type_} action"))),
            };

            if progress.abort {
                self.abort(
                    ctx,
                    status,
                    &object,
                    &action,
                    reasons::ACTION_ABORTED,
                    format!("{type_} action {} aborted", action.id),
                )
                .await?;
                report.record(type_, ActionOutcome::Aborted);
                break;
            }
            if progress.ready {
                self.finish(ctx, status, &object, action_impl.as_ref(), &action).await?;
                report.record(type_, ActionOutcome::Finished);
                continue;
            }

            let registered = self
                .registry
                .default_timeout(type_)
                .ok_or_else(|| Error::UnknownActionType(UnknownActionType(action.type_.clone())))?;
            let timeout = action_timeout(ctx.spec, type_, registered);
            if let Some(started_at) = action.started_at
                && is_expired(started_at, ctx.now(), timeout)
            {
                self.abort(
                    ctx,
                    status,
                    &object,
                    &action,
                    reasons::ACTION_TIMEOUT,
                    format!("{type_} action {} timed out after {timeout:?}", action.id),
                )
                .await?;
                report.record(type_, ActionOutcome::TimedOut);
            }
            break;
        }

        report.plan_pending = !ctx.status.plan.is_empty();
        Ok(report)
    }

    /// Run `post`, drop the head of the plan and persist
    async fn finish(
        &self,
        ctx: &mut ActionContext<'_>,
        status: &StatusManager<'_>,
        object: &ObjectReference,
        action_impl: &dyn ActionImpl,
        action: &Action,
    ) -> Result<()> {
        action_impl.post(ctx).await?;
        if ctx.status.plan.first().is_some_and(|head| head.id == action.id) {
            ctx.status.plan.remove(0);
        }
        status.update(ctx.status).await?;
        info!(action = %action.type_, id = %action.id, member = %action.member_id, "Action finished");

        if let Some((reason, type_, note)) = finished_event(ctx, action) {
            self.events
                .publish(object, type_, reason, event_actions::EXECUTE_PLAN, Some(note))
                .await;
        }
        Ok(())
    }

    /// Clear the whole plan and persist
    async fn abort(
        &self,
        ctx: &mut ActionContext<'_>,
        status: &StatusManager<'_>,
        object: &ObjectReference,
        action: &Action,
        reason: &str,
        note: String,
    ) -> Result<()> {
        warn!(action = %action.type_, id = %action.id, reason, note = %note, "Aborting plan");
        ctx.status.plan.clear();
        status.update(ctx.status).await?;
        self.events
            .publish(object, EventType::Warning, reason, event_actions::EXECUTE_PLAN, Some(note))
            .await;
        Ok(())
    }
}

/// Errors after which retrying the same action cannot help
fn is_action_fatal(error: &Error) -> bool {
    matches!(error.root(), Error::ActionFailed(_))
}

fn finished_event(ctx: &ActionContext<'_>, action: &Action) -> Option<(&'static str, EventType, String)> {
    match action.action_type().ok()? {
        ActionType::AddMember => Some((
            reasons::MEMBER_ADDED,
            EventType::Normal,
            format!("member {} added", action.member_id),
        )),
        ActionType::RemoveMember => Some((
            reasons::MEMBER_REMOVED,
            EventType::Normal,
            format!("member {} removed", action.member_id),
        )),
        ActionType::BackupRestore => {
            let restore = ctx.status.restore.as_ref()?;
            match restore.state {
                RestoreState::Restored => Some((
                    reasons::RESTORE_COMPLETED,
                    EventType::Normal,
                    format!("backup {} restored", restore.backup),
                )),
                RestoreState::Failed => Some((
                    reasons::RESTORE_FAILED,
                    EventType::Warning,
                    restore.message.clone().unwrap_or_default(),
                )),
            }
        }
        _ => None,
    }
}
