//! One inspection tick of an ArangoDeployment
//!
//! A tick observes the deployment, brings the status in line with what it
//! sees, plans if nothing is planned, and runs the plan. Whenever it persists
//! a change that later steps depend on, it stops early and asks to be called
//! again right away. The returned [`Interval`] is the only scheduling output.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::agency::AgencyError;
use crate::controller::context::{Context, DeploymentHandle};
use crate::controller::error::{Error, Result, ResultExt};
use crate::controller::interval::Interval;
use crate::controller::secrets::{check_hashes, current_hashes, jwt_token};
use crate::controller::spec_acceptance::{Acceptance, SpecAcceptor};
use crate::controller::status::reasons as condition_reasons;
use crate::controller::status::{DerivedCondition, StatusManager, spec_accepted, up_to_date};
use crate::crd::{
    AgencyStatus, ArangoDeployment, ArangoDeploymentSpec, ArangoDeploymentStatus, ConditionType,
    DeploymentMode, DeploymentPhase, MemberPhase, MemberStatus, ServerGroup,
};
use crate::events::{actions, reasons};
use crate::inspector::{ResourceKind, Snapshot};
use crate::members::inspect_pods;
use crate::reconcile::{ActionContext, ActionOutcome, PlanExecutor, PlanInput, create_plan};
use crate::resources::pod::{PodTemplate, pod_name};
use crate::resources::pvc::build_pvc;

/// Skip inspection entirely while this annotation is present
pub const MAINTENANCE_ANNOTATION: &str = "deployment.arangodb.com/maintenance";

/// Drop the persisted plan once; the annotation is removed afterwards
pub const PLAN_CLEAN_ANNOTATION: &str = "deployment.arangodb.com/plan-clean";

/// Requeue interval while actions are in flight
const PLAN_PENDING_INTERVAL: Duration = Duration::from_secs(1);

fn has_annotation(deployment: &ArangoDeployment, key: &str) -> bool {
    deployment.annotations().contains_key(key)
}

/// Run one tick. `Ok(None)` means the deployment is gone and nothing needs
/// to be scheduled.
#[instrument(skip(ctx))]
pub async fn inspect_deployment(ctx: &Context, namespace: &str, name: &str) -> Result<Option<Interval>> {
    let Some(deployment) = ctx
        .kube
        .get_deployment(namespace, name)
        .await
        .context(format!("Loading deployment {namespace}/{name}"))?
    else {
        debug!("Deployment is gone");
        ctx.forget(namespace, name);
        return Ok(None);
    };

    let interval = Interval::new(ctx.config.max_inspection_interval);
    if has_annotation(&deployment, MAINTENANCE_ANNOTATION) {
        info!("Maintenance annotation set, skipping inspection");
        return Ok(Some(interval));
    }

    let mode = deployment
        .status
        .as_ref()
        .and_then(|s| s.accepted_spec.as_ref())
        .unwrap_or(&deployment.spec)
        .mode();
    let handle = ctx.handle(namespace, name, mode);

    let tick = Tick {
        ctx,
        handle: &handle,
        deployment: &deployment,
        namespace,
        name,
        status_manager: StatusManager::new(ctx.kube.as_ref(), namespace, name)
            .with_stored(deployment.status.clone()),
    };
    tick.run(interval).await.map(Some)
}

struct Tick<'a> {
    ctx: &'a Context,
    handle: &'a Arc<DeploymentHandle>,
    deployment: &'a ArangoDeployment,
    namespace: &'a str,
    name: &'a str,
    status_manager: StatusManager<'a>,
}

impl Tick<'_> {
    async fn run(&self, interval: Interval) -> Result<Interval> {
        let ctx = self.ctx;
        let min = ctx.config.min_inspection_interval;
        let mut status = self.deployment.status.clone().unwrap_or_default();

        let acceptor = SpecAcceptor {
            kube: ctx.kube.as_ref(),
            events: ctx.events.as_ref(),
            namespace: self.namespace,
            name: self.name,
        };
        match acceptor
            .accept(self.deployment, &mut status, &self.status_manager)
            .await?
        {
            Acceptance::Patched => return Ok(interval.reduce_to(min)),
            Acceptance::Rejected(_) if status.accepted_spec.is_none() => {
                debug!("No valid spec accepted yet");
                return Ok(interval);
            }
            _ => {}
        }
        let Some(spec) = status.accepted_spec.clone() else {
            return Ok(interval);
        };

        if status.phase == DeploymentPhase::Failed {
            warn!(reason = ?status.reason, "Deployment failed, inspection stopped");
            return Ok(interval);
        }

        self.handle
            .resources
            .refresh()
            .await
            .context("Refreshing resource cache")?;
        let snapshot = self.handle.resources.snapshot();
        let now = ctx.clock.now();

        let mut dirty = false;
        if status.phase == DeploymentPhase::None {
            status.phase = DeploymentPhase::Running;
            dirty = true;
        }
        if status.members.is_empty() {
            create_initial_members(&spec, &mut status, now);
            dirty = true;
        }

        dirty |= self.check_secrets(&spec, &snapshot, &mut status).await?;
        self.handle
            .clients
            .configure(spec.tls_enabled(), jwt_token(&spec, &snapshot).as_deref());

        dirty |= inspect_pods(&mut status, &snapshot, now);
        self.reload_agency(&status).await;
        self.handle
            .members
            .refresh_state(
                spec.mode(),
                &status.members,
                &snapshot,
                &self.handle.clients,
                self.handle.agency.as_ref(),
            )
            .await;
        let members = self.handle.members.state();

        dirty |= self.ensure_pods(&spec, &snapshot, &mut status).await?;
        if dirty {
            self.status_manager.update(&status).await?;
        }

        let checksum = self.deployment.spec.checksum()?;
        let accepted = spec_accepted(&status, &checksum);
        if self
            .sync_condition(&mut status, ConditionType::SpecAccepted, accepted, &checksum)
            .await?
        {
            return Ok(interval.reduce_to(min));
        }

        if has_annotation(self.deployment, PLAN_CLEAN_ANNOTATION) {
            self.clean_plan(&mut status).await?;
            return Ok(interval.reduce_to(min));
        }

        if status.plan.is_empty() && self.plan(&spec, &snapshot, &checksum, &mut status).await? {
            return Ok(interval.reduce_to(min));
        }

        let reachable = if members.is_reachable() {
            DerivedCondition {
                status: true,
                reason: condition_reasons::REACHABLE,
                message: String::new(),
            }
        } else {
            DerivedCondition {
                status: false,
                reason: condition_reasons::NOT_REACHABLE,
                message: "deployment has no healthy quorum".to_string(),
            }
        };
        if self
            .sync_condition(&mut status, ConditionType::Reachable, reachable, "")
            .await?
        {
            return Ok(interval.reduce_to(min));
        }

        if status.plan.is_empty() && status.applied_version != status.accepted_spec_version {
            info!(version = ?status.accepted_spec_version, "Accepted spec applied");
            status.applied_version = status.accepted_spec_version.clone();
            self.status_manager.update(&status).await?;
        }

        let converged = up_to_date(&status);
        if self
            .sync_condition(&mut status, ConditionType::UpToDate, converged, &checksum)
            .await?
        {
            return Ok(interval.reduce_to(min));
        }

        let mut interval = interval;
        if !status.plan.is_empty() {
            let executor = PlanExecutor::new(
                &ctx.registry,
                ctx.events.as_ref(),
                ctx.config.max_synchronous_actions,
            );
            let mut action_ctx = ActionContext {
                deployment: self.deployment,
                namespace: self.namespace,
                name: self.name,
                spec: &spec,
                status: &mut status,
                kube: ctx.kube.as_ref(),
                clients: &self.handle.clients,
                agency: self.handle.agency.as_ref(),
                snapshot: &snapshot,
                members: &members,
                clock: ctx.clock.as_ref(),
                pod_update_timeout: ctx.config.pod_update_timeout,
            };
            let report = executor
                .execute(&mut action_ctx, &self.status_manager)
                .await
                .context("Executing plan")?;

            if let Some(health) = &ctx.health_state {
                for (type_, outcome) in &report.outcomes {
                    health
                        .metrics
                        .record_action(self.namespace, self.name, type_.as_str(), outcome.as_str());
                }
            }
            // actions touch pods and volumes
            self.handle.resources.invalidate(ResourceKind::Pod);
            self.handle
                .resources
                .invalidate(ResourceKind::PersistentVolumeClaim);

            if report.plan_pending {
                interval = interval.reduce_to(PLAN_PENDING_INTERVAL);
            }
            let settled = report.count(ActionOutcome::Finished)
                + report.count(ActionOutcome::Aborted)
                + report.count(ActionOutcome::TimedOut);
            if settled > 0 {
                interval = interval.reduce_to(min);
            }
        }

        self.record_metrics(&spec, &status);
        Ok(interval)
    }

    /// Apply a derived condition. Persists and returns true if it changed.
    async fn sync_condition(
        &self,
        status: &mut ArangoDeploymentStatus,
        type_: ConditionType,
        desired: DerivedCondition,
        hash: &str,
    ) -> Result<bool> {
        if !status
            .conditions
            .update_with_hash(type_, desired.status, desired.reason, &desired.message, hash, self.ctx.clock.now())
        {
            return Ok(false);
        }
        debug!(condition = %type_, status = desired.status, reason = desired.reason, "Condition changed");
        self.status_manager.update(status).await?;
        Ok(true)
    }

    /// Record new secret hashes, or stop the tick if a recorded secret changed
    async fn check_secrets(
        &self,
        spec: &ArangoDeploymentSpec,
        snapshot: &Snapshot,
        status: &mut ArangoDeploymentStatus,
    ) -> Result<bool> {
        let check = check_hashes(status.secret_hashes.as_ref(), &current_hashes(spec, snapshot));

        if !check.changed.is_empty() {
            let message = format!("secrets changed: {}", check.changed.join(", "));
            if status.conditions.update(
                ConditionType::SecretsChanged,
                true,
                condition_reasons::SECRETS_CHANGED,
                &message,
                self.ctx.clock.now(),
            ) {
                self.status_manager.update(status).await?;
                self.ctx
                    .events
                    .publish(
                        &self.deployment.object_ref(&()),
                        EventType::Warning,
                        reasons::SECRETS_CHANGED,
                        actions::INSPECT_SECRETS,
                        Some(message.clone()),
                    )
                    .await;
            }
            return Err(Error::ValidationError(message));
        }

        let mut changed = false;
        if status.secret_hashes.as_ref() != Some(&check.hashes) {
            status.secret_hashes = Some(check.hashes);
            changed = true;
        }
        if status.conditions.get(ConditionType::SecretsChanged).is_some() {
            changed |= status.conditions.update(
                ConditionType::SecretsChanged,
                false,
                condition_reasons::SECRETS_UNCHANGED,
                "",
                self.ctx.clock.now(),
            );
        }
        Ok(changed)
    }

    async fn reload_agency(&self, status: &ArangoDeploymentStatus) {
        let agency = self.handle.agency.as_ref();
        if self.handle.mode == DeploymentMode::Cluster {
            let ids = status
                .agency
                .as_ref()
                .map(|a| a.ids.clone())
                .unwrap_or_else(|| status.members.ids(ServerGroup::Agents));
            if ids.is_empty() {
                return;
            }
            if let Err(e) = agency.set_members(&ids, &self.handle.clients) {
                warn!(error = %e, "Cannot connect to agents");
            }
        }

        let result = agency.reload().await;
        if let Some(health) = &self.ctx.health_state {
            health
                .metrics
                .record_agency_fetch(self.namespace, self.name, result.as_ref().ok().copied());
        }
        match result {
            Ok(index) => debug!(commit_index = index, "Agency cache reloaded"),
            Err(AgencyError::NoLeader) => debug!("Agency has no leader yet"),
            Err(e) => warn!(error = %e, "Agency reload failed"),
        }
    }

    /// Create volumes and pods for members that have none yet. Returns true
    /// if any member changed.
    async fn ensure_pods(
        &self,
        spec: &ArangoDeploymentSpec,
        snapshot: &Snapshot,
        status: &mut ArangoDeploymentStatus,
    ) -> Result<bool> {
        let kube = self.ctx.kube.as_ref();
        let template = PodTemplate {
            deployment: self.deployment,
            spec,
            agent_ids: status.members.ids(ServerGroup::Agents),
            port: self.ctx.config.member_port,
        };

        let mut created = false;
        for &group in spec.groups() {
            for member in status.members.group_mut(group).iter_mut() {
                if !matches!(member.phase, MemberPhase::None | MemberPhase::Pending)
                    || member.is_marked_to_remove()
                {
                    continue;
                }
                let name = pod_name(self.name, group, &member.id);
                if snapshot.pod(&name).is_some() {
                    debug!(member = %member.id, pod = %name, "Previous pod still present");
                    continue;
                }

                if member.image.is_none() {
                    member.image = Some(spec.image().to_string());
                }
                if let Some(pvc) = build_pvc(self.deployment, spec, group, &member.id) {
                    let pvc_name = pvc.name_any();
                    if snapshot.pvc(&pvc_name).is_none() {
                        kube.create_pvc(self.namespace, &pvc)
                            .await
                            .context(format!("Creating volume {pvc_name}"))?;
                    }
                    member.pvc_name = Some(pvc_name);
                }

                let pod = template.build(group, member);
                match tokio::time::timeout(
                    self.ctx.config.pod_update_timeout,
                    kube.create_pod(self.namespace, &pod),
                )
                .await
                {
                    Err(_) => return Err(Error::TimeoutError(format!("creating pod {name}"))),
                    Ok(Err(e)) if e.is_conflict() => {
                        debug!(pod = %name, "Pod already exists");
                    }
                    Ok(Err(e)) => return Err(e.wrap(format!("Creating pod {name}"))),
                    Ok(Ok(pod)) => member.pod_uid = pod.uid(),
                }

                info!(group = %group, member = %member.id, pod = %name, "Member pod created");
                member.pod_name = Some(name);
                member.phase = MemberPhase::Creating;
                member.conditions.remove(ConditionType::Terminated);
                created = true;
            }
        }

        if created {
            self.handle.resources.invalidate(ResourceKind::Pod);
            self.handle
                .resources
                .invalidate(ResourceKind::PersistentVolumeClaim);
        }
        Ok(created)
    }

    /// Consult the planner. Returns true if a new plan was persisted.
    async fn plan(
        &self,
        spec: &ArangoDeploymentSpec,
        snapshot: &Snapshot,
        checksum: &str,
        status: &mut ArangoDeploymentStatus,
    ) -> Result<bool> {
        let agency = match self.handle.agency.data() {
            (Some(state), true) => Some(state),
            _ => None,
        };
        let plan = create_plan(&PlanInput {
            spec,
            status,
            snapshot,
            agency: agency.as_deref(),
        });
        if plan.is_empty() {
            return Ok(false);
        }

        let summary = plan
            .iter()
            .map(|a| match a.group {
                Some(_) => format!("{}({})", a.type_, a.member_id),
                None => a.type_.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        info!(plan = %summary, "New plan created");

        status.conditions.update_with_hash(
            ConditionType::UpToDate,
            false,
            condition_reasons::PLAN_PENDING,
            &format!("{} action(s) pending", plan.len()),
            checksum,
            self.ctx.clock.now(),
        );
        status.plan = plan;
        self.status_manager.update(status).await?;
        self.ctx
            .events
            .publish(
                &self.deployment.object_ref(&()),
                EventType::Normal,
                reasons::PLAN_CREATED,
                actions::CREATE_PLAN,
                Some(summary),
            )
            .await;
        Ok(true)
    }

    async fn clean_plan(&self, status: &mut ArangoDeploymentStatus) -> Result<()> {
        let mut annotations = Map::new();
        annotations.insert(PLAN_CLEAN_ANNOTATION.to_string(), Value::Null);
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.ctx
            .kube
            .patch_deployment(self.namespace, self.name, &patch)
            .await
            .context("Removing plan clean annotation")?;

        let dropped = status.plan.len();
        status.plan.clear();
        self.status_manager.update(status).await?;
        warn!(dropped, "Plan cleaned on request");
        self.ctx
            .events
            .publish(
                &self.deployment.object_ref(&()),
                EventType::Normal,
                reasons::PLAN_CLEANED,
                actions::EXECUTE_PLAN,
                Some(format!("{dropped} action(s) dropped")),
            )
            .await;
        Ok(())
    }

    fn record_metrics(&self, spec: &ArangoDeploymentSpec, status: &ArangoDeploymentStatus) {
        let Some(health) = &self.ctx.health_state else {
            return;
        };
        let desired: i64 = spec.groups().iter().map(|&g| i64::from(spec.count(g))).sum();
        let ready = status.members.iter().filter(|(_, m)| m.is_ready()).count();
        health.metrics.set_members(
            self.namespace,
            self.name,
            desired,
            i64::try_from(ready).unwrap_or(i64::MAX),
        );
        health
            .metrics
            .set_plan_length(self.namespace, self.name, status.plan.len());
    }
}

/// Members of a new deployment. They are created together because agents
/// cannot come up one at a time.
fn create_initial_members(
    spec: &ArangoDeploymentSpec,
    status: &mut ArangoDeploymentStatus,
    now: chrono::DateTime<chrono::Utc>,
) {
    for &group in spec.groups() {
        for _ in 0..spec.count(group) {
            let id = group.new_member_id();
            if group == ServerGroup::Agents {
                status
                    .agency
                    .get_or_insert_with(AgencyStatus::default)
                    .ids
                    .push(id.clone());
            }
            status.members.add(group, MemberStatus::new(id, now));
        }
    }
    info!(members = status.members.len(), "Initial members created");
}
