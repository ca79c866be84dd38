//! Tests for plan execution

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arango_operator::agency::SingleAgencyCache;
use arango_operator::client::ClientCache;
use arango_operator::clock::ManualClock;
use arango_operator::controller::{Error, Result, StatusManager};
use arango_operator::crd::{
    Action, ActionType, ArangoDeployment, ArangoDeploymentSpec, ArangoDeploymentStatus,
    MemberStatus, Plan, ServerGroup, Timeouts,
};
use arango_operator::events::{RecordingEventPublisher, reasons};
use arango_operator::inspector::Snapshot;
use arango_operator::members::AggregateState;
use arango_operator::reconcile::{
    ActionContext, ActionImpl, ActionOutcome, ActionRegistry, ExecutionReport, PlanExecutor,
};
use async_trait::async_trait;

use crate::common::{
    FakeCluster, FakeConnectionFactory, FakeKube, NAME, NAMESPACE, cluster_spec, deployment,
    start_time, test_config,
};

struct Harness {
    kube: Arc<FakeKube>,
    deployment: ArangoDeployment,
    spec: ArangoDeploymentSpec,
    status: ArangoDeploymentStatus,
    clients: ClientCache,
    agency: SingleAgencyCache,
    snapshot: Snapshot,
    members: AggregateState,
    clock: ManualClock,
    events: RecordingEventPublisher,
}

impl Harness {
    fn new(spec: ArangoDeploymentSpec, plan: Plan) -> Self {
        let kube = Arc::new(FakeKube::new());
        let mut status = ArangoDeploymentStatus {
            accepted_spec: Some(spec.clone()),
            plan,
            ..Default::default()
        };
        status
            .members
            .add(ServerGroup::DBServers, MemberStatus::new("PRMR-a", start_time()));
        let mut object = deployment(NAME, spec.clone());
        object.status = Some(status.clone());
        kube.insert_deployment(object.clone());

        let clients = ClientCache::new(
            Arc::new(FakeConnectionFactory {
                cluster: FakeCluster::new(),
            }),
            NAME,
            NAMESPACE,
            &test_config(),
        );
        Self {
            kube,
            deployment: object,
            spec,
            status,
            clients,
            agency: SingleAgencyCache,
            snapshot: Snapshot::default(),
            members: AggregateState::default(),
            clock: ManualClock::new(start_time()),
            events: RecordingEventPublisher::new(),
        }
    }

    async fn execute(&mut self, registry: &ActionRegistry, max_actions: usize) -> Result<ExecutionReport> {
        let status_manager = StatusManager::new(self.kube.as_ref(), NAMESPACE, NAME);
        let mut ctx = ActionContext {
            deployment: &self.deployment,
            namespace: NAMESPACE,
            name: NAME,
            spec: &self.spec,
            status: &mut self.status,
            kube: self.kube.as_ref(),
            clients: &self.clients,
            agency: &self.agency,
            snapshot: &self.snapshot,
            members: &self.members,
            clock: &self.clock,
            pod_update_timeout: Duration::from_secs(5),
        };
        PlanExecutor::new(registry, &self.events, max_actions)
            .execute(&mut ctx, &status_manager)
            .await
    }

    fn stored_plan_len(&self) -> usize {
        self.kube.status(NAMESPACE, NAME).plan.len()
    }
}

fn defaults() -> ActionRegistry {
    ActionRegistry::with_defaults(Duration::from_secs(600)).unwrap()
}

fn wait_for(id: &str) -> Action {
    Action::for_member(ActionType::WaitForMemberUp, ServerGroup::DBServers, id)
}

struct Failing(Action);

#[async_trait]
impl ActionImpl for Failing {
    async fn start(&self, _ctx: &mut ActionContext<'_>) -> Result<bool> {
        Err(Error::ActionFailed(format!("{} cannot run", self.0.id)))
    }
}

struct Flaky(Action);

#[async_trait]
impl ActionImpl for Flaky {
    async fn start(&self, _ctx: &mut ActionContext<'_>) -> Result<bool> {
        Err(Error::TransientError(format!("{} hit a busy server", self.0.id)))
    }
}

#[tokio::test]
async fn test_timeout_fires_once() {
    let mut h = Harness::new(cluster_spec(3), vec![wait_for("PRMR-a")]);
    let registry = defaults();

    let report = h.execute(&registry, 10).await.unwrap();
    assert_eq!(report.outcomes, vec![(ActionType::WaitForMemberUp, ActionOutcome::Started)]);
    assert!(report.plan_pending);
    assert_eq!(h.status.plan[0].started_at, Some(start_time()));

    // exactly at the deadline the action is still within its window
    h.clock.advance(Duration::from_secs(30 * 60));
    let report = h.execute(&registry, 10).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert!(report.plan_pending);

    h.clock.advance(Duration::from_secs(1));
    let report = h.execute(&registry, 10).await.unwrap();
    assert_eq!(report.count(ActionOutcome::TimedOut), 1);
    assert!(!report.plan_pending);
    assert_eq!(h.stored_plan_len(), 0);

    let report = h.execute(&registry, 10).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(h.events.count(reasons::ACTION_TIMEOUT), 1);
}

#[tokio::test]
async fn test_zero_timeout_never_expires() {
    let mut spec = cluster_spec(3);
    spec.timeouts = Some(Timeouts {
        actions: BTreeMap::from([("WaitForMemberUp".to_string(), 0)]),
    });
    let mut h = Harness::new(spec, vec![wait_for("PRMR-a")]);
    let registry = defaults();

    h.execute(&registry, 10).await.unwrap();
    h.clock.advance(Duration::from_secs(48 * 3600));
    let report = h.execute(&registry, 10).await.unwrap();
    assert!(report.plan_pending);
    assert_eq!(h.events.count(reasons::ACTION_TIMEOUT), 0);
}

#[tokio::test]
async fn test_add_member_start_is_idempotent() {
    let add = Action::for_member(ActionType::AddMember, ServerGroup::DBServers, "PRMR-new");
    let mut h = Harness::new(cluster_spec(3), vec![add.clone()]);
    let registry = defaults();

    let report = h.execute(&registry, 10).await.unwrap();
    assert_eq!(report.count(ActionOutcome::Finished), 1);
    assert_eq!(h.status.members.group(ServerGroup::DBServers).len(), 2);
    assert_eq!(h.events.count(reasons::MEMBER_ADDED), 1);

    // a restarted controller may replay the same persisted action
    h.status.plan = vec![add];
    h.execute(&registry, 10).await.unwrap();
    assert_eq!(h.status.members.group(ServerGroup::DBServers).len(), 2);
    assert!(h.status.plan.is_empty());
}

#[tokio::test]
async fn test_action_failed_aborts_whole_plan() {
    let mut registry = ActionRegistry::new();
    registry
        .register(ActionType::Idle, Duration::from_secs(60), |a| Box::new(Failing(a)))
        .unwrap();
    let plan = vec![
        Action::for_deployment(ActionType::Idle),
        Action::for_deployment(ActionType::Idle),
    ];
    let mut h = Harness::new(cluster_spec(3), plan);

    let report = h.execute(&registry, 10).await.unwrap();
    assert_eq!(report.count(ActionOutcome::Aborted), 1);
    assert!(!report.plan_pending);
    assert_eq!(h.stored_plan_len(), 0);
    assert_eq!(h.events.count(reasons::ACTION_ABORTED), 1);
}

#[tokio::test]
async fn test_transient_error_keeps_stored_plan() {
    let mut registry = ActionRegistry::new();
    registry
        .register(ActionType::Idle, Duration::from_secs(60), |a| Box::new(Flaky(a)))
        .unwrap();
    let mut h = Harness::new(cluster_spec(3), vec![Action::for_deployment(ActionType::Idle)]);

    let err = h.execute(&registry, 10).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.stored_plan_len(), 1);
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn test_finished_actions_are_bounded_per_tick() {
    let plan = (0..3).map(|_| Action::for_deployment(ActionType::Idle)).collect();
    let mut h = Harness::new(cluster_spec(3), plan);

    let report = h.execute(&defaults(), 2).await.unwrap();
    assert_eq!(report.count(ActionOutcome::Finished), 2);
    assert!(report.plan_pending);
    assert_eq!(h.stored_plan_len(), 1);
}

#[tokio::test]
async fn test_unknown_action_type_is_structural() {
    let mut unknown = Action::for_deployment(ActionType::Idle);
    unknown.type_ = "Teleport".to_string();
    let mut h = Harness::new(cluster_spec(3), vec![unknown]);

    let err = h.execute(&defaults(), 10).await.unwrap_err();
    assert!(err.is_structural());
    assert_eq!(h.stored_plan_len(), 1);
}
