//! Tests for individual plan actions against a scripted cluster

use std::sync::Arc;
use std::time::Duration;

use arango_operator::agency::{AgencyCache, ClusterAgencyCache, Health};
use arango_operator::client::ClientCache;
use arango_operator::clock::ManualClock;
use arango_operator::controller::{Result, StatusManager};
use arango_operator::crd::{
    Action, ActionType, ArangoDeployment, ArangoDeploymentSpec, ArangoDeploymentStatus,
    DeploymentMode, MemberPhase, MemberStatus, RestoreState, ServerGroup,
};
use arango_operator::events::{RecordingEventPublisher, reasons};
use arango_operator::inspector::Snapshot;
use arango_operator::members::{AggregateState, MemberState};
use arango_operator::reconcile::actions::RESTORE_PATH;
use arango_operator::reconcile::{
    ActionContext, ActionOutcome, ActionRegistry, ExecutionReport, PlanExecutor, Progress,
};
use chrono::SecondsFormat;
use k8s_openapi::api::core::v1::Pod;
use serde_json::{Value, json};

use crate::common::{
    CLEAN_OUT_PATH, FakeCluster, FakeConnection, FakeConnectionFactory, FakeKube, NAME, NAMESPACE,
    RESIGN_LEADERSHIP_PATH, cluster_spec, deployment, start_time, test_config,
};

const DBSERVER: &str = "PRMR-a";
const DBSERVER_POD: &str = "example-dbserver-prmr-a";
const IMAGE: &str = "arangodb/arangodb:3.12.1";

struct Harness {
    kube: Arc<FakeKube>,
    cluster: Arc<FakeCluster>,
    deployment: ArangoDeployment,
    spec: ArangoDeploymentSpec,
    status: ArangoDeploymentStatus,
    clients: ClientCache,
    agency: ClusterAgencyCache,
    snapshot: Snapshot,
    members: AggregateState,
    clock: ManualClock,
    events: RecordingEventPublisher,
    registry: ActionRegistry,
}

impl Harness {
    /// Cluster with one agent, one reachable coordinator and one dbserver
    async fn new() -> Self {
        let spec = cluster_spec(3);
        let kube = Arc::new(FakeKube::new());
        let cluster = FakeCluster::new();

        let mut status = ArangoDeploymentStatus {
            accepted_spec: Some(spec.clone()),
            ..Default::default()
        };
        status
            .members
            .add(ServerGroup::Agents, MemberStatus::new("AGNT-a", start_time()));
        status
            .members
            .add(ServerGroup::Coordinators, MemberStatus::new("CRDN-a", start_time()));
        let mut dbserver = MemberStatus::new(DBSERVER, start_time());
        dbserver.pod_name = Some(DBSERVER_POD.to_string());
        status.members.add(ServerGroup::DBServers, dbserver);

        let mut object = deployment(NAME, spec.clone());
        object.status = Some(status.clone());
        kube.insert_deployment(object.clone());

        let clients = ClientCache::new(
            Arc::new(FakeConnectionFactory {
                cluster: cluster.clone(),
            }),
            NAME,
            NAMESPACE,
            &test_config(),
        );

        let agency = ClusterAgencyCache::new(Duration::from_secs(1));
        agency
            .agents()
            .insert("AGNT-a", FakeConnection::new("http://AGNT-a", cluster.clone()));
        cluster.set_leader("AGNT-a", &["AGNT-a".to_string()], 1);
        agency.reload().await.unwrap();

        let members = AggregateState::new(
            DeploymentMode::Cluster,
            vec![MemberState {
                id: "CRDN-a".to_string(),
                group: ServerGroup::Coordinators,
                phase: MemberPhase::Ready,
                pod_name: None,
                pod_ready: true,
                reachable: true,
                restart_pending: false,
                pvc_resize_pending: false,
            }],
            Some("AGNT-a".to_string()),
            Health::default(),
        );

        Self {
            kube,
            cluster,
            deployment: object,
            spec,
            status,
            clients,
            agency,
            snapshot: Snapshot::default(),
            members,
            clock: ManualClock::new(start_time()),
            events: RecordingEventPublisher::new(),
            registry: ActionRegistry::with_defaults(Duration::from_secs(600)).unwrap(),
        }
    }

    /// Publish a new `/arango/Target` and reload the agency cache
    async fn set_target(&self, target: Value) {
        self.cluster
            .set_tree(json!({ "Supervision": { "Health": {} }, "Target": target }));
        self.cluster.set_commit_index(self.cluster.commit_index() + 1);
        self.agency.reload().await.unwrap();
    }

    fn ctx(&mut self) -> ActionContext<'_> {
        ActionContext {
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
        }
    }

    async fn start(&mut self, action: &Action) -> Result<bool> {
        let action_impl = self.registry.build(action).unwrap();
        let mut ctx = self.ctx();
        action_impl.start(&mut ctx).await
    }

    async fn check_progress(&mut self, action: &Action) -> Result<Progress> {
        let action_impl = self.registry.build(action).unwrap();
        let mut ctx = self.ctx();
        action_impl.check_progress(&mut ctx).await
    }

    async fn execute(&mut self) -> Result<ExecutionReport> {
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
        PlanExecutor::new(&self.registry, &self.events, 10)
            .execute(&mut ctx, &status_manager)
            .await
    }

    fn dbserver(&self) -> &MemberStatus {
        self.status.members.get(ServerGroup::DBServers, DBSERVER).unwrap()
    }

    fn dbserver_mut(&mut self) -> &mut MemberStatus {
        self.status
            .members
            .get_mut(ServerGroup::DBServers, DBSERVER)
            .unwrap()
    }
}

fn clean_out() -> Action {
    Action::for_member(ActionType::CleanOutMember, ServerGroup::DBServers, DBSERVER)
}

fn image_update() -> Action {
    Action::for_member(
        ActionType::RuntimeContainerImageUpdate,
        ServerGroup::DBServers,
        DBSERVER,
    )
    .with_param("image", IMAGE)
}

fn timestamp(seconds_ago: i64) -> String {
    (start_time() - chrono::Duration::seconds(seconds_ago)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Dbserver pod whose server container reports `image` in the given state
fn server_pod(image: &str, state: Value, last_state: Value, ready: bool) -> Pod {
    serde_json::from_value(json!({
        "metadata": { "name": DBSERVER_POD, "namespace": NAMESPACE },
        "spec": {
            "restartPolicy": "Always",
            "containers": [{ "name": "server", "image": image }],
        },
        "status": {
            "conditions": [{ "type": "Ready", "status": if ready { "True" } else { "False" } }],
            "containerStatuses": [{
                "name": "server",
                "image": image,
                "imageID": "",
                "ready": ready,
                "restartCount": 1,
                "state": state,
                "lastState": last_state,
            }],
        },
    }))
    .unwrap()
}

// =============================================================================
// RuntimeContainerImageUpdate
// =============================================================================

#[tokio::test]
async fn test_image_update_finishes_when_image_already_set() {
    let mut h = Harness::new().await;
    let crashed = json!({ "terminated": { "exitCode": 1, "reason": "Error" } });
    h.snapshot = Snapshot::default().with_pods(vec![server_pod(IMAGE, crashed, json!({}), false)]);

    // a repeated start is still finished, not left waiting on the pod
    assert!(h.start(&image_update()).await.unwrap());
    assert!(h.start(&image_update()).await.unwrap());
}

#[tokio::test]
async fn test_image_update_aborts_on_terminated_container() {
    let mut h = Harness::new().await;
    let crashed = json!({ "terminated": { "exitCode": 1, "reason": "Error" } });
    h.snapshot = Snapshot::default().with_pods(vec![server_pod(IMAGE, crashed, json!({}), false)]);

    assert_eq!(h.check_progress(&image_update()).await.unwrap(), Progress::abort());
}

#[tokio::test]
async fn test_image_update_tolerates_short_crash_loop() {
    let mut h = Harness::new().await;
    let waiting = json!({ "waiting": { "reason": "CrashLoopBackOff" } });

    let recent = json!({ "terminated": { "exitCode": 1, "finishedAt": timestamp(5) } });
    h.snapshot =
        Snapshot::default().with_pods(vec![server_pod(IMAGE, waiting.clone(), recent, false)]);
    assert_eq!(h.check_progress(&image_update()).await.unwrap(), Progress::pending());

    let old = json!({ "terminated": { "exitCode": 1, "finishedAt": timestamp(30) } });
    h.snapshot = Snapshot::default().with_pods(vec![server_pod(IMAGE, waiting, old, false)]);
    assert_eq!(h.check_progress(&image_update()).await.unwrap(), Progress::abort());
}

#[tokio::test]
async fn test_image_update_ready_once_pod_is_ready() {
    let mut h = Harness::new().await;
    let running = json!({ "running": { "startedAt": timestamp(1) } });

    h.snapshot =
        Snapshot::default().with_pods(vec![server_pod(IMAGE, running.clone(), json!({}), false)]);
    assert_eq!(h.check_progress(&image_update()).await.unwrap(), Progress::pending());

    h.snapshot = Snapshot::default().with_pods(vec![server_pod(IMAGE, running, json!({}), true)]);
    assert_eq!(h.check_progress(&image_update()).await.unwrap(), Progress::ready());
}

// =============================================================================
// Agency jobs
// =============================================================================

#[tokio::test]
async fn test_failed_clean_out_is_reissued_after_replan() {
    let mut h = Harness::new().await;
    h.set_target(json!({ "Failed": { "7": {} } })).await;
    h.dbserver_mut().job_id = Some("7".to_string());
    let mut started = clean_out();
    started.started_at = Some(start_time());
    h.status.plan = vec![started];

    let report = h.execute().await.unwrap();
    assert_eq!(report.count(ActionOutcome::Aborted), 1);
    assert!(h.status.plan.is_empty());
    let stored = h.kube.status(NAMESPACE, NAME);
    let member = stored.members.get(ServerGroup::DBServers, DBSERVER).unwrap();
    assert_eq!(member.job_id, None);

    h.status.plan = vec![clean_out()];
    let report = h.execute().await.unwrap();
    assert_eq!(report.outcomes, vec![(ActionType::CleanOutMember, ActionOutcome::Started)]);
    assert_eq!(h.cluster.request_count(CLEAN_OUT_PATH), 1);
    assert_eq!(h.dbserver().job_id.as_deref(), Some("job-1"));
    assert_eq!(h.dbserver().phase, MemberPhase::Drain);
}

#[tokio::test]
async fn test_clean_out_forgets_stale_job() {
    let mut h = Harness::new().await;
    h.set_target(json!({ "Failed": { "7": {} } })).await;
    h.dbserver_mut().job_id = Some("7".to_string());

    assert!(!h.start(&clean_out()).await.unwrap());
    assert_eq!(h.cluster.request_count(CLEAN_OUT_PATH), 1);
    assert_eq!(h.dbserver().job_id.as_deref(), Some("job-1"));
}

#[tokio::test]
async fn test_clean_out_resumes_pending_job() {
    let mut h = Harness::new().await;
    h.set_target(json!({ "Pending": { "7": {} } })).await;
    h.dbserver_mut().job_id = Some("7".to_string());

    assert!(!h.start(&clean_out()).await.unwrap());
    assert_eq!(h.cluster.request_count(CLEAN_OUT_PATH), 0);
    assert_eq!(h.dbserver().job_id.as_deref(), Some("7"));
}

#[tokio::test]
async fn test_clean_out_of_cleaned_server_is_done() {
    let mut h = Harness::new().await;
    h.set_target(json!({ "CleanedServers": [DBSERVER] })).await;

    assert!(h.start(&clean_out()).await.unwrap());
    assert_eq!(h.cluster.request_count(CLEAN_OUT_PATH), 0);
}

#[tokio::test]
async fn test_resign_leadership_reissues_unknown_job() {
    let mut h = Harness::new().await;
    h.dbserver_mut().job_id = Some("gone".to_string());
    let action = Action::for_member(ActionType::ResignLeadership, ServerGroup::DBServers, DBSERVER);

    assert!(!h.start(&action).await.unwrap());
    assert_eq!(h.cluster.request_count(RESIGN_LEADERSHIP_PATH), 1);
    assert_eq!(h.dbserver().job_id.as_deref(), Some("job-1"));

    h.set_target(json!({ "Finished": { "job-1": {} } })).await;
    assert_eq!(h.check_progress(&action).await.unwrap(), Progress::ready());
}

// =============================================================================
// Deployment wide actions
// =============================================================================

#[tokio::test]
async fn test_transient_restore_failure_keeps_plan() {
    let mut h = Harness::new().await;
    h.status.plan =
        vec![Action::for_deployment(ActionType::BackupRestore).with_param("backup", "nightly")];
    h.cluster.fail_path(RESTORE_PATH, Some(503));

    assert!(h.execute().await.is_err());
    assert!(h.status.restore.is_none());
    assert_eq!(h.status.plan.len(), 1);
    assert!(h.kube.status(NAMESPACE, NAME).restore.is_none());

    h.cluster.fail_path(RESTORE_PATH, None);
    let report = h.execute().await.unwrap();
    assert_eq!(report.count(ActionOutcome::Finished), 1);
    let restore = h.status.restore.clone().unwrap();
    assert_eq!(restore.backup, "nightly");
    assert_eq!(restore.state, RestoreState::Restored);
    assert_eq!(h.events.count(reasons::RESTORE_COMPLETED), 1);
}

#[tokio::test]
async fn test_rejected_restore_is_recorded() {
    let mut h = Harness::new().await;
    h.status.plan =
        vec![Action::for_deployment(ActionType::BackupRestore).with_param("backup", "missing")];
    h.cluster.fail_path(RESTORE_PATH, Some(404));

    let report = h.execute().await.unwrap();
    assert_eq!(report.count(ActionOutcome::Finished), 1);
    let restore = h.kube.status(NAMESPACE, NAME).restore.unwrap();
    assert_eq!(restore.state, RestoreState::Failed);
    assert!(restore.message.is_some());
    assert_eq!(h.events.count(reasons::RESTORE_FAILED), 1);
}

#[tokio::test]
async fn test_cluster_scaling_toggle() {
    let mut h = Harness::new().await;
    let disable = Action::for_deployment(ActionType::DisableClusterScaling);
    let enable = Action::for_deployment(ActionType::EnableClusterScaling);

    assert!(h.start(&disable).await.unwrap());
    assert!(h.status.scaling_disabled);
    assert!(h.start(&disable).await.unwrap());
    assert!(h.status.scaling_disabled);

    assert!(h.start(&enable).await.unwrap());
    assert!(!h.status.scaling_disabled);
}
