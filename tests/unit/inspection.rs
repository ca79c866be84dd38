//! End to end inspection ticks against an in-memory cluster

use std::collections::BTreeMap;
use std::time::Duration;

use arango_operator::controller::{MAINTENANCE_ANNOTATION, PLAN_CLEAN_ANNOTATION};
use arango_operator::crd::{
    Action, ActionType, ConditionType, MemberPhase, ServerGroup, StorageEngine,
};
use arango_operator::events::reasons;
use kube::ResourceExt;

use crate::common::{
    NAMESPACE, TestEnv, cluster_deployment, jwt_secret, single_deployment, start_time, test_config,
};

fn annotate(env: &TestEnv, key: &str) {
    let mut deployment = env.deployment();
    deployment
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), "true".to_string());
    env.kube.insert_deployment(deployment);
}

#[tokio::test]
async fn test_new_cluster_settles() {
    let env = TestEnv::new(cluster_deployment("example"));

    // first tick only writes the defaults back
    let interval = env.tick().await.unwrap().unwrap();
    assert_eq!(interval.duration(), test_config().min_inspection_interval);
    assert!(env.status().accepted_spec.is_none());
    assert_eq!(env.deployment().spec.count(ServerGroup::DBServers), 3);

    env.settle(30).await;

    let status = env.status();
    assert_eq!(status.members.len(), 9);
    assert!(status.members.iter().all(|(_, m)| m.phase == MemberPhase::Ready));
    assert_eq!(env.kube.pods(NAMESPACE).len(), 9);
    assert_eq!(status.current_image.as_deref(), Some("arangodb/arangodb:3.11.8"));
    assert_eq!(status.agency.as_ref().unwrap().ids.len(), 3);
    assert!(status.conditions.is_true(ConditionType::SpecAccepted));
    assert!(status.conditions.is_true(ConditionType::Reachable));
    assert!(status.conditions.is_true(ConditionType::BootstrapCompleted));
    assert!(status.secret_hashes.unwrap().auth_jwt.is_some());
    assert_eq!(env.events.count(reasons::SPEC_ACCEPTED), 1);
}

#[tokio::test]
async fn test_single_server_settles() {
    let env = TestEnv::new(single_deployment("example"));
    env.settle(30).await;

    let status = env.status();
    assert_eq!(status.members.len(), 1);
    assert_eq!(status.members.group(ServerGroup::Single).len(), 1);
    assert!(status.agency.is_none());
    assert_eq!(env.kube.pvc_names(NAMESPACE).len(), 1);
}

#[tokio::test]
async fn test_settled_cluster_stays_quiet() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.settle(30).await;

    let writes = env.kube.status_writes();
    let interval = env.tick().await.unwrap().unwrap();
    assert_eq!(env.kube.status_writes(), writes);
    assert_eq!(interval.duration(), test_config().max_inspection_interval);
}

#[tokio::test]
async fn test_scale_up_adds_one_dbserver() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.settle(30).await;

    let mut deployment = env.deployment();
    if let Some(dbservers) = deployment.spec.dbservers.as_mut() {
        dbservers.count = Some(4);
    }
    env.kube.insert_deployment(deployment);
    env.settle(30).await;

    let status = env.status();
    let dbservers = status.members.group(ServerGroup::DBServers);
    assert_eq!(dbservers.len(), 4);
    assert!(dbservers.iter().all(|m| m.phase == MemberPhase::Ready));
    assert_eq!(env.kube.pods(NAMESPACE).len(), 10);
    assert_eq!(env.events.count(reasons::MEMBER_ADDED), 1);
    assert_eq!(env.events.count(reasons::SPEC_ACCEPTED), 2);
}

#[tokio::test]
async fn test_immutable_field_is_reverted() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.settle(30).await;
    let accepted_version = env.status().accepted_spec_version;
    let up_to_date = env
        .status()
        .conditions
        .get(ConditionType::UpToDate)
        .cloned()
        .unwrap();
    assert!(up_to_date.is_true());
    // any flip from here on would carry a later transition time
    env.clock.advance(Duration::from_secs(60));
    let written = env.kube.status_history().len();

    let mut deployment = env.deployment();
    deployment.spec.storage_engine = Some(StorageEngine::MMFiles);
    env.kube.insert_deployment(deployment);

    env.tick().await.unwrap();
    assert_eq!(env.deployment().spec.storage_engine, Some(StorageEngine::RocksDB));
    assert_eq!(env.events.count(reasons::IMMUTABLE_FIELD_RESET), 1);

    // the reverted spec matches the accepted version again
    env.tick().await.unwrap();
    assert_eq!(env.status().accepted_spec_version, accepted_version);
    assert_eq!(env.events.count(reasons::IMMUTABLE_FIELD_RESET), 1);
    assert_eq!(env.events.count(reasons::SPEC_ACCEPTED), 1);

    // UpToDate never dropped and came back across the revert
    for status in &env.kube.status_history()[written..] {
        let condition = status.conditions.get(ConditionType::UpToDate).unwrap();
        assert!(condition.is_true());
        assert_eq!(condition.last_transition_time, up_to_date.last_transition_time);
    }
    let condition = env.status().conditions.get(ConditionType::UpToDate).cloned().unwrap();
    assert!(condition.is_true());
    assert_eq!(condition.last_transition_time, up_to_date.last_transition_time);
}

#[tokio::test]
async fn test_condition_times_follow_controller_clock() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.settle(30).await;
    let status = env.status();
    let up_to_date = status.conditions.get(ConditionType::UpToDate).unwrap();
    assert_eq!(up_to_date.last_transition_time, start_time());

    env.clock.advance(Duration::from_secs(300));
    let mut deployment = env.deployment();
    if let Some(dbservers) = deployment.spec.dbservers.as_mut() {
        dbservers.count = Some(4);
    }
    env.kube.insert_deployment(deployment);
    env.settle(30).await;

    let later = start_time() + chrono::Duration::seconds(300);
    let status = env.status();
    let up_to_date = status.conditions.get(ConditionType::UpToDate).unwrap();
    assert_eq!(up_to_date.last_transition_time, later);
    let added = status
        .members
        .group(ServerGroup::DBServers)
        .iter()
        .max_by_key(|m| m.created_at)
        .unwrap();
    assert_eq!(added.created_at, Some(later));
    let ready = added.conditions.get(ConditionType::Ready).unwrap();
    assert_eq!(ready.last_transition_time, later);
}

#[tokio::test]
async fn test_invalid_change_keeps_accepted_spec() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.settle(30).await;
    let accepted = env.status().accepted_spec;

    let mut deployment = env.deployment();
    if let Some(agents) = deployment.spec.agents.as_mut() {
        agents.count = Some(5);
    }
    env.kube.insert_deployment(deployment);

    env.tick().await.unwrap();
    assert_eq!(env.events.count(reasons::SPEC_INVALID), 1);
    let status = env.status();
    assert_eq!(status.accepted_spec, accepted);
    assert!(!status.conditions.is_true(ConditionType::SpecAccepted));
    assert_eq!(status.members.group(ServerGroup::Agents).len(), 3);
}

#[tokio::test]
async fn test_changed_secret_stops_inspection() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.settle(30).await;

    env.kube
        .insert_secret(NAMESPACE, jwt_secret("example-jwt", "rotated"));
    let err = env.tick().await.unwrap_err();
    assert!(err.to_string().contains("jwt"));
    assert!(env.status().conditions.is_true(ConditionType::SecretsChanged));
    assert_eq!(env.events.count(reasons::SECRETS_CHANGED), 1);

    // the condition is already raised, so no second event
    assert!(env.tick().await.is_err());
    assert_eq!(env.events.count(reasons::SECRETS_CHANGED), 1);

    env.kube
        .insert_secret(NAMESPACE, jwt_secret("example-jwt", "s3cr3t"));
    env.tick().await.unwrap();
    let status = env.status();
    assert!(status.conditions.get(ConditionType::SecretsChanged).is_some());
    assert!(!status.conditions.is_true(ConditionType::SecretsChanged));
}

#[tokio::test]
async fn test_maintenance_annotation_skips_tick() {
    let env = TestEnv::new(cluster_deployment("example"));
    annotate(&env, MAINTENANCE_ANNOTATION);

    let interval = env.tick().await.unwrap().unwrap();
    assert_eq!(interval.duration(), test_config().max_inspection_interval);
    assert_eq!(env.kube.status_writes(), 0);
    assert!(env.deployment().spec.image.is_some());
    assert!(env.deployment().spec.agents.is_none());
}

#[tokio::test]
async fn test_plan_clean_annotation_drops_plan() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.settle(30).await;

    let mut status = env.status();
    status.plan = vec![
        Action::for_member(ActionType::RotateMember, ServerGroup::DBServers, "PRMR-x"),
        Action::for_member(ActionType::WaitForMemberUp, ServerGroup::DBServers, "PRMR-x"),
    ];
    env.kube.set_status(NAMESPACE, "example", status);
    annotate(&env, PLAN_CLEAN_ANNOTATION);

    env.tick().await.unwrap();
    assert!(env.status().plan.is_empty());
    assert!(!env.deployment().annotations().contains_key(PLAN_CLEAN_ANNOTATION));
    assert_eq!(env.events.count(reasons::PLAN_CLEANED), 1);
    assert!(env.kube.deleted_pods().is_empty());
}

#[tokio::test]
async fn test_lost_pod_is_replaced() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.settle(30).await;

    let lost = env.status().members.group(ServerGroup::DBServers)[0].clone();
    env.kube
        .evict_pod(NAMESPACE, lost.pod_name.as_deref().unwrap());
    env.settle(40).await;

    let status = env.status();
    let dbservers = status.members.group(ServerGroup::DBServers);
    assert_eq!(dbservers.len(), 3);
    assert!(dbservers.iter().all(|m| m.id != lost.id));
    assert!(dbservers.iter().all(|m| m.phase == MemberPhase::Ready));
    assert_eq!(env.events.count(reasons::MEMBER_REMOVED), 1);
    assert_eq!(env.events.count(reasons::MEMBER_ADDED), 1);
}

#[tokio::test]
async fn test_deleted_deployment_is_forgotten() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.tick().await.unwrap();
    env.tick().await.unwrap();
    assert!(env.ctx.existing_handle(NAMESPACE, "example").is_some());

    env.kube.remove_deployment(NAMESPACE, "example");
    assert!(env.tick().await.unwrap().is_none());
    assert!(env.ctx.existing_handle(NAMESPACE, "example").is_none());
}

#[tokio::test]
async fn test_failed_status_write_surfaces_error() {
    let env = TestEnv::new(cluster_deployment("example"));
    env.tick().await.unwrap();

    env.kube.fail_status_writes(true);
    assert!(env.tick().await.is_err());
    assert!(env.status().accepted_spec.is_none());

    env.kube.fail_status_writes(false);
    env.settle(30).await;
}
