//! Tests for plan creation rules

use arango_operator::agency::AgencyState;
use arango_operator::crd::{
    ActionType, ArangoDeploymentSpec, ArangoDeploymentStatus, ConditionType, DatabaseSpec,
    MemberPhase, MemberStatus, Plan, ServerGroup,
};
use arango_operator::inspector::Snapshot;
use arango_operator::reconcile::{PlanInput, create_plan};
use serde_json::json;

use crate::common::{cluster_spec, start_time};

const IMAGE: &str = "arangodb/arangodb:3.11.8";

fn ready(id: &str) -> MemberStatus {
    let mut member = MemberStatus::new(id, start_time());
    member.phase = MemberPhase::Ready;
    member.image = Some(IMAGE.to_string());
    member
        .conditions
        .update(ConditionType::Ready, true, "Pod Ready", "", start_time());
    member
}

/// Status in which every member of `spec` runs and bootstrap is done
fn converged(spec: &ArangoDeploymentSpec) -> ArangoDeploymentStatus {
    let mut status = ArangoDeploymentStatus {
        current_image: Some(IMAGE.to_string()),
        ..Default::default()
    };
    for &group in spec.groups() {
        let prefix = group.as_role_abbreviated().to_uppercase();
        for i in 0..spec.count(group) {
            status.members.add(group, ready(&format!("{prefix}-{i}")));
        }
    }
    status
        .conditions
        .update(ConditionType::BootstrapCompleted, true, "Bootstrap Completed", "", start_time());
    status
}

fn plan(spec: &ArangoDeploymentSpec, status: &ArangoDeploymentStatus) -> Plan {
    plan_with_agency(spec, status, None)
}

fn plan_with_agency(
    spec: &ArangoDeploymentSpec,
    status: &ArangoDeploymentStatus,
    agency: Option<&AgencyState>,
) -> Plan {
    create_plan(&PlanInput {
        spec,
        status,
        snapshot: &Snapshot::default(),
        agency,
    })
}

fn types(plan: &Plan) -> Vec<ActionType> {
    plan.iter().map(|a| a.action_type().unwrap()).collect()
}

fn member_mut<'a>(status: &'a mut ArangoDeploymentStatus, group: ServerGroup, id: &str) -> &'a mut MemberStatus {
    status.members.get_mut(group, id).unwrap()
}

#[test]
fn test_converged_deployment_needs_no_plan() {
    let spec = cluster_spec(3);
    assert!(plan(&spec, &converged(&spec)).is_empty());
}

#[test]
fn test_scale_up_adds_one_member() {
    let spec = cluster_spec(5);
    let status = converged(&cluster_spec(3));

    let plan = plan(&spec, &status);
    assert_eq!(types(&plan), vec![ActionType::AddMember, ActionType::WaitForMemberUp]);
    assert_eq!(plan[0].group, Some(ServerGroup::DBServers));
    assert!(plan[0].member_id.starts_with("PRMR-"));
    assert_eq!(plan[0].member_id, plan[1].member_id);
}

#[test]
fn test_scale_down_prefers_member_that_is_not_ready() {
    let spec = cluster_spec(2);
    let mut status = converged(&cluster_spec(3));
    member_mut(&mut status, ServerGroup::DBServers, "PRMR-1")
        .conditions
        .update(ConditionType::Ready, false, "Pod Not Ready", "", start_time());

    let plan = plan(&spec, &status);
    assert_eq!(types(&plan), vec![ActionType::MarkToRemoveMember]);
    assert_eq!(plan[0].member_id, "PRMR-1");
}

#[test]
fn test_marked_dbserver_is_cleaned_out_before_removal() {
    let spec = cluster_spec(2);
    let mut status = converged(&cluster_spec(3));
    member_mut(&mut status, ServerGroup::DBServers, "PRMR-2")
        .conditions
        .update(ConditionType::MarkedToRemove, true, "Scale Down", "", start_time());

    let plan = plan(&spec, &status);
    assert_eq!(
        types(&plan),
        vec![
            ActionType::CleanOutMember,
            ActionType::ShutdownMember,
            ActionType::RemoveMember
        ]
    );
    assert!(plan.iter().all(|a| a.member_id == "PRMR-2"));
}

#[test]
fn test_disabled_scaling_keeps_member_counts() {
    let mut status = converged(&cluster_spec(3));
    status.scaling_disabled = true;
    assert!(plan(&cluster_spec(5), &status).is_empty());
    assert!(plan(&cluster_spec(2), &status).is_empty());

    // a member marked before scaling was paused is still removed
    member_mut(&mut status, ServerGroup::DBServers, "PRMR-2")
        .conditions
        .update(ConditionType::MarkedToRemove, true, "Scale Down", "", start_time());
    assert_eq!(
        types(&plan(&cluster_spec(2), &status)),
        vec![
            ActionType::CleanOutMember,
            ActionType::ShutdownMember,
            ActionType::RemoveMember
        ]
    );
}

#[test]
fn test_failed_dbserver_is_replaced() {
    let spec = cluster_spec(3);
    let mut status = converged(&spec);
    member_mut(&mut status, ServerGroup::DBServers, "PRMR-0").phase = MemberPhase::Failed;

    let plan = plan(&spec, &status);
    assert_eq!(
        types(&plan),
        vec![
            ActionType::RemoveMember,
            ActionType::AddMember,
            ActionType::WaitForMemberUp
        ]
    );
    assert_eq!(plan[0].member_id, "PRMR-0");
    assert_ne!(plan[1].member_id, "PRMR-0");
    assert_eq!(plan[1].member_id, plan[2].member_id);
}

#[test]
fn test_failed_agent_is_recreated_in_place() {
    let spec = cluster_spec(3);
    let mut status = converged(&spec);
    member_mut(&mut status, ServerGroup::Agents, "AGNT-1").phase = MemberPhase::Failed;

    let plan = plan(&spec, &status);
    assert_eq!(types(&plan), vec![ActionType::RecreateMember, ActionType::WaitForMemberUp]);
    assert!(plan.iter().all(|a| a.member_id == "AGNT-1"));
}

#[test]
fn test_failed_member_outranks_scaling() {
    let spec = cluster_spec(4);
    let mut status = converged(&cluster_spec(3));
    member_mut(&mut status, ServerGroup::Coordinators, "CRDN-0").phase = MemberPhase::Failed;

    let plan = plan(&spec, &status);
    assert_eq!(plan[0].action_type().unwrap(), ActionType::RemoveMember);
    assert_eq!(plan[0].group, Some(ServerGroup::Coordinators));
}

#[test]
fn test_restart_resigns_leadership_first() {
    let spec = cluster_spec(3);
    let mut status = converged(&spec);
    member_mut(&mut status, ServerGroup::DBServers, "PRMR-1")
        .conditions
        .update(ConditionType::Restart, true, "Restart Requested", "", start_time());

    let plan = plan(&spec, &status);
    assert_eq!(
        types(&plan),
        vec![
            ActionType::ResignLeadership,
            ActionType::RotateMember,
            ActionType::WaitForMemberUp
        ]
    );
}

#[test]
fn test_restart_with_maintenance_wraps_rotation() {
    let mut spec = cluster_spec(3);
    spec.database = Some(DatabaseSpec {
        maintenance: Some(true),
    });
    let mut status = converged(&spec);
    member_mut(&mut status, ServerGroup::DBServers, "PRMR-1")
        .conditions
        .update(ConditionType::PendingRestart, true, "Rotation", "", start_time());

    let plan = plan(&spec, &status);
    assert_eq!(
        types(&plan),
        vec![
            ActionType::EnableMaintenance,
            ActionType::RotateMember,
            ActionType::WaitForMemberUp,
            ActionType::DisableMaintenance
        ]
    );
}

#[test]
fn test_patch_release_updates_image_in_place() {
    let mut spec = cluster_spec(3);
    let status = converged(&spec);
    spec.image = Some("arangodb/arangodb:3.11.9".to_string());

    let plan = plan(&spec, &status);
    assert_eq!(types(&plan), vec![ActionType::RuntimeContainerImageUpdate]);
    assert_eq!(plan[0].param("image"), Some("arangodb/arangodb:3.11.9"));
    // members are visited in group order
    assert_eq!(plan[0].group, Some(ServerGroup::Agents));
}

#[test]
fn test_minor_version_change_upgrades_member() {
    let mut spec = cluster_spec(3);
    let status = converged(&spec);
    spec.image = Some("arangodb/arangodb:3.12.0".to_string());

    let plan = plan(&spec, &status);
    assert_eq!(types(&plan), vec![ActionType::UpgradeMember, ActionType::WaitForMemberUp]);
}

#[test]
fn test_image_change_waits_for_ready_members() {
    let mut spec = cluster_spec(3);
    let mut status = converged(&spec);
    spec.image = Some("arangodb/arangodb:3.11.9".to_string());
    member_mut(&mut status, ServerGroup::Coordinators, "CRDN-2").phase = MemberPhase::Creating;

    assert!(plan(&spec, &status).is_empty());
}

#[test]
fn test_current_image_recorded_after_rollout() {
    let spec = cluster_spec(3);
    let mut status = converged(&spec);
    status.current_image = None;

    let plan = plan(&spec, &status);
    assert_eq!(types(&plan), vec![ActionType::SetCurrentImage]);
    assert_eq!(plan[0].param("image"), Some(IMAGE));
}

#[test]
fn test_bootstrap_once_all_members_ready() {
    let spec = cluster_spec(3);
    let mut status = converged(&spec);
    status.conditions.remove(ConditionType::BootstrapCompleted);
    assert_eq!(types(&plan(&spec, &status)), vec![ActionType::BootstrapUpdate]);

    member_mut(&mut status, ServerGroup::Agents, "AGNT-0").phase = MemberPhase::Creating;
    assert!(plan(&spec, &status).is_empty());
}

#[test]
fn test_agency_maintenance_is_mirrored() {
    let spec = cluster_spec(3);
    let status = converged(&spec);
    let agency = AgencyState::from_read_result(vec![json!({
        "arango": { "Supervision": { "Maintenance": "2024-01-01T00:00:00Z" }, "Target": {} }
    })])
    .unwrap();

    let plan = plan_with_agency(&spec, &status, Some(&agency));
    assert_eq!(types(&plan), vec![ActionType::SetMaintenanceCondition]);

    // without valid agency data the rule stays silent
    assert!(plan_with_agency(&spec, &status, None).is_empty());
}

#[test]
fn test_restore_requested_backup() {
    let mut spec = cluster_spec(3);
    spec.restore_from = Some("nightly".to_string());
    let status = converged(&spec);

    let plan = plan(&spec, &status);
    assert_eq!(types(&plan), vec![ActionType::BackupRestore]);
    assert_eq!(plan[0].param("backup"), Some("nightly"));
}
