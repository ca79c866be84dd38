//! Plan creation
//!
//! The planner is a pure function of the accepted spec, the status, the
//! resource snapshot and the agency tree. It is only consulted when the
//! persisted plan is empty. Rules are tried in priority order and the first
//! one that produces actions wins, so one plan always addresses one concern.

use tracing::debug;

use crate::agency::AgencyState;
use crate::crd::{
    Action, ActionType, ArangoDeploymentSpec, ArangoDeploymentStatus, ConditionType,
    DeploymentMode, MemberPhase, MemberStatus, Plan, ServerGroup,
};
use crate::inspector::Snapshot;
use crate::resources::pvc::{parse_quantity, requested_size};

/// Everything the planner looks at
pub struct PlanInput<'a> {
    /// Accepted spec
    pub spec: &'a ArangoDeploymentSpec,
    pub status: &'a ArangoDeploymentStatus,
    pub snapshot: &'a Snapshot,
    /// Agency tree, `None` unless the cached data is valid
    pub agency: Option<&'a AgencyState>,
}

type Rule = fn(&PlanInput<'_>) -> Plan;

const RULES: [(&str, Rule); 10] = [
    ("restore", restore),
    ("failed members", replace_failed),
    ("removal", remove_marked),
    ("restart", restart),
    ("scale", scale),
    ("image", image),
    ("volume", resize_volumes),
    ("bootstrap", bootstrap),
    ("maintenance", maintenance),
    ("topology", topology),
];

/// Build the next plan, or an empty plan if nothing needs to change
pub fn create_plan(input: &PlanInput<'_>) -> Plan {
    for (name, rule) in RULES {
        let plan = rule(input);
        if !plan.is_empty() {
            debug!(rule = name, actions = plan.len(), "Plan created");
            return plan;
        }
    }
    Plan::new()
}

/// Members of the spec's groups in group order, lowest ID first
fn members<'a>(input: &'a PlanInput<'_>) -> impl Iterator<Item = (ServerGroup, &'a MemberStatus)> + 'a {
    input.spec.groups().iter().flat_map(move |&group| {
        let mut members: Vec<&MemberStatus> = input.status.members.group(group).iter().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members.into_iter().map(move |m| (group, m))
    })
}

fn all_ready(input: &PlanInput<'_>) -> bool {
    let mut members = members(input).peekable();
    members.peek().is_some() && members.all(|(_, m)| m.is_ready())
}

fn restore(input: &PlanInput<'_>) -> Plan {
    match (&input.spec.restore_from, &input.status.restore) {
        (Some(backup), restore) if restore.as_ref().is_none_or(|r| &r.backup != backup) => {
            vec![
                Action::for_deployment(ActionType::BackupRestore)
                    .with_param("backup", backup.as_str())
                    .with_reason("restore requested"),
            ]
        }
        (None, Some(_)) => vec![Action::for_deployment(ActionType::BackupRestoreClean)],
        _ => Plan::new(),
    }
}

fn replace_failed(input: &PlanInput<'_>) -> Plan {
    let Some((group, member)) = members(input).find(|(_, m)| m.phase == MemberPhase::Failed)
    else {
        return Plan::new();
    };
    let reason = "member failed";

    if member.is_marked_to_remove() {
        return vec![Action::for_member(ActionType::RemoveMember, group, &member.id).with_reason(reason)];
    }
    match group {
        ServerGroup::Agents | ServerGroup::Single => vec![
            Action::for_member(ActionType::RecreateMember, group, &member.id).with_reason(reason),
            Action::for_member(ActionType::WaitForMemberUp, group, &member.id),
        ],
        ServerGroup::DBServers | ServerGroup::Coordinators => {
            let new_id = group.new_member_id();
            vec![
                Action::for_member(ActionType::RemoveMember, group, &member.id).with_reason(reason),
                Action::for_member(ActionType::AddMember, group, &new_id)
                    .with_reason(format!("replaces {}", member.id)),
                Action::for_member(ActionType::WaitForMemberUp, group, &new_id),
            ]
        }
    }
}

fn remove_marked(input: &PlanInput<'_>) -> Plan {
    let Some((group, member)) = members(input).find(|(_, m)| m.is_marked_to_remove()) else {
        return Plan::new();
    };
    let id = member.id.as_str();
    let mut plan = Plan::new();
    if group == ServerGroup::DBServers && input.spec.mode() == DeploymentMode::Cluster {
        plan.push(Action::for_member(ActionType::CleanOutMember, group, id).with_reason("scale down"));
    }
    plan.push(Action::for_member(ActionType::ShutdownMember, group, id));
    plan.push(Action::for_member(ActionType::RemoveMember, group, id));
    plan
}

fn restart(input: &PlanInput<'_>) -> Plan {
    let Some((group, member)) = members(input).find(|(_, m)| {
        m.conditions.is_true(ConditionType::Restart) || m.conditions.is_true(ConditionType::PendingRestart)
    }) else {
        return Plan::new();
    };
    let id = member.id.as_str();
    let rotate = Action::for_member(ActionType::RotateMember, group, id).with_reason("restart requested");
    let wait = Action::for_member(ActionType::WaitForMemberUp, group, id);

    let cluster_dbserver = group == ServerGroup::DBServers && input.spec.mode() == DeploymentMode::Cluster;
    if cluster_dbserver && input.spec.maintenance_on_rotation() {
        vec![
            Action::for_deployment(ActionType::EnableMaintenance),
            rotate,
            wait,
            Action::for_deployment(ActionType::DisableMaintenance),
        ]
    } else if cluster_dbserver {
        vec![
            Action::for_member(ActionType::ResignLeadership, group, id),
            rotate,
            wait,
        ]
    } else {
        vec![rotate, wait]
    }
}

fn scale(input: &PlanInput<'_>) -> Plan {
    if input.status.scaling_disabled {
        debug!("Cluster scaling disabled, member counts left as they are");
        return Plan::new();
    }
    for &group in input.spec.groups() {
        let desired = usize::try_from(input.spec.count(group)).unwrap_or(0);
        let mut active: Vec<&MemberStatus> = input
            .status
            .members
            .group(group)
            .iter()
            .filter(|m| !m.is_marked_to_remove())
            .collect();

        if active.len() < desired {
            let id = group.new_member_id();
            return vec![
                Action::for_member(ActionType::AddMember, group, &id).with_reason("scale up"),
                Action::for_member(ActionType::WaitForMemberUp, group, &id),
            ];
        }

        if active.len() > desired {
            // members that are not ready go first
            active.sort_by(|a, b| (a.is_ready(), &a.id).cmp(&(b.is_ready(), &b.id)));
            if let Some(member) = active.first() {
                return vec![
                    Action::for_member(ActionType::MarkToRemoveMember, group, &member.id)
                        .with_reason("scale down"),
                ];
            }
        }
    }
    Plan::new()
}

/// `major.minor` of an image tag, if the tag looks like a version
fn minor_version(image: &str) -> Option<&str> {
    let tag = image.rsplit_once(':')?.1;
    let mut parts = tag.splitn(3, '.');
    let major = parts.next()?;
    let minor = parts.next()?;
    tag.get(..major.len() + 1 + minor.len())
}

fn image(input: &PlanInput<'_>) -> Plan {
    if !all_ready(input) {
        return Plan::new();
    }
    let wanted = input.spec.image();

    if let Some((group, member)) = members(input).find(|(_, m)| m.image.as_deref() != Some(wanted)) {
        let id = member.id.as_str();
        let version_change = member
            .image
            .as_deref()
            .is_some_and(|current| minor_version(current) != minor_version(wanted));
        return if version_change {
            vec![
                Action::for_member(ActionType::UpgradeMember, group, id).with_param("image", wanted),
                Action::for_member(ActionType::WaitForMemberUp, group, id),
            ]
        } else {
            vec![Action::for_member(ActionType::RuntimeContainerImageUpdate, group, id).with_param("image", wanted)]
        };
    }

    if input.status.current_image.as_deref() != Some(wanted) {
        return vec![Action::for_deployment(ActionType::SetCurrentImage).with_param("image", wanted)];
    }
    Plan::new()
}

fn resize_volumes(input: &PlanInput<'_>) -> Plan {
    members(input)
        .filter_map(|(group, member)| {
            let desired = parse_quantity(input.spec.volume_size(group)?)?;
            let pvc = input.snapshot.pvc(member.pvc_name.as_deref()?)?;
            let current = requested_size(pvc)?;
            (current < desired).then(|| Action::for_member(ActionType::PvcResize, group, &member.id))
        })
        .collect()
}

fn bootstrap(input: &PlanInput<'_>) -> Plan {
    if input.status.conditions.is_true(ConditionType::BootstrapCompleted) || !all_ready(input) {
        return Plan::new();
    }
    vec![Action::for_deployment(ActionType::BootstrapUpdate)]
}

fn maintenance(input: &PlanInput<'_>) -> Plan {
    let Some(agency) = input.agency else {
        return Plan::new();
    };
    if agency.maintenance_enabled() == input.status.conditions.is_true(ConditionType::Maintenance) {
        return Plan::new();
    }
    vec![Action::for_deployment(ActionType::SetMaintenanceCondition)]
}

fn topology(input: &PlanInput<'_>) -> Plan {
    if input.spec.topology.is_none() && input.status.topology.is_some() {
        return vec![Action::for_deployment(ActionType::TopologyDisable)];
    }
    Plan::new()
}
