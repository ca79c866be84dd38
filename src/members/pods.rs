//! Fold observed pods back into member status

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{info, warn};

use crate::crd::{ArangoDeploymentStatus, ConditionType, MemberPhase, ServerGroup};
use crate::inspector::{ResourceKind, Snapshot};
use crate::resources::pod::{is_pod_ready, is_pod_terminated, rotation_requested};

/// Update member phases and conditions from the pods in the snapshot.
/// Returns true if any member changed.
///
/// - a pod that disappeared while the member expected one fails the member
/// - a starting member whose pod became ready is promoted to `Ready`
/// - the `Ready` condition mirrors pod readiness
/// - the rotate annotation on a pod raises the `Restart` condition
pub fn inspect_pods(status: &mut ArangoDeploymentStatus, snapshot: &Snapshot, now: DateTime<Utc>) -> bool {
    if !snapshot.is_loaded(ResourceKind::Pod) {
        return false;
    }

    let mut changed = false;
    for group in ServerGroup::ALL {
        for member in status.members.group_mut(group).iter_mut() {
            let Some(pod_name) = member.pod_name.clone() else {
                continue;
            };

            let Some(pod) = snapshot.pod(&pod_name) else {
                if member.phase.expects_pod()
                    && member.phase != MemberPhase::Failed
                    && !member.is_marked_to_remove()
                {
                    warn!(member = %member.id, pod = %pod_name, "Member pod is gone");
                    member.phase = MemberPhase::Failed;
                    member
                        .conditions
                        .update(ConditionType::Ready, false, "Pod Not Found", "", now);
                    member
                        .conditions
                        .update(ConditionType::Terminated, true, "Pod Not Found", "", now);
                    changed = true;
                }
                continue;
            };

            if !member.phase.expects_pod() {
                // old pod still terminating after a rotation
                continue;
            }

            if member.pod_uid.as_deref() != pod.uid().as_deref() && pod.uid().is_some() {
                member.pod_uid = pod.uid();
                changed = true;
            }

            if is_pod_terminated(pod) {
                changed |= member.conditions.update(
                    ConditionType::Terminated,
                    true,
                    "Pod Terminated",
                    "",
                    now,
                );
            }

            let ready = is_pod_ready(pod);
            if ready {
                changed |= member
                    .conditions
                    .update(ConditionType::Ready, true, "Pod Ready", "", now);
                changed |= member.conditions.remove(ConditionType::Terminated);
                if member.phase == MemberPhase::Creating {
                    info!(member = %member.id, "Member is ready");
                    member.phase = MemberPhase::Ready;
                    changed = true;
                }
            } else {
                changed |= member
                    .conditions
                    .update(ConditionType::Ready, false, "Pod Not Ready", "", now);
            }

            if rotation_requested(pod) {
                changed |= member.conditions.update(
                    ConditionType::Restart,
                    true,
                    "Restart Requested",
                    "pod carries the rotate annotation",
                    now,
                );
            }
        }
    }
    changed
}
