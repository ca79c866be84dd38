//! Per member reachability and the aggregate health of a deployment

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::agency::{AgencyCache, Health};
use crate::client::{ClientCache, get_json};
use crate::crd::{
    ConditionType, DeploymentMembers, DeploymentMode, MemberPhase, MemberStatus, ServerGroup,
};
use crate::inspector::Snapshot;
use crate::resources::pod::is_pod_ready;

pub const VERSION_PATH: &str = "/_api/version";

/// Derived state of one member for the current tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberState {
    pub id: String,
    pub group: ServerGroup,
    pub phase: MemberPhase,
    pub pod_name: Option<String>,
    pub pod_ready: bool,
    pub reachable: bool,
    pub restart_pending: bool,
    pub pvc_resize_pending: bool,
}

impl MemberState {
    fn from_status(group: ServerGroup, member: &MemberStatus, pod_ready: bool) -> Self {
        let conditions = &member.conditions;
        Self {
            id: member.id.clone(),
            group,
            phase: member.phase,
            pod_name: member.pod_name.clone(),
            pod_ready,
            reachable: false,
            restart_pending: conditions.is_true(ConditionType::Restart)
                || conditions.is_true(ConditionType::PendingRestart),
            pvc_resize_pending: conditions.is_true(ConditionType::PvcResizePending),
        }
    }
}

/// Health of the whole deployment as seen by the last refresh
#[derive(Clone, Debug, Default)]
pub struct AggregateState {
    mode: DeploymentMode,
    members: BTreeMap<String, MemberState>,
    agency_leader: Option<String>,
    agency_health: Health,
    agent_count: usize,
}

impl AggregateState {
    pub fn new(
        mode: DeploymentMode,
        members: Vec<MemberState>,
        agency_leader: Option<String>,
        agency_health: Health,
    ) -> Self {
        let agent_count = members
            .iter()
            .filter(|m| m.group == ServerGroup::Agents)
            .count();
        Self {
            mode,
            members: members.into_iter().map(|m| (m.id.clone(), m)).collect(),
            agency_leader,
            agency_health,
            agent_count,
        }
    }

    pub fn member(&self, id: &str) -> Option<&MemberState> {
        self.members.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemberState> {
        self.members.values()
    }

    pub fn is_member_reachable(&self, id: &str) -> bool {
        self.member(id).is_some_and(|m| m.reachable)
    }

    pub fn reachable_count(&self, group: ServerGroup) -> usize {
        self.iter()
            .filter(|m| m.group == group && m.reachable)
            .count()
    }

    /// Single servers are always considered reachable. Clusters need an agency
    /// leader, a healthy agent majority, and at least one reachable
    /// coordinator and dbserver.
    pub fn is_reachable(&self) -> bool {
        match self.mode {
            DeploymentMode::Single => true,
            DeploymentMode::Cluster => {
                self.agency_leader.is_some()
                    && self.agency_health.healthy(&[]) > self.agent_count / 2
                    && self.reachable_count(ServerGroup::Coordinators) > 0
                    && self.reachable_count(ServerGroup::DBServers) > 0
            }
        }
    }
}

#[derive(Default)]
struct TrackerState {
    refreshed: bool,
    state: Arc<AggregateState>,
}

/// Pings members and keeps the last aggregate state
pub struct MemberStateTracker {
    request_timeout: Duration,
    state: Mutex<TrackerState>,
}

impl MemberStateTracker {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Recompute every member's state. Agents are judged by the agency
    /// health map, every other member with a pod is pinged concurrently.
    #[instrument(skip_all, fields(members = members.len()))]
    pub async fn refresh_state(
        &self,
        mode: DeploymentMode,
        members: &DeploymentMembers,
        snapshot: &Snapshot,
        clients: &ClientCache,
        agency: &dyn AgencyCache,
    ) {
        let health = agency.health();

        let checks = members.iter().map(|(group, member)| {
            let pod_ready = member
                .pod_name
                .as_deref()
                .and_then(|name| snapshot.pod(name))
                .is_some_and(is_pod_ready);
            let mut state = MemberState::from_status(group, member, pod_ready);
            let health = &health;
            async move {
                state.reachable = if !pod_ready {
                    false
                } else if group == ServerGroup::Agents {
                    health.is_healthy(&state.id)
                } else {
                    self.ping(clients, group, &state.id).await
                };
                state
            }
        });
        let states = join_all(checks).await;

        let aggregate = AggregateState::new(mode, states, agency.leader_id(), health);
        debug!(reachable = aggregate.is_reachable(), "Member state refreshed");

        let mut tracker = self.lock();
        tracker.state = Arc::new(aggregate);
        tracker.refreshed = true;
    }

    async fn ping(&self, clients: &ClientCache, group: ServerGroup, id: &str) -> bool {
        let Ok(connection) = clients.get(group, id) else {
            return false;
        };
        match tokio::time::timeout(
            self.request_timeout,
            get_json::<Value>(connection.as_ref(), VERSION_PATH),
        )
        .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(member = id, error = %e, "Member version check failed");
                false
            }
            Err(_) => {
                debug!(member = id, "Member version check timed out");
                false
            }
        }
    }

    pub fn state(&self) -> Arc<AggregateState> {
        self.lock().state.clone()
    }

    /// Reachability per member ID. The flag is false until the first refresh.
    pub fn health(&self) -> (BTreeMap<String, bool>, bool) {
        let tracker = self.lock();
        let map = tracker
            .state
            .iter()
            .map(|m| (m.id.clone(), m.reachable))
            .collect();
        (map, tracker.refreshed)
    }
}
