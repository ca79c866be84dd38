//! The action state machine contract
//!
//! Every planned [`Action`] is turned into an [`ActionImpl`] by the registry
//! right before it runs. The executor drives it through `start`, then
//! `check_progress` on later ticks, then `post` once it is ready.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::agency::{AgencyCache, AgencyState};
use crate::client::{ClientCache, Connection};
use crate::clock::Clock;
use crate::controller::error::{Error, Result};
use crate::crd::{
    Action, ArangoDeployment, ArangoDeploymentSpec, ArangoDeploymentStatus, DeploymentMode,
    MemberStatus, ServerGroup,
};
use crate::inspector::Snapshot;
use crate::kube_client::KubeClient;
use crate::members::AggregateState;

/// Outcome of polling an action
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub ready: bool,
    pub abort: bool,
}

impl Progress {
    pub const fn ready() -> Self {
        Self {
            ready: true,
            abort: false,
        }
    }

    pub const fn pending() -> Self {
        Self {
            ready: false,
            abort: false,
        }
    }

    pub const fn abort() -> Self {
        Self {
            ready: false,
            abort: true,
        }
    }
}

impl From<bool> for Progress {
    fn from(ready: bool) -> Self {
        if ready {
            Self::ready()
        } else {
            Self::pending()
        }
    }
}

/// Behavior of one action type.
///
/// `start` must be idempotent: the plan is persisted, so after a controller
/// restart it can run again for an action whose effect already happened.
#[async_trait]
pub trait ActionImpl: Send + Sync {
    /// Perform the first step. `Ok(true)` means the action finished.
    async fn start(&self, ctx: &mut ActionContext<'_>) -> Result<bool>;

    /// Poll an action whose `start` returned not ready
    async fn check_progress(&self, _ctx: &mut ActionContext<'_>) -> Result<Progress> {
        Ok(Progress::ready())
    }

    /// Record side effects once the action is confirmed ready
    async fn post(&self, _ctx: &mut ActionContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Everything an action may read or change during one tick
pub struct ActionContext<'a> {
    pub deployment: &'a ArangoDeployment,
    pub namespace: &'a str,
    pub name: &'a str,
    /// Accepted spec the plan works towards
    pub spec: &'a ArangoDeploymentSpec,
    /// Working copy of the status, persisted by the executor
    pub status: &'a mut ArangoDeploymentStatus,
    pub kube: &'a dyn KubeClient,
    pub clients: &'a ClientCache,
    pub agency: &'a dyn AgencyCache,
    pub snapshot: &'a Snapshot,
    pub members: &'a AggregateState,
    pub clock: &'a dyn Clock,
    pub pod_update_timeout: Duration,
}

impl ActionContext<'_> {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn mode(&self) -> DeploymentMode {
        self.spec.mode()
    }

    pub fn member(&self, group: ServerGroup, id: &str) -> Option<&MemberStatus> {
        self.status.members.get(group, id)
    }

    pub fn member_mut(&mut self, group: ServerGroup, id: &str) -> Option<&mut MemberStatus> {
        self.status.members.get_mut(group, id)
    }

    /// Agency tree, if the last reload produced valid data
    pub fn agency_state(&self) -> Option<Arc<AgencyState>> {
        match self.agency.data() {
            (Some(state), true) => Some(state),
            _ => None,
        }
    }

    /// Connection for cluster wide admin requests: a random reachable
    /// coordinator, or the single server.
    pub fn admin_connection(&self) -> Result<Arc<dyn Connection>> {
        let group = match self.mode() {
            DeploymentMode::Single => ServerGroup::Single,
            DeploymentMode::Cluster => ServerGroup::Coordinators,
        };
        let ids: Vec<&str> = self
            .status
            .members
            .group(group)
            .iter()
            .filter(|m| self.members.is_member_reachable(&m.id))
            .map(|m| m.id.as_str())
            .collect();
        self.clients
            .connections(group, ids)?
            .random()
            .ok_or_else(|| Error::TransientError(format!("no reachable {group} member")))
    }

    /// Delete a member pod, bounded by the pod update timeout
    pub async fn delete_pod(&self, pod_name: &str) -> Result<()> {
        debug!(pod = pod_name, "Deleting member pod");
        tokio::time::timeout(
            self.pod_update_timeout,
            self.kube.delete_pod(self.namespace, pod_name),
        )
        .await
        .map_err(|_| Error::TimeoutError(format!("deleting pod {pod_name}")))?
    }
}

/// Group and member an action targets
pub fn action_target(action: &Action) -> Result<(ServerGroup, &str)> {
    match action.group {
        Some(group) if !action.member_id.is_empty() => Ok((group, action.member_id.as_str())),
        _ => Err(Error::ActionFailed(format!(
            "{} action {} has no target member",
            action.type_, action.id
        ))),
    }
}
