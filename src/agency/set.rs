//! Connections to every known agent plus leader discovery

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, instrument};

use super::AgencyError;
use super::config::{AgencyConfig, fetch_configs};
use crate::client::{ClientCache, Connection, ConnectionError};
use crate::crd::ServerGroup;

/// Agent health as seen by the last refresh, keyed by agent ID
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Health(BTreeMap<String, bool>);

impl Health {
    pub fn new(health: BTreeMap<String, bool>) -> Self {
        Self(health)
    }

    /// Number of healthy agents, not counting the given IDs
    pub fn healthy(&self, except: &[&str]) -> usize {
        self.0
            .iter()
            .filter(|(id, ok)| **ok && !except.contains(&id.as_str()))
            .count()
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.0.get(id).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(id, ok)| (id.as_str(), *ok))
    }
}

/// Agent currently leading the agency
#[derive(Clone, Debug)]
pub struct Leader {
    pub id: String,
    pub commit_index: u64,
    pub connection: Arc<dyn Connection>,
    pub config: AgencyConfig,
}

#[derive(Default)]
struct SetState {
    connections: BTreeMap<String, Arc<dyn Connection>>,
    health: Health,
    leader: Option<Leader>,
}

#[derive(Default)]
pub struct AgentSet {
    state: Mutex<SetState>,
}

impl AgentSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track exactly `ids`. New agents get a connection, agents no longer
    /// listed are dropped along with their health and leadership.
    pub fn set_members(&self, ids: &[String], clients: &ClientCache) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        let before = state.connections.len();
        state.connections.retain(|id, _| ids.contains(id));
        if state.connections.len() != before {
            debug!(removed = before - state.connections.len(), "Dropped connections to removed agents");
            state.health.0.retain(|id, _| ids.contains(id));
            if state.leader.as_ref().is_some_and(|leader| !ids.contains(&leader.id)) {
                state.leader = None;
            }
        }
        for id in ids {
            if !state.connections.contains_key(id) {
                let connection = clients.get(ServerGroup::Agents, id)?;
                state.connections.insert(id.clone(), connection);
            }
        }
        Ok(())
    }

    /// Register a connection directly
    pub fn insert(&self, id: impl Into<String>, connection: Arc<dyn Connection>) {
        self.lock().connections.insert(id.into(), connection);
    }

    pub fn size(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn health(&self) -> Health {
        self.lock().health.clone()
    }

    pub fn leader(&self) -> Option<Leader> {
        self.lock().leader.clone()
    }

    pub fn agent(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.lock().connections.get(id).cloned()
    }

    /// Query every agent and pick the leader. The leader and health map are
    /// replaced even when the refresh fails, so a failed refresh leaves no
    /// stale leader behind.
    #[instrument(skip(self), fields(agents = self.size()))]
    pub async fn refresh(&self, timeout: Duration) -> Result<(), AgencyError> {
        let connections = self.lock().connections.clone();
        let results = fetch_configs(&connections, timeout).await;

        let mut health = BTreeMap::new();
        let outcome = discover_leader(results, &connections, &mut health);

        let mut state = self.lock();
        state.health = Health(health);
        match outcome {
            Ok(leader) => {
                debug!(leader = %leader.id, commit_index = leader.commit_index, "Agency leader found");
                state.leader = Some(leader);
                Ok(())
            }
            Err(e) => {
                state.leader = None;
                Err(e)
            }
        }
    }
}

fn discover_leader(
    mut results: BTreeMap<String, Result<AgencyConfig, ConnectionError>>,
    connections: &BTreeMap<String, Arc<dyn Connection>>,
    health: &mut BTreeMap<String, bool>,
) -> Result<Leader, AgencyError> {
    let leader_id = results
        .values()
        .filter_map(|r| r.as_ref().ok())
        .find_map(|config| config.leader_id.clone())
        .ok_or(AgencyError::NoLeader)?;

    let config = match results.remove(&leader_id) {
        None => return Err(AgencyError::LeaderNotInResults(leader_id)),
        Some(Err(source)) => {
            return Err(AgencyError::LeaderFailed {
                id: leader_id,
                source,
            });
        }
        Some(Ok(config)) => config,
    };

    let connection = connections
        .get(&leader_id)
        .cloned()
        .ok_or_else(|| AgencyError::MissingConfig(leader_id.clone()))?;

    health.insert(leader_id.clone(), true);
    for id in &config.active {
        if matches!(results.get(id), Some(Ok(_))) {
            health.insert(id.clone(), true);
        }
    }

    Ok(Leader {
        id: leader_id,
        commit_index: config.commit_index,
        connection,
        config,
    })
}
