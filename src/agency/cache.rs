//! Agency cache: reload only when the leader's commit index advanced

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::set::{AgentSet, Health};
use super::state::{AgencyState, load_state};
use super::AgencyError;
use crate::client::{ClientCache, ConnectionError};
use crate::crd::DeploymentMode;

#[async_trait]
pub trait AgencyCache: Send + Sync {
    /// Refresh leader information and, if needed, the cached tree.
    /// Returns the leader's commit index.
    async fn reload(&self) -> Result<u64, AgencyError>;

    /// Cached tree and whether it is valid
    fn data(&self) -> (Option<Arc<AgencyState>>, bool);

    fn commit_index(&self) -> u64;

    fn health(&self) -> Health;

    fn leader_id(&self) -> Option<String>;

    /// Make sure a connection exists for every known agent
    fn set_members(&self, ids: &[String], clients: &ClientCache) -> Result<(), ConnectionError>;

    /// Number of agents with a connection
    fn size(&self) -> usize;
}

/// Build the cache variant for a deployment mode
pub fn new_cache(mode: DeploymentMode, request_timeout: Duration) -> Arc<dyn AgencyCache> {
    match mode {
        DeploymentMode::Single => Arc::new(SingleAgencyCache),
        DeploymentMode::Cluster => Arc::new(ClusterAgencyCache::new(request_timeout)),
    }
}

/// Single servers have no agency: always valid, always empty, never networked
#[derive(Debug, Default)]
pub struct SingleAgencyCache;

#[async_trait]
impl AgencyCache for SingleAgencyCache {
    async fn reload(&self) -> Result<u64, AgencyError> {
        Ok(0)
    }

    fn data(&self) -> (Option<Arc<AgencyState>>, bool) {
        (Some(Arc::new(AgencyState::default())), true)
    }

    fn commit_index(&self) -> u64 {
        0
    }

    fn health(&self) -> Health {
        Health::default()
    }

    fn leader_id(&self) -> Option<String> {
        None
    }

    fn set_members(&self, _ids: &[String], _clients: &ClientCache) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn size(&self) -> usize {
        0
    }
}

#[derive(Default)]
struct CachedTree {
    valid: bool,
    commit_index: u64,
    data: Option<Arc<AgencyState>>,
}

pub struct ClusterAgencyCache {
    set: AgentSet,
    request_timeout: Duration,
    tree: Mutex<CachedTree>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl ClusterAgencyCache {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            set: AgentSet::new(),
            request_timeout,
            tree: Mutex::new(CachedTree::default()),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn agents(&self) -> &AgentSet {
        &self.set
    }

    fn lock(&self) -> MutexGuard<'_, CachedTree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AgencyCache for ClusterAgencyCache {
    #[instrument(skip(self))]
    async fn reload(&self) -> Result<u64, AgencyError> {
        let _reloading = self.reload_lock.lock().await;

        self.set.refresh(self.request_timeout).await?;
        let leader = self.set.leader().ok_or(AgencyError::NoLeader)?;

        {
            let tree = self.lock();
            // stale or repeated index never replaces valid data
            if tree.valid && leader.commit_index <= tree.commit_index {
                debug!(
                    commit_index = tree.commit_index,
                    leader_index = leader.commit_index,
                    "Agency unchanged, skipping read"
                );
                return Ok(tree.commit_index);
            }
        }

        let loaded = match tokio::time::timeout(
            self.request_timeout,
            load_state(leader.connection.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(ConnectionError::from(elapsed).into()),
        };

        let mut tree = self.lock();
        match loaded {
            Ok(state) => {
                tree.data = Some(Arc::new(state));
                tree.valid = true;
                tree.commit_index = leader.commit_index;
                debug!(commit_index = leader.commit_index, leader = %leader.id, "Agency tree reloaded");
                Ok(leader.commit_index)
            }
            Err(e) => {
                warn!(leader = %leader.id, error = %e, "Agency read failed, cache marked invalid");
                tree.valid = false;
                Err(AgencyError::LoadFailed {
                    commit_index: leader.commit_index,
                    source: Box::new(e),
                })
            }
        }
    }

    fn data(&self) -> (Option<Arc<AgencyState>>, bool) {
        let tree = self.lock();
        (tree.data.clone(), tree.valid)
    }

    fn commit_index(&self) -> u64 {
        self.lock().commit_index
    }

    fn health(&self) -> Health {
        self.set.health()
    }

    fn leader_id(&self) -> Option<String> {
        self.set.leader().map(|l| l.id)
    }

    fn set_members(&self, ids: &[String], clients: &ClientCache) -> Result<(), ConnectionError> {
        self.set.set_members(ids, clients)
    }

    fn size(&self) -> usize {
        self.set.size()
    }
}
