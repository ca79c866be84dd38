//! Cached view of the database agency
//!
//! The agency is the consensus store the database cluster keeps its own
//! configuration in. The controller discovers the current leader across all
//! known agents and reads the `/arango` tree from it, but only when the
//! leader's commit index moved past what is already cached.

mod cache;
mod config;
mod set;
mod state;

use thiserror::Error;

use crate::client::ConnectionError;

pub use cache::{AgencyCache, ClusterAgencyCache, SingleAgencyCache, new_cache};
pub use config::{AgencyConfig, fetch_config, fetch_configs};
pub use set::{AgentSet, Health, Leader};
pub use state::{AgencyState, JobStatus, ServerHealth, Supervision, Target};

#[derive(Error, Debug)]
pub enum AgencyError {
    #[error("no leader in agency")]
    NoLeader,

    #[error("leader {0} not in result list")]
    LeaderNotInResults(String),

    #[error("error while fetching config from agency leader {id}: {source}")]
    LeaderFailed {
        id: String,
        #[source]
        source: ConnectionError,
    },

    #[error("config result is missing for leader {0}")]
    MissingConfig(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid agency response: {0}")]
    InvalidResponse(String),

    /// Reading the tree failed after the leader was discovered
    #[error("agency read at commit index {commit_index} failed: {source}")]
    LoadFailed {
        commit_index: u64,
        #[source]
        source: Box<AgencyError>,
    },
}

impl AgencyError {
    /// Leader commit index discovered before the failure, if any
    pub fn commit_index(&self) -> Option<u64> {
        match self {
            AgencyError::LoadFailed { commit_index, .. } => Some(*commit_index),
            _ => None,
        }
    }
}
