//! Typed views over the `/arango` agency tree

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Value, json};

use super::AgencyError;
use crate::client::{Connection, post_json};

pub const READ_PATH: &str = "/_api/agency/read";

/// Status reported by the supervision for a healthy server
pub const SERVER_HEALTH_GOOD: &str = "GOOD";

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ServerHealth {
    #[serde(rename = "Status", default)]
    pub status: String,

    #[serde(rename = "ShortName", default)]
    pub short_name: String,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Supervision {
    /// Present while the supervision is in maintenance mode
    #[serde(rename = "Maintenance", default)]
    pub maintenance: Option<Value>,

    #[serde(rename = "Health", default)]
    pub health: BTreeMap<String, ServerHealth>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Target {
    #[serde(rename = "ToDo", default)]
    pub todo: BTreeMap<String, Value>,

    #[serde(rename = "Pending", default)]
    pub pending: BTreeMap<String, Value>,

    #[serde(rename = "Finished", default)]
    pub finished: BTreeMap<String, Value>,

    #[serde(rename = "Failed", default)]
    pub failed: BTreeMap<String, Value>,

    #[serde(rename = "CleanedServers", default)]
    pub cleaned_servers: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    ToDo,
    Pending,
    Finished,
    Failed,
    Unknown,
}

impl Target {
    pub fn job_status(&self, job_id: &str) -> JobStatus {
        if self.todo.contains_key(job_id) {
            JobStatus::ToDo
        } else if self.pending.contains_key(job_id) {
            JobStatus::Pending
        } else if self.finished.contains_key(job_id) {
            JobStatus::Finished
        } else if self.failed.contains_key(job_id) {
            JobStatus::Failed
        } else {
            JobStatus::Unknown
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
struct Tree {
    #[serde(rename = "Supervision", default)]
    supervision: Supervision,

    #[serde(rename = "Target", default)]
    target: Target,
}

/// Snapshot of the agency tree at one commit index
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgencyState {
    pub supervision: Supervision,
    pub target: Target,
    /// Whole `/arango` subtree as read
    pub raw: Value,
}

impl AgencyState {
    /// Decode the response of a read for `[["/arango"]]`
    pub fn from_read_result(result: Vec<Value>) -> Result<Self, AgencyError> {
        let first = result
            .into_iter()
            .next()
            .ok_or_else(|| AgencyError::InvalidResponse("empty read result".to_string()))?;
        let raw = match first {
            Value::Object(mut map) => map
                .remove("arango")
                .ok_or_else(|| AgencyError::InvalidResponse("missing /arango".to_string()))?,
            other => {
                return Err(AgencyError::InvalidResponse(format!(
                    "expected object, got {other}"
                )));
            }
        };

        let tree: Tree = serde_json::from_value(raw.clone())
            .map_err(|e| AgencyError::InvalidResponse(e.to_string()))?;
        Ok(Self {
            supervision: tree.supervision,
            target: tree.target,
            raw,
        })
    }

    pub fn maintenance_enabled(&self) -> bool {
        self.supervision.maintenance.is_some()
    }

    /// Whether the supervision reports the server as healthy
    pub fn is_server_good(&self, id: &str) -> bool {
        self.supervision
            .health
            .get(id)
            .is_some_and(|h| h.status == SERVER_HEALTH_GOOD)
    }

    pub fn job_status(&self, job_id: &str) -> JobStatus {
        self.target.job_status(job_id)
    }

    pub fn is_cleaned_out(&self, id: &str) -> bool {
        self.target.cleaned_servers.iter().any(|s| s == id)
    }

    /// Value at a slash separated path below `/arango`
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(&self.raw, |node, key| node.get(key))
    }
}

/// Read the `/arango` tree from the leader
pub async fn load_state(connection: &dyn Connection) -> Result<AgencyState, AgencyError> {
    let result: Vec<Value> = post_json(connection, READ_PATH, json!([["/arango"]])).await?;
    AgencyState::from_read_result(result)
}
