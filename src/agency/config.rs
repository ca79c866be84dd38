//! `GET /_api/agency/config` against every agent

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;

use crate::client::{Connection, ConnectionError, get_json};

pub const CONFIG_PATH: &str = "/_api/agency/config";

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgencyConfig {
    /// Set by agents that know the current leader
    #[serde(default)]
    pub leader_id: Option<String>,

    #[serde(default)]
    pub commit_index: u64,

    #[serde(default)]
    pub configuration: ConfigurationId,

    #[serde(default)]
    pub pool: BTreeMap<String, Value>,

    #[serde(default)]
    pub active: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ConfigurationId {
    #[serde(default)]
    pub id: String,
}

pub async fn fetch_config(connection: &dyn Connection) -> Result<AgencyConfig, ConnectionError> {
    get_json(connection, CONFIG_PATH).await
}

/// Fetch the config from every agent concurrently. Each request gets its own
/// deadline; all results are collected before returning.
pub async fn fetch_configs(
    connections: &BTreeMap<String, Arc<dyn Connection>>,
    timeout: Duration,
) -> BTreeMap<String, Result<AgencyConfig, ConnectionError>> {
    let requests = connections.iter().map(|(id, connection)| async move {
        let result = match tokio::time::timeout(timeout, fetch_config(connection.as_ref())).await {
            Ok(result) => result,
            Err(elapsed) => Err(ConnectionError::from(elapsed)),
        };
        (id.clone(), result)
    });
    join_all(requests).await.into_iter().collect()
}
