//! Lazily created member connections, keyed by group and member ID

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use super::{Connection, ConnectionError, ConnectionFactory, Connections, JwtAuthentication};
use crate::config::OperatorConfig;
use crate::crd::ServerGroup;
use crate::resources::member_dns_name;

#[derive(Default)]
struct CacheState {
    tls: bool,
    auth: Option<JwtAuthentication>,
    connections: HashMap<(ServerGroup, String), Arc<dyn Connection>>,
}

pub struct ClientCache {
    factory: Arc<dyn ConnectionFactory>,
    deployment_name: String,
    namespace: String,
    port: u16,
    token_ttl: Duration,
    state: Mutex<CacheState>,
}

impl ClientCache {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        deployment_name: &str,
        namespace: &str,
        config: &OperatorConfig,
    ) -> Self {
        Self {
            factory,
            deployment_name: deployment_name.to_string(),
            namespace: namespace.to_string(),
            port: config.member_port,
            token_ttl: config.jwt_token_ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// URL of a member, e.g. `http://example-agent-agnt-x.example-int.db.svc:8529`
    pub fn endpoint(&self, group: ServerGroup, member_id: &str) -> String {
        let scheme = if self.lock().tls { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}",
            member_dns_name(&self.deployment_name, &self.namespace, group, member_id),
            self.port
        )
    }

    /// Apply the deployment's TLS mode and JWT secret. Cached connections are
    /// dropped when either changed. Returns true if the cache was cleared.
    pub fn configure(&self, tls: bool, jwt_secret: Option<&str>) -> bool {
        let auth = jwt_secret.map(|s| JwtAuthentication::new(s, self.token_ttl));
        let mut state = self.lock();
        if state.tls == tls && state.auth == auth {
            return false;
        }
        debug!(
            deployment = %self.deployment_name,
            tls,
            authenticated = auth.is_some(),
            "Member connection settings changed, dropping cached connections"
        );
        state.tls = tls;
        state.auth = auth;
        state.connections.clear();
        true
    }

    /// Connection to one member, created on first use
    pub fn get(&self, group: ServerGroup, member_id: &str) -> Result<Arc<dyn Connection>, ConnectionError> {
        let key = (group, member_id.to_string());
        if let Some(connection) = self.lock().connections.get(&key) {
            return Ok(connection.clone());
        }

        let endpoint = self.endpoint(group, member_id);
        let mut state = self.lock();
        if let Some(connection) = state.connections.get(&key) {
            return Ok(connection.clone());
        }
        let connection = self.factory.connect(&endpoint, state.auth.clone())?;
        state.connections.insert(key, connection.clone());
        Ok(connection)
    }

    /// Connections to the given members of a group
    pub fn connections<'a>(
        &self,
        group: ServerGroup,
        member_ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<Connections, ConnectionError> {
        let connections = member_ids
            .into_iter()
            .map(|id| Ok((id.to_string(), self.get(group, id)?)))
            .collect::<Result<Vec<_>, ConnectionError>>()?;
        Ok(Connections::new(connections))
    }

    /// Drop the cached connection of a member that went away
    pub fn forget(&self, group: ServerGroup, member_id: &str) {
        self.lock()
            .connections
            .remove(&(group, member_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
