use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::action::Plan;
use super::condition::ConditionList;
use super::member::{DeploymentMembers, ServerGroup};

/// Secret name value that disables a secret-backed feature
pub const SECRET_NAME_NONE: &str = "None";

/// Image used when the spec does not name one
pub const DEFAULT_IMAGE: &str = "arangodb/arangodb:3.11.8";

/// Volume size used for groups that keep data
pub const DEFAULT_VOLUME_SIZE: &str = "8Gi";

/// ArangoDeployment is the Schema for the arangodeployments API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "database.arangodb.com",
    version = "v1",
    kind = "ArangoDeployment",
    plural = "arangodeployments",
    shortname = "arangodb",
    namespaced,
    status = "ArangoDeploymentStatus",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ArangoDeploymentSpec {
    /// Single server or cluster. Immutable once accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeploymentMode>,

    /// Immutable once accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_engine: Option<StorageEngine>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rocksdb: Option<RocksDbSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single: Option<ServerGroupSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<ServerGroupSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbservers: Option<ServerGroupSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinators: Option<ServerGroupSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<Timeouts>,

    /// Metrics exporter sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseSpec>,

    /// Name of a backup to restore into the deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologySpec>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DeploymentMode {
    Single,
    #[default]
    Cluster,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::Single => write!(f, "Single"),
            DeploymentMode::Cluster => write!(f, "Cluster"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum StorageEngine {
    #[default]
    RocksDB,
    MMFiles,
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageEngine::RocksDB => write!(f, "RocksDB"),
            StorageEngine::MMFiles => write!(f, "MMFiles"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RocksDbSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    /// Secret holding the encryption key. Immutable once accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_secret_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Secret holding the CA used for member certificates, "None" disables TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    /// Secret holding the JWT signing token, "None" disables authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,

    /// Requested volume size (e.g. "8Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Per action type timeouts in seconds. The "default" key applies to
    /// every type without its own entry. Zero disables the timeout.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Put the agency supervision into maintenance while members rotate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    pub zones: i32,

    /// Node label carrying the zone name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ArangoDeploymentSpec {
    pub fn mode(&self) -> DeploymentMode {
        self.mode.unwrap_or_default()
    }

    pub fn storage_engine(&self) -> StorageEngine {
        self.storage_engine.unwrap_or_default()
    }

    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    pub fn encryption_key_secret_name(&self) -> Option<&str> {
        self.rocksdb
            .as_ref()
            .and_then(|r| r.encryption.as_ref())
            .and_then(|e| e.key_secret_name.as_deref())
            .filter(|n| *n != SECRET_NAME_NONE)
    }

    pub fn jwt_secret_name(&self) -> Option<&str> {
        self.authentication
            .as_ref()
            .and_then(|a| a.jwt_secret_name.as_deref())
            .filter(|n| *n != SECRET_NAME_NONE)
    }

    pub fn tls_ca_secret_name(&self) -> Option<&str> {
        self.tls
            .as_ref()
            .and_then(|t| t.ca_secret_name.as_deref())
            .filter(|n| *n != SECRET_NAME_NONE)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_ca_secret_name().is_some()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.as_ref().and_then(|m| m.enabled).unwrap_or(false)
    }

    pub fn maintenance_on_rotation(&self) -> bool {
        self.database
            .as_ref()
            .and_then(|d| d.maintenance)
            .unwrap_or(false)
    }

    /// Groups that carry members in the configured mode
    pub fn groups(&self) -> &'static [ServerGroup] {
        match self.mode() {
            DeploymentMode::Single => &[ServerGroup::Single],
            DeploymentMode::Cluster => &[
                ServerGroup::Agents,
                ServerGroup::DBServers,
                ServerGroup::Coordinators,
            ],
        }
    }

    pub fn group_spec(&self, group: ServerGroup) -> Option<&ServerGroupSpec> {
        match group {
            ServerGroup::Single => self.single.as_ref(),
            ServerGroup::Agents => self.agents.as_ref(),
            ServerGroup::DBServers => self.dbservers.as_ref(),
            ServerGroup::Coordinators => self.coordinators.as_ref(),
        }
    }

    fn group_spec_mut(&mut self, group: ServerGroup) -> &mut Option<ServerGroupSpec> {
        match group {
            ServerGroup::Single => &mut self.single,
            ServerGroup::Agents => &mut self.agents,
            ServerGroup::DBServers => &mut self.dbservers,
            ServerGroup::Coordinators => &mut self.coordinators,
        }
    }

    /// Desired member count; zero for groups unused in the current mode
    pub fn count(&self, group: ServerGroup) -> i32 {
        if !self.groups().contains(&group) {
            return 0;
        }
        self.group_spec(group)
            .and_then(|g| g.count)
            .unwrap_or_else(|| default_count(group))
    }

    pub fn volume_size(&self, group: ServerGroup) -> Option<&str> {
        self.group_spec(group).and_then(|g| g.volume_size.as_deref())
    }

    /// Fill every unset field with its default. Existing values are kept.
    pub fn set_defaults(&mut self, deployment_name: &str) {
        self.mode.get_or_insert_with(DeploymentMode::default);
        self.storage_engine.get_or_insert_with(StorageEngine::default);
        self.image.get_or_insert_with(|| DEFAULT_IMAGE.to_string());

        let auth = self.authentication.get_or_insert_with(Default::default);
        auth.jwt_secret_name
            .get_or_insert_with(|| format!("{deployment_name}-jwt"));

        for group in self.groups() {
            let spec = self.group_spec_mut(*group).get_or_insert_with(Default::default);
            spec.count.get_or_insert_with(|| default_count(*group));
            if *group != ServerGroup::Coordinators {
                spec.volume_size
                    .get_or_insert_with(|| DEFAULT_VOLUME_SIZE.to_string());
            }
        }

        if let Some(metrics) = self.metrics.as_mut()
            && metrics.enabled == Some(true)
        {
            metrics.port.get_or_insert(9101);
        }
    }

    /// Hex SHA-256 of the canonical JSON form of the spec
    pub fn checksum(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Restore fields that may not change after acceptance to the accepted
    /// values. Returns the JSON paths of every field that was rewritten.
    pub fn reset_immutable_fields(&mut self, accepted: &ArangoDeploymentSpec) -> Vec<&'static str> {
        let mut reverted = Vec::new();

        if accepted.mode.is_some() && self.mode != accepted.mode {
            self.mode = accepted.mode;
            reverted.push("spec.mode");
        }

        if accepted.storage_engine.is_some() && self.storage_engine != accepted.storage_engine {
            self.storage_engine = accepted.storage_engine;
            reverted.push("spec.storageEngine");
        }

        let accepted_key = accepted
            .rocksdb
            .as_ref()
            .and_then(|r| r.encryption.as_ref())
            .and_then(|e| e.key_secret_name.clone());
        let current_key = self
            .rocksdb
            .as_ref()
            .and_then(|r| r.encryption.as_ref())
            .and_then(|e| e.key_secret_name.clone());
        if current_key != accepted_key {
            self.rocksdb
                .get_or_insert_with(Default::default)
                .encryption
                .get_or_insert_with(Default::default)
                .key_secret_name = accepted_key;
            reverted.push("spec.rocksdb.encryption.keySecretName");
        }

        reverted
    }

    /// Configured timeout override for an action type, in seconds
    pub fn action_timeout_override(&self, key: &str) -> Option<u64> {
        self.timeouts.as_ref().and_then(|t| t.actions.get(key).copied())
    }
}

fn default_count(group: ServerGroup) -> i32 {
    match group {
        ServerGroup::Single => 1,
        ServerGroup::Agents | ServerGroup::DBServers | ServerGroup::Coordinators => 3,
    }
}

/// Overall lifecycle phase of a deployment
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DeploymentPhase {
    #[default]
    None,
    Running,
    Failed,
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentPhase::None => write!(f, "None"),
            DeploymentPhase::Running => write!(f, "Running"),
            DeploymentPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Status of the ArangoDeployment, owned by the controller
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArangoDeploymentStatus {
    #[serde(default)]
    pub phase: DeploymentPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Last spec accepted for reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_spec: Option<ArangoDeploymentSpec>,

    /// Checksum of `accepted_spec`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_spec_version: Option<String>,

    /// Checksum of the last spec whose plan ran to completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_version: Option<String>,

    #[serde(default, skip_serializing_if = "ConditionList::is_empty")]
    pub conditions: ConditionList,

    #[serde(default)]
    pub members: DeploymentMembers,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Plan,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency: Option<AgencyStatus>,

    /// Image every member runs once an upgrade completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_hashes: Option<SecretHashes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologyStatus>,

    /// Member count changes are paused until scaling is enabled again
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub scaling_disabled: bool,
}

/// Agent IDs known to the controller
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgencyStatus {
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Hashes of the secrets the deployment depends on
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretHashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_jwt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rocksdb_encryption_key: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum RestoreState {
    Restored,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    pub backup: String,
    pub state: RestoreState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Zone bookkeeping when topology awareness is enabled
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopologyStatus {
    pub id: String,
    pub size: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<TopologyZone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopologyZone {
    pub id: i32,
    /// Member IDs per group role abbreviation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, Vec<String>>,
}

impl TopologyStatus {
    pub fn new(spec: &TopologySpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            size: spec.zones,
            zones: (0..spec.zones)
                .map(|id| TopologyZone {
                    id,
                    members: BTreeMap::new(),
                })
                .collect(),
            label: spec.label.clone(),
        }
    }

    /// Zone with the fewest members of the group; ties go to the lowest zone
    pub fn least_used_zone(&self, group: ServerGroup) -> Option<i32> {
        self.zones
            .iter()
            .min_by_key(|z| {
                (
                    z.members
                        .get(group.as_role_abbreviated())
                        .map_or(0, Vec::len),
                    z.id,
                )
            })
            .map(|z| z.id)
    }

    pub fn add_member(&mut self, zone: i32, group: ServerGroup, id: &str) -> bool {
        let Some(z) = self.zones.iter_mut().find(|z| z.id == zone) else {
            return false;
        };
        let list = z
            .members
            .entry(group.as_role_abbreviated().to_string())
            .or_default();
        if list.iter().any(|m| m == id) {
            return false;
        }
        list.push(id.to_string());
        list.sort();
        true
    }

    pub fn remove_member(&mut self, group: ServerGroup, id: &str) -> bool {
        for zone in &mut self.zones {
            if let Some(list) = zone.members.get_mut(group.as_role_abbreviated())
                && let Some(pos) = list.iter().position(|m| m == id)
            {
                list.remove(pos);
                return true;
            }
        }
        false
    }
}
