//! Pod generation for deployment members
//!
//! Every member runs in its own pod with a single `server` container and,
//! when metrics are enabled, an `exporter` sidecar. Members of groups that
//! keep data mount their PVC at `/data`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, ContainerStatus, EmptyDirVolumeSource, PersistentVolumeClaimVolumeSource,
    Pod, PodSpec, Probe, SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use super::common::{LABEL_ZONE, internal_service_name, member_labels, owner_reference};
use crate::crd::{ArangoDeployment, ArangoDeploymentSpec, MemberStatus, ServerGroup, StorageEngine};

pub const SERVER_CONTAINER: &str = "server";
pub const EXPORTER_CONTAINER: &str = "exporter";

/// Pod annotation requesting a member restart
pub const ROTATE_ANNOTATION: &str = "deployment.arangodb.com/rotate";

const DEFAULT_EXPORTER_IMAGE: &str = "arangodb/arangodb-exporter:0.1.7";
const DEFAULT_EXPORTER_PORT: i32 = 9101;

const DATA_MOUNT: &str = "/data";
const JWT_MOUNT: &str = "/secrets/cluster/jwt";
const ENCRYPTION_MOUNT: &str = "/secrets/rocksdb/encryption";
const TLS_MOUNT: &str = "/secrets/tls";

/// Name of the pod running a member
pub fn pod_name(deployment_name: &str, group: ServerGroup, member_id: &str) -> String {
    format!(
        "{deployment_name}-{}-{}",
        group.as_role(),
        member_id.to_lowercase()
    )
}

/// Stable DNS name of a member behind the internal headless service
pub fn member_dns_name(deployment_name: &str, namespace: &str, group: ServerGroup, member_id: &str) -> String {
    format!(
        "{}.{}.{namespace}.svc",
        pod_name(deployment_name, group, member_id),
        internal_service_name(deployment_name)
    )
}

/// Inputs shared by every member pod of one deployment
pub struct PodTemplate<'a> {
    pub deployment: &'a ArangoDeployment,
    /// Accepted spec the pod is built from
    pub spec: &'a ArangoDeploymentSpec,
    /// IDs of every agent, used for agency endpoints
    pub agent_ids: Vec<String>,
    pub port: u16,
}

impl PodTemplate<'_> {
    fn scheme(&self) -> &'static str {
        if self.spec.tls_enabled() { "ssl" } else { "tcp" }
    }

    fn member_endpoint(&self, group: ServerGroup, member_id: &str) -> String {
        let name = self.deployment.name_any();
        let ns = self.deployment.namespace().unwrap_or_default();
        format!(
            "{}://{}:{}",
            self.scheme(),
            member_dns_name(&name, &ns, group, member_id),
            self.port
        )
    }

    fn agency_endpoints(&self, except: Option<&str>) -> Vec<String> {
        self.agent_ids
            .iter()
            .filter(|id| Some(id.as_str()) != except)
            .map(|id| self.member_endpoint(ServerGroup::Agents, id))
            .collect()
    }

    /// Command line of the arangod process for one member
    pub fn server_args(&self, group: ServerGroup, member: &MemberStatus) -> Vec<String> {
        let mut args = vec![
            format!("--server.endpoint={}://[::]:{}", self.scheme(), self.port),
            format!("--database.directory={DATA_MOUNT}"),
            format!(
                "--server.storage-engine={}",
                match self.spec.storage_engine() {
                    StorageEngine::RocksDB => "rocksdb",
                    StorageEngine::MMFiles => "mmfiles",
                }
            ),
        ];

        if self.spec.jwt_secret_name().is_some() {
            args.push("--server.authentication=true".to_string());
            args.push(format!("--server.jwt-secret-keyfile={JWT_MOUNT}/token"));
        } else {
            args.push("--server.authentication=false".to_string());
        }

        if self.spec.encryption_key_secret_name().is_some() {
            args.push(format!("--rocksdb.encryption-keyfile={ENCRYPTION_MOUNT}/key"));
        }

        if self.spec.tls_enabled() {
            args.push(format!("--ssl.keyfile={TLS_MOUNT}/tls.keyfile"));
        }

        let my_address = self.member_endpoint(group, &member.id);
        match group {
            ServerGroup::Single => {}
            ServerGroup::Agents => {
                args.push("--agency.activate=true".to_string());
                args.push(format!("--agency.size={}", self.spec.count(ServerGroup::Agents)));
                args.push("--agency.supervision=true".to_string());
                args.push(format!("--agency.my-address={my_address}"));
                for endpoint in self.agency_endpoints(Some(&member.id)) {
                    args.push(format!("--agency.endpoint={endpoint}"));
                }
            }
            ServerGroup::DBServers | ServerGroup::Coordinators => {
                let role = if group == ServerGroup::DBServers {
                    "PRIMARY"
                } else {
                    "COORDINATOR"
                };
                args.push(format!("--cluster.my-address={my_address}"));
                args.push(format!("--cluster.my-role={role}"));
                for endpoint in self.agency_endpoints(None) {
                    args.push(format!("--cluster.agency-endpoint={endpoint}"));
                }
            }
        }

        args
    }

    fn volumes(&self, group: ServerGroup, member: &MemberStatus) -> (Vec<Volume>, Vec<VolumeMount>) {
        let data = match (&member.pvc_name, self.spec.volume_size(group)) {
            (Some(claim), Some(_)) => Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            },
            _ => Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        };
        let mut volumes = vec![data];
        let mut mounts = vec![VolumeMount {
            name: "data".to_string(),
            mount_path: DATA_MOUNT.to_string(),
            ..Default::default()
        }];

        let mut secret_volume = |name: &str, secret: &str, path: &str| {
            volumes.push(Volume {
                name: name.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: name.to_string(),
                mount_path: path.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        };

        if let Some(secret) = self.spec.jwt_secret_name() {
            secret_volume("cluster-jwt", secret, JWT_MOUNT);
        }
        if let Some(secret) = self.spec.encryption_key_secret_name() {
            secret_volume("rocksdb-encryption", secret, ENCRYPTION_MOUNT);
        }
        if self.spec.tls_enabled() {
            let secret = format!(
                "{}-tls",
                pod_name(&self.deployment.name_any(), group, &member.id)
            );
            secret_volume("tls-keyfile", &secret, TLS_MOUNT);
        }

        (volumes, mounts)
    }

    fn exporter(&self) -> Option<Container> {
        if !self.spec.metrics_enabled() {
            return None;
        }
        let metrics = self.spec.metrics.as_ref()?;
        let port = metrics.port.unwrap_or(DEFAULT_EXPORTER_PORT);
        Some(Container {
            name: EXPORTER_CONTAINER.to_string(),
            image: Some(
                metrics
                    .image
                    .clone()
                    .unwrap_or_else(|| DEFAULT_EXPORTER_IMAGE.to_string()),
            ),
            args: Some(vec![
                format!("--arangodb.endpoint=http://127.0.0.1:{}", self.port),
                format!("--server.address=:{port}"),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("exporter".to_string()),
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        })
    }

    /// Build the pod for one member
    pub fn build(&self, group: ServerGroup, member: &MemberStatus) -> Pod {
        let deployment_name = self.deployment.name_any();
        let mut labels = member_labels(&deployment_name, group, &member.id);
        if let Some(zone) = member.zone {
            labels.insert(LABEL_ZONE.to_string(), zone.to_string());
        }

        let (volumes, volume_mounts) = self.volumes(group, member);
        let port = i32::from(self.port);

        let server = Container {
            name: SERVER_CONTAINER.to_string(),
            image: Some(self.spec.image().to_string()),
            command: Some(vec!["/usr/sbin/arangod".to_string()]),
            args: Some(self.server_args(group, member)),
            ports: Some(vec![ContainerPort {
                name: Some("server".to_string()),
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(volume_mounts),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(port),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(2),
                period_seconds: Some(10),
                failure_threshold: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut containers = vec![server];
        containers.extend(self.exporter());

        let node_selector = match (member.zone, self.spec.topology.as_ref()) {
            (Some(zone), Some(topology)) => topology
                .label
                .as_ref()
                .map(|label| BTreeMap::from([(label.clone(), zone.to_string())])),
            _ => None,
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(pod_name(&deployment_name, group, &member.id)),
                namespace: self.deployment.namespace(),
                labels: Some(labels),
                owner_references: Some(vec![owner_reference(self.deployment)]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                volumes: Some(volumes),
                hostname: Some(pod_name(&deployment_name, group, &member.id)),
                subdomain: Some(internal_service_name(&deployment_name)),
                restart_policy: Some("Always".to_string()),
                termination_grace_period_seconds: Some(match group {
                    ServerGroup::DBServers => 3600,
                    _ => 30,
                }),
                node_selector,
                ..Default::default()
            }),
            status: None,
        }
    }
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Pod reached a terminal phase and will not run again
pub fn is_pod_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

pub fn pod_restart_policy(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.restart_policy.as_deref())
}

/// Image configured for a container in the pod spec
pub fn container_image<'a>(pod: &'a Pod, container: &str) -> Option<&'a str> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)
        .and_then(|c| c.image.as_deref())
}

pub fn container_status<'a>(pod: &'a Pod, container: &str) -> Option<&'a ContainerStatus> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == container)
}

/// Pod carries the rotation request annotation
pub fn rotation_requested(pod: &Pod) -> bool {
    pod.annotations()
        .get(ROTATE_ANNOTATION)
        .is_some_and(|v| v == "true")
}
