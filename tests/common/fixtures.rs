//! Builders for deployments and a harness that drives inspection ticks
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let env = TestEnv::new(cluster_deployment("example"));
//! env.settle(30).await;
//! assert!(env.status().conditions.is_true(ConditionType::UpToDate));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arango_operator::clock::ManualClock;
use arango_operator::config::{OperatorConfig, ThrottleConfig};
use arango_operator::controller::interval::Interval;
use arango_operator::controller::{Context, Result, inspect_deployment};
use arango_operator::crd::{
    ArangoDeployment, ArangoDeploymentSpec, ArangoDeploymentStatus, ConditionType, DeploymentMode,
    ServerGroup, ServerGroupSpec,
};
use arango_operator::events::RecordingEventPublisher;
use chrono::{TimeZone, Utc};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::core::ObjectMeta;

use super::fake_cluster::{FakeCluster, FakeConnectionFactory};
use super::fake_kube::FakeKube;

pub const NAMESPACE: &str = "db";
pub const NAME: &str = "example";

// =============================================================================
// Deployment builders
// =============================================================================

pub fn deployment(name: &str, spec: ArangoDeploymentSpec) -> ArangoDeployment {
    ArangoDeployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(format!("{name}-uid")),
            generation: Some(1),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Cluster deployment with default group sizes
pub fn cluster_deployment(name: &str) -> ArangoDeployment {
    deployment(
        name,
        ArangoDeploymentSpec {
            mode: Some(DeploymentMode::Cluster),
            image: Some("arangodb/arangodb:3.11.8".to_string()),
            ..Default::default()
        },
    )
}

pub fn single_deployment(name: &str) -> ArangoDeployment {
    deployment(
        name,
        ArangoDeploymentSpec {
            mode: Some(DeploymentMode::Single),
            image: Some("arangodb/arangodb:3.11.8".to_string()),
            ..Default::default()
        },
    )
}

/// Defaulted cluster spec with the given number of dbservers
pub fn cluster_spec(dbservers: i32) -> ArangoDeploymentSpec {
    let mut spec = ArangoDeploymentSpec {
        mode: Some(DeploymentMode::Cluster),
        image: Some("arangodb/arangodb:3.11.8".to_string()),
        dbservers: Some(ServerGroupSpec {
            count: Some(dbservers),
            ..Default::default()
        }),
        ..Default::default()
    };
    spec.set_defaults(NAME);
    spec
}

pub fn jwt_secret(name: &str, token: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "token".to_string(),
            ByteString(token.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Configuration without refresh throttles, so every tick sees the store
pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        throttles: ThrottleConfig {
            pods: Duration::ZERO,
            pvcs: Duration::ZERO,
            secrets: Duration::ZERO,
            services: Duration::ZERO,
            pdbs: Duration::ZERO,
        },
        ..Default::default()
    }
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

// =============================================================================
// Inspection harness
// =============================================================================

pub struct TestEnv {
    pub kube: Arc<FakeKube>,
    pub cluster: Arc<FakeCluster>,
    pub events: Arc<RecordingEventPublisher>,
    pub clock: Arc<ManualClock>,
    pub ctx: Context,
}

impl TestEnv {
    pub fn new(deployment: ArangoDeployment) -> Self {
        let kube = Arc::new(FakeKube::new());
        let name = deployment.metadata.name.clone().unwrap_or_default();
        kube.insert_deployment(deployment);
        kube.insert_secret(NAMESPACE, jwt_secret(&format!("{name}-jwt"), "s3cr3t"));

        let cluster = FakeCluster::new();
        let events = Arc::new(RecordingEventPublisher::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let ctx = Context::new(
            kube.clone(),
            test_config(),
            events.clone(),
            Arc::new(FakeConnectionFactory {
                cluster: cluster.clone(),
            }),
            None,
        )
        .unwrap()
        .with_clock(clock.clone());

        Self {
            kube,
            cluster,
            events,
            clock,
            ctx,
        }
    }

    pub async fn tick(&self) -> Result<Option<Interval>> {
        inspect_deployment(&self.ctx, NAMESPACE, NAME).await
    }

    pub fn deployment(&self) -> ArangoDeployment {
        self.kube.deployment(NAMESPACE, NAME).unwrap()
    }

    pub fn status(&self) -> ArangoDeploymentStatus {
        self.kube.status(NAMESPACE, NAME)
    }

    /// Play kubelet and database after a tick: pods become ready, the first
    /// agent leads the agency and every member is reported healthy.
    pub fn bring_up_members(&self) {
        self.kube.set_pods_ready(NAMESPACE);

        let status = self.status();
        let agents = status.members.ids(ServerGroup::Agents);
        if let Some(leader) = agents.first()
            && self.cluster.commit_index() == 0
        {
            self.cluster.set_leader(leader, &agents, 1);
        }
        let ids: Vec<String> = status.members.iter().map(|(_, m)| m.id.clone()).collect();
        self.cluster.mark_good(ids.iter().map(String::as_str));
    }

    /// Whether the stored spec is accepted, fully applied and up to date
    pub fn is_settled(&self) -> bool {
        let deployment = self.deployment();
        let status = deployment.status.clone().unwrap_or_default();
        let checksum = deployment.spec.checksum().unwrap();
        status.plan.is_empty()
            && status.accepted_spec_version.as_deref() == Some(checksum.as_str())
            && status.applied_version == status.accepted_spec_version
            && status.conditions.is_true(ConditionType::UpToDate)
    }

    /// Tick until the deployment settles. Returns the number of ticks.
    pub async fn settle(&self, max_ticks: usize) -> usize {
        for tick in 1..=max_ticks {
            self.tick().await.unwrap();
            self.bring_up_members();
            if self.is_settled() {
                return tick;
            }
        }
        panic!(
            "deployment did not settle within {max_ticks} ticks: {:#?}",
            self.status()
        );
    }
}
