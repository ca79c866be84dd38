//! Tests for the throttled resource snapshot

use std::sync::Arc;
use std::time::Duration;

use arango_operator::config::{OperatorConfig, ThrottleConfig};
use arango_operator::inspector::{ResourceCache, ResourceKind};
use arango_operator::kube_client::KubeClient;
use k8s_openapi::api::core::v1::Pod;
use kube::core::ObjectMeta;

use crate::common::{FakeKube, NAME, NAMESPACE, jwt_secret, test_config};

fn pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn throttled_config() -> OperatorConfig {
    OperatorConfig {
        throttles: ThrottleConfig {
            pods: Duration::from_secs(3600),
            pvcs: Duration::from_secs(3600),
            secrets: Duration::from_secs(3600),
            services: Duration::from_secs(3600),
            pdbs: Duration::from_secs(3600),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_snapshot_reflects_store() {
    let kube = Arc::new(FakeKube::new());
    kube.create_pod(NAMESPACE, &pod("example-agent-agnt-1")).await.unwrap();
    kube.insert_secret(NAMESPACE, jwt_secret("example-jwt", "token"));
    let cache = ResourceCache::new(kube.clone(), NAMESPACE, NAME, &test_config());

    assert!(!cache.snapshot().is_loaded(ResourceKind::Pod));
    cache.refresh().await.unwrap();

    let snapshot = cache.snapshot();
    assert!(snapshot.pod("example-agent-agnt-1").is_some());
    assert!(snapshot.secret("example-jwt").is_some());
    for kind in ResourceKind::ALL {
        assert!(snapshot.is_loaded(kind), "{kind} not loaded");
    }
}

#[tokio::test]
async fn test_throttled_snapshot_is_stale_until_invalidated() {
    let kube = Arc::new(FakeKube::new());
    let cache = ResourceCache::new(kube.clone(), NAMESPACE, NAME, &throttled_config());
    cache.refresh().await.unwrap();

    kube.create_pod(NAMESPACE, &pod("example-dbserver-prmr-1")).await.unwrap();
    cache.refresh().await.unwrap();
    assert!(cache.snapshot().pod("example-dbserver-prmr-1").is_none());
    assert_eq!(cache.load_count(ResourceKind::Pod), 1);

    cache.invalidate(ResourceKind::Pod);
    cache.refresh().await.unwrap();
    assert!(cache.snapshot().pod("example-dbserver-prmr-1").is_some());
    assert_eq!(cache.load_count(ResourceKind::Pod), 2);
    assert_eq!(cache.load_count(ResourceKind::Secret), 1);
}

#[tokio::test]
async fn test_older_snapshot_survives_refresh() {
    let kube = Arc::new(FakeKube::new());
    kube.create_pod(NAMESPACE, &pod("example-coordinator-crdn-1")).await.unwrap();
    let cache = ResourceCache::new(kube.clone(), NAMESPACE, NAME, &test_config());
    cache.refresh().await.unwrap();
    let before = cache.snapshot();

    kube.evict_pod(NAMESPACE, "example-coordinator-crdn-1");
    cache.refresh().await.unwrap();

    // readers holding the old snapshot keep a consistent view
    assert!(before.pod("example-coordinator-crdn-1").is_some());
    assert!(cache.snapshot().pod("example-coordinator-crdn-1").is_none());
}

#[tokio::test]
async fn test_other_namespaces_are_ignored() {
    let kube = Arc::new(FakeKube::new());
    let mut foreign = pod("example-agent-agnt-1");
    foreign.metadata.namespace = Some("other".to_string());
    kube.create_pod("other", &foreign).await.unwrap();
    let cache = ResourceCache::new(kube.clone(), NAMESPACE, NAME, &test_config());

    cache.refresh().await.unwrap();
    assert_eq!(cache.snapshot().pods().count(), 0);
}
