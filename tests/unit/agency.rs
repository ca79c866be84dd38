//! Tests for the agency cache

use std::time::Duration;

use arango_operator::agency::{AgencyCache, AgencyError, ClusterAgencyCache};
use serde_json::json;

use crate::common::{AGENCY_CONFIG_PATH, AGENCY_READ_PATH, FakeCluster, FakeConnection};

const AGENTS: [&str; 3] = ["AGNT-a", "AGNT-b", "AGNT-c"];

fn agents() -> Vec<String> {
    AGENTS.iter().map(|s| s.to_string()).collect()
}

fn cache_with_agents(cluster: &std::sync::Arc<FakeCluster>) -> ClusterAgencyCache {
    let cache = ClusterAgencyCache::new(Duration::from_secs(1));
    for id in AGENTS {
        cache
            .agents()
            .insert(id, FakeConnection::new(&format!("http://{id}"), cluster.clone()));
    }
    cache
}

#[tokio::test]
async fn test_reload_at_same_index_is_a_noop() {
    let cluster = FakeCluster::new();
    cluster.set_leader("AGNT-b", &agents(), 42);
    let cache = cache_with_agents(&cluster);

    assert_eq!(cache.reload().await.unwrap(), 42);
    assert_eq!(cluster.request_count(AGENCY_READ_PATH), 1);
    let (first, valid) = cache.data();
    assert!(valid);

    assert_eq!(cache.reload().await.unwrap(), 42);
    assert_eq!(cluster.request_count(AGENCY_READ_PATH), 1);
    let (second, _) = cache.data();
    assert!(std::sync::Arc::ptr_eq(&first.unwrap(), &second.unwrap()));

    // every reload still asks all agents for their config
    assert_eq!(cluster.request_count(AGENCY_CONFIG_PATH), 6);
}

#[tokio::test]
async fn test_reload_follows_advancing_index() {
    let cluster = FakeCluster::new();
    cluster.set_leader("AGNT-a", &agents(), 1);
    let cache = cache_with_agents(&cluster);
    cache.reload().await.unwrap();

    cluster.set_tree(json!({ "Supervision": { "Maintenance": "on" }, "Target": {} }));
    cluster.set_commit_index(2);
    assert_eq!(cache.reload().await.unwrap(), 2);
    assert_eq!(cluster.request_count(AGENCY_READ_PATH), 2);
    assert!(cache.data().0.unwrap().maintenance_enabled());
    assert_eq!(cache.commit_index(), 2);
}

#[tokio::test]
async fn test_stale_index_keeps_valid_data() {
    let cluster = FakeCluster::new();
    cluster.set_leader("AGNT-a", &agents(), 10);
    let cache = cache_with_agents(&cluster);
    cache.reload().await.unwrap();

    cluster.set_commit_index(7);
    assert_eq!(cache.reload().await.unwrap(), 10);
    assert_eq!(cluster.request_count(AGENCY_READ_PATH), 1);
    assert_eq!(cache.commit_index(), 10);
}

#[tokio::test]
async fn test_failed_read_invalidates_until_next_success() {
    let cluster = FakeCluster::new();
    cluster.set_leader("AGNT-a", &agents(), 5);
    let cache = cache_with_agents(&cluster);
    cache.reload().await.unwrap();

    cluster.fail_reads(true);
    cluster.set_commit_index(6);
    let err = cache.reload().await.unwrap_err();
    assert_eq!(err.commit_index(), Some(6));
    let (data, valid) = cache.data();
    assert!(!valid);
    assert!(data.is_some());
    assert_eq!(cache.commit_index(), 5);

    // invalid data is replaced even without a newer index
    cluster.fail_reads(false);
    assert_eq!(cache.reload().await.unwrap(), 6);
    assert!(cache.data().1);
}

#[tokio::test]
async fn test_no_leader_reported() {
    let cluster = FakeCluster::new();
    let cache = cache_with_agents(&cluster);

    let err = cache.reload().await.unwrap_err();
    assert!(matches!(err, AgencyError::NoLeader));
    assert_eq!(cluster.request_count(AGENCY_READ_PATH), 0);
    assert!(cache.leader_id().is_none());
}

#[tokio::test]
async fn test_health_covers_active_agents() {
    let cluster = FakeCluster::new();
    cluster.set_leader("AGNT-c", &agents(), 3);
    let cache = cache_with_agents(&cluster);
    cache.reload().await.unwrap();

    let health = cache.health();
    assert_eq!(health.healthy(&[]), 3);
    assert_eq!(health.healthy(&["AGNT-c"]), 2);
    assert_eq!(cache.leader_id().as_deref(), Some("AGNT-c"));
    assert_eq!(cache.size(), 3);
}
