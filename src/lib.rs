pub mod agency;
pub mod client;
pub mod clock;
pub mod config;
pub mod controller;
pub mod crd;
pub mod events;
pub mod health;
pub mod inspector;
pub mod kube_client;
pub mod members;
pub mod reconcile;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{BackoffConfig, Context, Error, FINALIZER, Result, error_policy, reconcile};
pub use crd::{ArangoDeployment, ArangoDeploymentSpec, ArangoDeploymentStatus};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::client::HttpConnectionFactory;
use crate::events::KubeEventPublisher;
use crate::kube_client::KubeClientImpl;

/// Name used as the reporting controller of events
pub const CONTROLLER_NAME: &str = "arango-operator";

/// Namespaced API when a watch namespace is set, cluster-wide otherwise
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watch ArangoDeployments in every namespace
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) -> Result<()> {
    run_controller_scoped(client, config, health_state, None).await
}

/// Watch ArangoDeployments and run an inspection tick for each of them.
///
/// Pods and PVCs owned by a deployment requeue it when they change. Returns
/// only when the watch stream ends.
pub async fn run_controller_scoped(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) -> Result<()> {
    tracing::info!(
        scope = namespace.unwrap_or("cluster-wide"),
        workers = config.worker_pool_size,
        "Starting ArangoDeployment controller"
    );

    let connections = HttpConnectionFactory::new(config.member_request_timeout)
        .map_err(|e| Error::InvalidConfig(format!("member client: {e}")))?;
    let ctx = Arc::new(Context::new(
        Arc::new(KubeClientImpl::new(client.clone())),
        config,
        Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
        Arc::new(connections),
        health_state.clone(),
    )?);

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let deployments: Api<ArangoDeployment> = scoped_api(client.clone(), namespace);
    let pods: Api<Pod> = scoped_api(client.clone(), namespace);
    let pvcs: Api<PersistentVolumeClaim> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(deployments, watcher_config.clone())
        .owns(pods, watcher_config.clone())
        .owns(pvcs, watcher_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(deployment = %obj, ?action, "Inspection finished");
                }
                // owned objects can outlive their deployment by a few events
                Err(kube::runtime::controller::Error::ReconcilerFailed(err, obj))
                    if err.is_not_found() =>
                {
                    tracing::debug!(deployment = %obj, "Deployment is gone");
                }
                Err(e) => tracing::error!(error = ?e, "Inspection failed"),
            }
        })
        .await;

    tracing::error!("Controller stream ended");
    Ok(())
}
