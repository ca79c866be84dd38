use std::sync::Arc;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use arango_operator::OperatorConfig;
use arango_operator::config::LeaderElectionConfig;
use arango_operator::health::{HealthState, run_health_server};
use arango_operator::{run_controller, run_controller_scoped};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_crypto_provider()?;
    init_tracing()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting arango-operator");

    let config = OperatorConfig::from_env()?;
    info!(
        min_interval = ?config.min_inspection_interval,
        max_interval = ?config.max_inspection_interval,
        lease = %config.leader_election.lease_name,
        "Loaded operator configuration"
    );
    let watch_namespace = std::env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty());

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    // health endpoints answer before and without leadership
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!(error = %e, "Health server stopped");
            }
        })
    };

    let (holder_id, lease_namespace) = pod_identity();
    let lease = config.leader_election.clone();
    let lock = lease_lock(&client, &lease_namespace, &holder_id, &lease);
    info!(
        holder_id = %holder_id,
        namespace = %lease_namespace,
        lease_name = %lease.lease_name,
        "Waiting for leadership"
    );
    acquire_leadership(&lock, &lease).await;
    let renewal_handle = spawn_lease_renewal(lock, lease.clone());

    let controller_handle = {
        let health_state = health_state.clone();
        let client = client.clone();
        tokio::spawn(async move {
            let result = match watch_namespace.as_deref() {
                Some(ns) => {
                    info!(namespace = ns, "Watching ArangoDeployments in one namespace");
                    run_controller_scoped(client, config, Some(health_state), Some(ns)).await
                }
                None => {
                    info!("Watching ArangoDeployments in all namespaces");
                    run_controller(client, config, Some(health_state)).await
                }
            };
            if let Err(e) = result {
                error!(error = %e, "Controller failed to start");
            }
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        // renewal only returns by panicking, losing the lease exits the process
        Err(e) = renewal_handle => {
            error!(error = %e, "Lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            health_state.set_ready(false).await;
            info!(
                grace_period = ?lease.shutdown_grace_period,
                "Not ready, letting in-flight inspections finish"
            );
            tokio::time::sleep(lease.shutdown_grace_period).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn install_crypto_provider() -> Result<(), Box<dyn std::error::Error>> {
    // a provider installed earlier in the process is fine
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }
    Ok(())
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arango_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();
    Ok(())
}

/// Holder id and namespace of the lease, taken from the downward API
fn pod_identity() -> (String, String) {
    let holder_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });
    (holder_id, namespace)
}

fn lease_lock(
    client: &Client,
    namespace: &str,
    holder_id: &str,
    lease: &LeaderElectionConfig,
) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: lease.lease_name.clone(),
            lease_ttl: lease.lease_ttl,
        },
    )
}

/// Block until this replica holds the lease
async fn acquire_leadership(lock: &LeaseLock, lease: &LeaderElectionConfig) {
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(LeaseLockResult::Acquired(_)) => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another replica holds the lease"),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
        }
        tokio::time::sleep(lease.renew_interval).await;
    }
}

/// Keep renewing the lease. A replica that loses it exits so Kubernetes
/// restarts it into a fresh election.
fn spawn_lease_renewal(lock: LeaseLock, lease: LeaderElectionConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(lease.renew_interval).await;
            match lock.try_acquire_or_renew().await {
                Ok(LeaseLockResult::Acquired(_)) => {}
                Ok(_) => {
                    error!("Lost leadership, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew lease, exiting");
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
