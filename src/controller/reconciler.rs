//! Reconciliation entry points for ArangoDeployment resources
//!
//! `reconcile` is called by the kube-runtime controller for every change and
//! requeue. It handles finalizers, then runs one inspection tick under the
//! reconciliation deadline and turns its interval into a requeue.

use std::sync::Arc;
use std::time::Instant;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result, ResultExt};
use crate::controller::inspection::inspect_deployment;
use crate::crd::ArangoDeployment;
use crate::events::{actions, reasons};

/// Finalizer name for cleanup
pub const FINALIZER: &str = "database.arangodb.com/finalizer";

/// Main reconciliation function
#[instrument(skip(deployment, ctx), fields(name = %deployment.name_any(), namespace = deployment.namespace().unwrap_or_default()))]
pub async fn reconcile(deployment: Arc<ArangoDeployment>, ctx: Arc<Context>) -> Result<Action> {
    let ns = deployment.namespace().unwrap_or_default();
    let name = deployment.name_any();

    if deployment.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&deployment, &ctx, &ns).await;
    }

    if !has_finalizer(&deployment) {
        add_finalizer(&deployment, &ctx, &ns).await?;
        return Ok(Action::requeue(ctx.config.min_inspection_interval));
    }

    let started = Instant::now();
    let result = tokio::time::timeout(
        ctx.config.reconciliation_timeout,
        inspect_deployment(&ctx, &ns, &name),
    )
    .await;

    match result {
        Ok(Ok(Some(interval))) => {
            if let Some(handle) = ctx.existing_handle(&ns, &name) {
                handle.errors().reset();
            }
            if let Some(health) = &ctx.health_state {
                health
                    .metrics
                    .record_reconcile(&ns, &name, started.elapsed().as_secs_f64());
                health.last_reconcile.store(
                    u64::try_from(ctx.clock.now().timestamp()).unwrap_or(0),
                    std::sync::atomic::Ordering::Relaxed,
                );
            }
            debug!(requeue = %interval, "Inspection finished");
            Ok(Action::requeue(interval.duration()))
        }
        Ok(Ok(None)) => Ok(Action::await_change()),
        Ok(Err(e)) => {
            error!("Inspection failed: {}", e);
            if let Some(handle) = ctx.existing_handle(&ns, &name) {
                handle.errors().record_error(&e);
            }
            if let Some(health) = &ctx.health_state {
                health.metrics.record_error(&ns, &name);
            }
            // transient errors are retried on the next tick without an event
            if !e.is_retryable() {
                ctx.events
                    .publish(
                        &deployment.object_ref(&()),
                        EventType::Warning,
                        reasons::INSPECTION_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
            }
            Err(e)
        }
        Err(_) => {
            warn!(
                timeout = ?ctx.config.reconciliation_timeout,
                "Inspection exceeded its deadline"
            );
            Ok(Action::requeue(ctx.config.min_inspection_interval))
        }
    }
}

/// Error policy for the controller with exponential backoff
///
/// The delay grows with the number of consecutive failed ticks of the
/// deployment, from the minimum towards the maximum inspection interval.
pub fn error_policy(deployment: Arc<ArangoDeployment>, error: &Error, ctx: Arc<Context>) -> Action {
    let ns = deployment.namespace().unwrap_or_default();
    let name = deployment.name_any();

    let attempt = ctx
        .existing_handle(&ns, &name)
        .map(|h| h.errors().consecutive_errors.saturating_sub(1))
        .unwrap_or(0);
    let delay = ctx.backoff.delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

fn has_finalizer(deployment: &ArangoDeployment) -> bool {
    deployment.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer(deployment: &ArangoDeployment, ctx: &Context, ns: &str) -> Result<()> {
    let name = deployment.name_any();
    let mut finalizers = deployment.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());

    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    ctx.kube
        .patch_deployment(ns, &name, &patch)
        .await
        .context("Adding finalizer")?;

    info!("Added finalizer to {}", name);
    Ok(())
}

async fn handle_deletion(deployment: &ArangoDeployment, ctx: &Context, ns: &str) -> Result<Action> {
    let name = deployment.name_any();
    info!("Handling deletion of {}", name);

    // Pods and volumes carry owner references and are garbage collected
    ctx.forget(ns, &name);

    if has_finalizer(deployment) {
        let remaining: Vec<&String> = deployment
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .collect();
        let finalizers = if remaining.is_empty() {
            Value::Null
        } else {
            json!(remaining)
        };
        let patch = json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        ctx.kube
            .patch_deployment(ns, &name, &patch)
            .await
            .context("Removing finalizer")?;

        info!("Removed finalizer from {}", name);
    }

    Ok(Action::await_change())
}
