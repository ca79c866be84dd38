//! Health server for Kubernetes liveness and readiness checks and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness check (is the process alive?)
//! - `/readyz` - Readiness check (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Metric, Registry};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels identifying one deployment
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DeploymentLabels {
    pub namespace: String,
    pub name: String,
}

impl DeploymentLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl prometheus_client::encoding::EncodeLabelSet for DeploymentLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for plan action metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ActionLabels {
    pub namespace: String,
    pub name: String,
    pub action: String,
    pub outcome: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ActionLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("action", self.action.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total inspection ticks
    pub reconciliations_total: Family<DeploymentLabels, Counter>,
    /// Failed inspection ticks
    pub reconciliation_errors_total: Family<DeploymentLabels, Counter>,
    pub reconcile_duration_seconds: Family<DeploymentLabels, Histogram>,

    // Agency cache
    pub agency_fetches_total: Family<DeploymentLabels, Counter>,
    pub agency_fetch_failures_total: Family<DeploymentLabels, Counter>,
    pub agency_commit_index: Family<DeploymentLabels, Gauge>,

    // Plan
    pub plan_actions_total: Family<ActionLabels, Counter>,
    pub plan_length: Family<DeploymentLabels, Gauge>,

    // Members
    pub members_desired: Family<DeploymentLabels, Gauge>,
    pub members_ready: Family<DeploymentLabels, Gauge>,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Register `metric` under `name` and hand back a handle to it
fn registered<M: Metric + Clone>(
    registry: &mut Registry,
    name: &str,
    help: &str,
    metric: M,
) -> M {
    registry.register(name, help, metric.clone());
    metric
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("arango_operator");
        let r = &mut registry;

        let reconcile_duration_seconds =
            Family::<DeploymentLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });

        Self {
            reconciliations_total: registered(
                r,
                "reconciliations",
                "Total number of inspection ticks",
                Family::default(),
            ),
            reconciliation_errors_total: registered(
                r,
                "reconciliation_errors",
                "Total number of failed inspection ticks",
                Family::default(),
            ),
            reconcile_duration_seconds: registered(
                r,
                "reconcile_duration_seconds",
                "Duration of an inspection tick in seconds",
                reconcile_duration_seconds,
            ),
            agency_fetches_total: registered(
                r,
                "agency_fetches",
                "Agency cache reloads",
                Family::default(),
            ),
            agency_fetch_failures_total: registered(
                r,
                "agency_fetch_failures",
                "Agency cache reloads that failed",
                Family::default(),
            ),
            agency_commit_index: registered(
                r,
                "agency_commit_index",
                "Commit index of the cached agency tree",
                Family::default(),
            ),
            plan_actions_total: registered(
                r,
                "plan_actions",
                "Plan actions by type and outcome",
                Family::default(),
            ),
            plan_length: registered(
                r,
                "plan_length",
                "Actions left in the persisted plan",
                Family::default(),
            ),
            members_desired: registered(
                r,
                "members_desired",
                "Desired number of members",
                Family::default(),
            ),
            members_ready: registered(
                r,
                "members_ready",
                "Members that are ready",
                Family::default(),
            ),
            registry,
        }
    }

    /// Record a successful inspection tick
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = DeploymentLabels::new(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed inspection tick
    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&DeploymentLabels::new(namespace, name))
            .inc();
    }

    /// Record one agency reload and the commit index it ended at
    pub fn record_agency_fetch(&self, namespace: &str, name: &str, commit_index: Option<u64>) {
        let labels = DeploymentLabels::new(namespace, name);
        self.agency_fetches_total.get_or_create(&labels).inc();
        match commit_index {
            Some(index) => {
                self.agency_commit_index
                    .get_or_create(&labels)
                    .set(i64::try_from(index).unwrap_or(i64::MAX));
            }
            None => {
                self.agency_fetch_failures_total.get_or_create(&labels).inc();
            }
        }
    }

    pub fn record_action(&self, namespace: &str, name: &str, action: &str, outcome: &str) {
        let labels = ActionLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
        };
        self.plan_actions_total.get_or_create(&labels).inc();
    }

    pub fn set_plan_length(&self, namespace: &str, name: &str, length: usize) {
        self.plan_length
            .get_or_create(&DeploymentLabels::new(namespace, name))
            .set(i64::try_from(length).unwrap_or(i64::MAX));
    }

    pub fn set_members(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = DeploymentLabels::new(namespace, name);
        self.members_desired.get_or_create(&labels).set(desired);
        self.members_ready.get_or_create(&labels).set(ready);
    }

    /// Prometheus text exposition, empty if encoding failed
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (leading and watching)
    pub ready: RwLock<bool>,
    pub metrics: Metrics,
    /// Last successful tick, seconds since the epoch
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness handler
///
/// Returns 503 Service Unavailable until the controller is running.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    tracing::info!("Health server listening on 0.0.0.0:8080");

    axum::serve(listener, app).await
}
