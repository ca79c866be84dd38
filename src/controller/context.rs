use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::agency::{AgencyCache, new_cache};
use crate::client::{ClientCache, ConnectionFactory};
use crate::clock::{Clock, SystemClock};
use crate::config::OperatorConfig;
use crate::controller::error::{BackoffConfig, ErrorContext, Result};
use crate::crd::DeploymentMode;
use crate::events::EventPublisher;
use crate::health::HealthState;
use crate::inspector::ResourceCache;
use crate::kube_client::KubeClient;
use crate::members::MemberStateTracker;
use crate::reconcile::ActionRegistry;

/// Long lived state of one deployment, kept across inspection ticks
pub struct DeploymentHandle {
    pub mode: DeploymentMode,
    pub resources: ResourceCache,
    pub agency: Arc<dyn AgencyCache>,
    pub members: MemberStateTracker,
    pub clients: ClientCache,
    errors: Mutex<ErrorContext>,
}

impl DeploymentHandle {
    fn new(ctx: &Context, namespace: &str, name: &str, mode: DeploymentMode) -> Self {
        Self {
            mode,
            resources: ResourceCache::new(ctx.kube.clone(), namespace, name, &ctx.config),
            agency: new_cache(mode, ctx.config.agency_request_timeout),
            members: MemberStateTracker::new(ctx.config.member_request_timeout),
            clients: ClientCache::new(ctx.connections.clone(), name, namespace, &ctx.config),
            errors: Mutex::new(ErrorContext::default()),
        }
    }

    pub fn errors(&self) -> MutexGuard<'_, ErrorContext> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared context for the controller
pub struct Context {
    pub kube: Arc<dyn KubeClient>,
    pub config: OperatorConfig,
    pub registry: ActionRegistry,
    pub events: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
    pub connections: Arc<dyn ConnectionFactory>,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
    pub backoff: BackoffConfig,
    handles: Mutex<HashMap<(String, String), Arc<DeploymentHandle>>>,
}

impl Context {
    pub fn new(
        kube: Arc<dyn KubeClient>,
        config: OperatorConfig,
        events: Arc<dyn EventPublisher>,
        connections: Arc<dyn ConnectionFactory>,
        health_state: Option<Arc<HealthState>>,
    ) -> Result<Self> {
        let registry = ActionRegistry::with_defaults(config.default_action_timeout)?;
        let backoff =
            BackoffConfig::between(config.min_inspection_interval, config.max_inspection_interval);
        Ok(Self {
            kube,
            config,
            registry,
            events,
            clock: Arc::new(SystemClock),
            connections,
            health_state,
            backoff,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the wall clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), Arc<DeploymentHandle>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle of a deployment, created on first use. A handle built for a
    /// different mode is replaced.
    pub fn handle(&self, namespace: &str, name: &str, mode: DeploymentMode) -> Arc<DeploymentHandle> {
        let key = (namespace.to_string(), name.to_string());
        let mut handles = self.lock();
        if let Some(handle) = handles.get(&key)
            && handle.mode == mode
        {
            return handle.clone();
        }
        debug!(namespace, name, ?mode, "Creating deployment handle");
        let handle = Arc::new(DeploymentHandle::new(self, namespace, name, mode));
        handles.insert(key, handle.clone());
        handle
    }

    /// Existing handle of a deployment
    pub fn existing_handle(&self, namespace: &str, name: &str) -> Option<Arc<DeploymentHandle>> {
        self.lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Drop the caches of a deployment that went away
    pub fn forget(&self, namespace: &str, name: &str) {
        self.lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}
