//! Snapshot of the Kubernetes objects belonging to one deployment
//!
//! A refresh loads every due kind in parallel, verifies each listing, and only
//! then swaps the new snapshot in. Readers hold an `Arc` to the last complete
//! snapshot and never wait on a refresh in progress.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::join_all;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use super::throttle::{ResourceKind, Throttles};
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result, ResultExt};
use crate::kube_client::KubeClient;
use crate::resources::deployment_selector;

type Listing<K> = Option<Arc<BTreeMap<String, K>>>;

/// Point-in-time view of every tracked kind
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pods: Listing<Pod>,
    pvcs: Listing<PersistentVolumeClaim>,
    secrets: Listing<Secret>,
    services: Listing<Service>,
    pdbs: Listing<PodDisruptionBudget>,
}

fn values<K>(listing: &Listing<K>) -> impl Iterator<Item = &K> {
    listing.iter().flat_map(|m| m.values())
}

fn lookup<'a, K>(listing: &'a Listing<K>, name: &str) -> Option<&'a K> {
    listing.as_ref().and_then(|m| m.get(name))
}

fn by_name<K: ResourceExt>(items: Vec<K>) -> Listing<K> {
    Some(Arc::new(
        items.into_iter().map(|item| (item.name_any(), item)).collect(),
    ))
}

impl Snapshot {
    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        values(&self.pods)
    }

    pub fn pod(&self, name: &str) -> Option<&Pod> {
        lookup(&self.pods, name)
    }

    pub fn pvcs(&self) -> impl Iterator<Item = &PersistentVolumeClaim> {
        values(&self.pvcs)
    }

    pub fn pvc(&self, name: &str) -> Option<&PersistentVolumeClaim> {
        lookup(&self.pvcs, name)
    }

    pub fn secrets(&self) -> impl Iterator<Item = &Secret> {
        values(&self.secrets)
    }

    pub fn secret(&self, name: &str) -> Option<&Secret> {
        lookup(&self.secrets, name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        values(&self.services)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        lookup(&self.services, name)
    }

    pub fn pdbs(&self) -> impl Iterator<Item = &PodDisruptionBudget> {
        values(&self.pdbs)
    }

    pub fn is_loaded(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Pod => self.pods.is_some(),
            ResourceKind::PersistentVolumeClaim => self.pvcs.is_some(),
            ResourceKind::Secret => self.secrets.is_some(),
            ResourceKind::Service => self.services.is_some(),
            ResourceKind::PodDisruptionBudget => self.pdbs.is_some(),
        }
    }

    pub fn with_pods(mut self, pods: Vec<Pod>) -> Self {
        self.pods = by_name(pods);
        self
    }

    pub fn with_pvcs(mut self, pvcs: Vec<PersistentVolumeClaim>) -> Self {
        self.pvcs = by_name(pvcs);
        self
    }

    pub fn with_secrets(mut self, secrets: Vec<Secret>) -> Self {
        self.secrets = by_name(secrets);
        self
    }

    fn apply(&mut self, verified: Verified) {
        match verified {
            Verified::Pods(m) => self.pods = Some(m),
            Verified::Pvcs(m) => self.pvcs = Some(m),
            Verified::Secrets(m) => self.secrets = Some(m),
            Verified::Services(m) => self.services = Some(m),
            Verified::Pdbs(m) => self.pdbs = Some(m),
        }
    }
}

/// Raw listing as returned by the API
enum Fetched {
    Pods(Vec<Pod>),
    Pvcs(Vec<PersistentVolumeClaim>),
    Secrets(Vec<Secret>),
    Services(Vec<Service>),
    Pdbs(Vec<PodDisruptionBudget>),
}

/// Listing that passed verification, keyed by name
enum Verified {
    Pods(Arc<BTreeMap<String, Pod>>),
    Pvcs(Arc<BTreeMap<String, PersistentVolumeClaim>>),
    Secrets(Arc<BTreeMap<String, Secret>>),
    Services(Arc<BTreeMap<String, Service>>),
    Pdbs(Arc<BTreeMap<String, PodDisruptionBudget>>),
}

/// Every object must carry a name and no name may appear twice
fn index<K: ResourceExt>(kind: ResourceKind, items: Vec<K>) -> Result<Arc<BTreeMap<String, K>>> {
    let mut map = BTreeMap::new();
    for item in items {
        let Some(name) = item.meta().name.clone() else {
            return Err(Error::ValidationError(format!("{kind} without a name")));
        };
        if map.insert(name.clone(), item).is_some() {
            return Err(Error::ValidationError(format!("duplicate {kind} {name}")));
        }
    }
    Ok(Arc::new(map))
}

impl Fetched {
    fn kind(&self) -> ResourceKind {
        match self {
            Fetched::Pods(_) => ResourceKind::Pod,
            Fetched::Pvcs(_) => ResourceKind::PersistentVolumeClaim,
            Fetched::Secrets(_) => ResourceKind::Secret,
            Fetched::Services(_) => ResourceKind::Service,
            Fetched::Pdbs(_) => ResourceKind::PodDisruptionBudget,
        }
    }

    fn verify(self) -> Result<Verified> {
        let kind = self.kind();
        Ok(match self {
            Fetched::Pods(items) => Verified::Pods(index(kind, items)?),
            Fetched::Pvcs(items) => Verified::Pvcs(index(kind, items)?),
            Fetched::Secrets(items) => Verified::Secrets(index(kind, items)?),
            Fetched::Services(items) => Verified::Services(index(kind, items)?),
            Fetched::Pdbs(items) => Verified::Pdbs(index(kind, items)?),
        })
    }
}

struct CacheState {
    snapshot: Arc<Snapshot>,
    throttles: Throttles,
}

pub struct ResourceCache {
    client: Arc<dyn KubeClient>,
    namespace: String,
    selector: String,
    pool_size: usize,
    state: Mutex<CacheState>,
}

impl ResourceCache {
    pub fn new(
        client: Arc<dyn KubeClient>,
        namespace: &str,
        deployment_name: &str,
        config: &OperatorConfig,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            selector: deployment_selector(deployment_name),
            pool_size: config.worker_pool_size.max(1),
            state: Mutex::new(CacheState {
                snapshot: Arc::new(Snapshot::default()),
                throttles: Throttles::new(&config.throttles),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last complete snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.lock().snapshot.clone()
    }

    /// Force the next refresh to load `kind`
    pub fn invalidate(&self, kind: ResourceKind) {
        self.lock().throttles.get_mut(kind).invalidate();
    }

    /// Number of completed loads for `kind`
    pub fn load_count(&self, kind: ResourceKind) -> u64 {
        self.lock().throttles.get(kind).count()
    }

    #[instrument(skip(self), fields(namespace = %self.namespace, selector = %self.selector))]
    pub async fn refresh(&self) -> Result<()> {
        let (current, throttles) = {
            let state = self.lock();
            (state.snapshot.clone(), state.throttles.clone())
        };

        let now = Instant::now();
        let due: Vec<(ResourceKind, u64)> = ResourceKind::ALL
            .into_iter()
            .filter(|kind| !current.is_loaded(*kind) || throttles.get(*kind).is_due(now))
            .map(|kind| (kind, throttles.get(kind).generation()))
            .collect();

        if due.is_empty() {
            debug!("All resource kinds throttled, keeping snapshot");
            return Ok(());
        }

        let semaphore = Semaphore::new(self.pool_size);
        let fetches = due.iter().map(|(kind, _)| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| Error::TransientError(e.to_string()))?;
                self.fetch(*kind)
                    .await
                    .context(format!("Loading {kind} listing failed"))
            }
        });
        let fetched = join_all(fetches).await;

        let mut next = (*current).clone();
        for result in fetched {
            next.apply(result?.verify()?);
        }

        // throttles may have been invalidated while the listings were loading
        let mut state = self.lock();
        for (kind, generation) in &due {
            state.throttles.get_mut(*kind).loaded(now, *generation);
        }
        state.snapshot = Arc::new(next);
        debug!(kinds = due.len(), "Resource snapshot swapped");
        Ok(())
    }

    async fn fetch(&self, kind: ResourceKind) -> Result<Fetched> {
        let ns = self.namespace.as_str();
        let selector = self.selector.as_str();
        Ok(match kind {
            ResourceKind::Pod => Fetched::Pods(self.client.list_pods(ns, selector).await?),
            ResourceKind::PersistentVolumeClaim => {
                Fetched::Pvcs(self.client.list_pvcs(ns, selector).await?)
            }
            // Referenced secrets are created by users and carry no deployment labels
            ResourceKind::Secret => Fetched::Secrets(self.client.list_secrets(ns, "").await?),
            ResourceKind::Service => {
                Fetched::Services(self.client.list_services(ns, selector).await?)
            }
            ResourceKind::PodDisruptionBudget => {
                Fetched::Pdbs(self.client.list_pdbs(ns, selector).await?)
            }
        })
    }
}
