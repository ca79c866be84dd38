//! In-memory object store implementing [`KubeClient`]

use std::collections::BTreeMap;
use std::sync::Mutex;

use arango_operator::controller::{Error, Result};
use arango_operator::crd::{ArangoDeployment, ArangoDeploymentStatus};
use arango_operator::kube_client::KubeClient;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, Pod, PodCondition, PodStatus, Secret, Service,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;
use serde_json::Value;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Apply a JSON merge patch (RFC 7386) to `target`
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(map) = target {
        for (k, v) in patch {
            if v.is_null() {
                map.remove(k);
            } else {
                merge_patch(map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn conflict(message: String) -> Error {
    api_error(409, "AlreadyExists", message)
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(
        kube::core::Status::failure(&message, reason)
            .with_code(code)
            .boxed(),
    ))
}

#[derive(Default)]
struct Store {
    deployments: BTreeMap<Key, ArangoDeployment>,
    pods: BTreeMap<Key, Pod>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    secrets: BTreeMap<Key, Secret>,
    next_uid: u64,
    status_writes: usize,
    status_history: Vec<ArangoDeploymentStatus>,
    fail_status_writes: bool,
    status_write_code: Option<u16>,
    deleted_pods: Vec<String>,
}

/// Object store that keeps everything in maps. Label selectors are ignored;
/// every object in the namespace matches.
#[derive(Default)]
pub struct FakeKube {
    store: Mutex<Store>,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap()
    }

    pub fn insert_deployment(&self, deployment: ArangoDeployment) {
        let k = key(&deployment.namespace().unwrap(), &deployment.name_any());
        self.lock().deployments.insert(k, deployment);
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<ArangoDeployment> {
        self.lock().deployments.get(&key(namespace, name)).cloned()
    }

    pub fn remove_deployment(&self, namespace: &str, name: &str) {
        self.lock().deployments.remove(&key(namespace, name));
    }

    pub fn status(&self, namespace: &str, name: &str) -> ArangoDeploymentStatus {
        self.deployment(namespace, name)
            .and_then(|d| d.status)
            .unwrap_or_default()
    }

    pub fn set_status(&self, namespace: &str, name: &str, status: ArangoDeploymentStatus) {
        if let Some(d) = self.lock().deployments.get_mut(&key(namespace, name)) {
            d.status = Some(status);
        }
    }

    pub fn insert_secret(&self, namespace: &str, secret: Secret) {
        self.lock()
            .secrets
            .insert(key(namespace, &secret.name_any()), secret);
    }

    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        self.lock()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn pvc_names(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .pvcs
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.lock().deleted_pods.clone()
    }

    /// Remove a pod behind the controller's back
    pub fn evict_pod(&self, namespace: &str, name: &str) {
        self.lock().pods.remove(&key(namespace, name));
    }

    /// Mark every pod of the namespace ready, as the kubelet would
    pub fn set_pods_ready(&self, namespace: &str) {
        for ((ns, _), pod) in self.lock().pods.iter_mut() {
            if ns != namespace {
                continue;
            }
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    pub fn fail_status_writes(&self, fail: bool) {
        self.lock().fail_status_writes = fail;
    }

    /// Answer status writes with an API error of the given code
    pub fn reject_status_writes(&self, code: Option<u16>) {
        self.lock().status_write_code = code;
    }

    /// Every status written so far, oldest first
    pub fn status_history(&self) -> Vec<ArangoDeploymentStatus> {
        self.lock().status_history.clone()
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<ArangoDeployment>> {
        Ok(self.deployment(namespace, name))
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<ArangoDeployment> {
        let mut store = self.lock();
        let deployment = store
            .deployments
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("deployment {namespace}/{name}")))?;
        let mut value = serde_json::to_value(&*deployment)?;
        merge_patch(&mut value, patch);
        *deployment = serde_json::from_value(value)?;
        Ok(deployment.clone())
    }

    async fn patch_deployment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ArangoDeploymentStatus,
    ) -> Result<()> {
        let mut store = self.lock();
        if store.fail_status_writes {
            return Err(Error::TransientError("status write refused".to_string()));
        }
        if let Some(code) = store.status_write_code {
            return Err(api_error(code, "Rejected", format!("status of {namespace}/{name} rejected")));
        }
        let deployment = store
            .deployments
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("deployment {namespace}/{name}")))?;
        deployment.status = Some(status.clone());
        store.status_writes += 1;
        store.status_history.push(status.clone());
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
        Ok(self.pods(namespace))
    }

    async fn list_pvcs(&self, namespace: &str, _selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self
            .lock()
            .pvcs
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn list_secrets(&self, namespace: &str, _selector: &str) -> Result<Vec<Secret>> {
        Ok(self
            .lock()
            .secrets
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn list_services(&self, _namespace: &str, _selector: &str) -> Result<Vec<Service>> {
        Ok(Vec::new())
    }

    async fn list_pdbs(&self, _namespace: &str, _selector: &str) -> Result<Vec<PodDisruptionBudget>> {
        Ok(Vec::new())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.lock().secrets.get(&key(namespace, name)).cloned())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let mut store = self.lock();
        let k = key(namespace, &pod.name_any());
        if store.pods.contains_key(&k) {
            return Err(conflict(format!("pod {} already exists", pod.name_any())));
        }
        store.next_uid += 1;
        let mut created = pod.clone();
        created.metadata.uid = Some(format!("uid-{}", store.next_uid));
        created.metadata.namespace = Some(namespace.to_string());
        store.pods.insert(k, created.clone());
        Ok(created)
    }

    async fn update_pod_image(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        image: &str,
    ) -> Result<()> {
        let mut store = self.lock();
        let pod = store
            .pods
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("pod {name}")))?;
        if let Some(spec) = pod.spec.as_mut() {
            for c in spec.containers.iter_mut().filter(|c| c.name == container) {
                c.image = Some(image.to_string());
            }
        }
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut store = self.lock();
        if store.pods.remove(&key(namespace, name)).is_some() {
            store.deleted_pods.push(name.to_string());
        }
        Ok(())
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        let mut store = self.lock();
        let k = key(namespace, &pvc.name_any());
        if store.pvcs.contains_key(&k) {
            return Err(conflict(format!("pvc {} already exists", pvc.name_any())));
        }
        store.pvcs.insert(k, pvc.clone());
        Ok(())
    }

    async fn patch_pvc(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let mut store = self.lock();
        let pvc = store
            .pvcs
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("pvc {name}")))?;
        let mut value = serde_json::to_value(&*pvc)?;
        merge_patch(&mut value, patch);
        *pvc = serde_json::from_value(value)?;
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        self.lock().pvcs.remove(&key(namespace, name));
        Ok(())
    }
}
