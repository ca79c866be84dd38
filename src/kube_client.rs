//! Object store access for the controller
//!
//! Every read and write the core issues against the Kubernetes API goes
//! through [`KubeClient`], so the inspection loop can run against an
//! in-memory store in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::{Error, Result};
use crate::crd::{ArangoDeployment, ArangoDeploymentStatus};
use crate::resources::FIELD_MANAGER;

/// Trait abstracting Kubernetes client operations for ArangoDeployment
///
/// List calls take a label selector; get calls return `None` when the object
/// does not exist. Deletes treat a missing object as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<ArangoDeployment>>;

    /// Apply a JSON merge patch to the deployment object
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<ArangoDeployment>;

    /// Replace the status subresource
    async fn patch_deployment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ArangoDeploymentStatus,
    ) -> Result<()>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn list_pvcs(&self, namespace: &str, selector: &str) -> Result<Vec<PersistentVolumeClaim>>;

    async fn list_secrets(&self, namespace: &str, selector: &str) -> Result<Vec<Secret>>;

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>>;

    async fn list_pdbs(&self, namespace: &str, selector: &str) -> Result<Vec<PodDisruptionBudget>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Change the image of one container in a running pod
    async fn update_pod_image(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        image: &str,
    ) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Apply a JSON merge patch to a PVC
    async fn patch_pvc(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<()>;

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Production implementation on top of `kube::Api`
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<ArangoDeployment>> {
        let api: Api<ArangoDeployment> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<ArangoDeployment> {
        let api: Api<ArangoDeployment> = self.api(namespace);
        Ok(api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_deployment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ArangoDeploymentStatus,
    ) -> Result<()> {
        let api: Api<ArangoDeployment> = self.api(namespace);
        let patch = json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = self.api(namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_pvcs(&self, namespace: &str, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_secrets(&self, namespace: &str, selector: &str) -> Result<Vec<Secret>> {
        let api: Api<Secret> = self.api(namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = self.api(namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_pdbs(&self, namespace: &str, selector: &str) -> Result<Vec<PodDisruptionBudget>> {
        let api: Api<PodDisruptionBudget> = self.api(namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let api: Api<Pod> = self.api(namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn update_pod_image(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        image: &str,
    ) -> Result<()> {
        let api: Api<Pod> = self.api(namespace);
        // Strategic merge keys containers by name, so only this container changes
        let patch = json!({
            "spec": { "containers": [ { "name": container, "image": image } ] }
        });
        api.patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = self.api(namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        match api.create(&PostParams::default(), pvc).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_pvc(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }
}
