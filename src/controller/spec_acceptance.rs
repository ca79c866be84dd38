//! Acceptance of a new deployment spec
//!
//! A spec goes through three gates before the controller works towards it:
//! defaults are written back to the object, fields that may not change are
//! reverted to their accepted values, and the result is validated. Only then
//! is it recorded in `status.acceptedSpec`.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use kube::runtime::events::EventType;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::controller::error::{Result, ResultExt};
use crate::controller::status::StatusManager;
use crate::controller::validation::{validate_spec, validate_spec_change};
use crate::crd::{ArangoDeployment, ArangoDeploymentSpec, ArangoDeploymentStatus};
use crate::events::{EventPublisher, actions, reasons};
use crate::kube_client::KubeClient;

/// What happened to the spec during this tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acceptance {
    /// Spec matches the accepted version
    Unchanged,
    /// Spec was accepted and recorded in the status
    Accepted,
    /// The object was patched; its next version is inspected instead
    Patched,
    /// Spec failed validation; the accepted spec stays in effect
    Rejected(String),
}

pub struct SpecAcceptor<'a> {
    pub kube: &'a dyn KubeClient,
    pub events: &'a dyn EventPublisher,
    pub namespace: &'a str,
    pub name: &'a str,
}

impl SpecAcceptor<'_> {
    pub async fn accept(
        &self,
        deployment: &ArangoDeployment,
        status: &mut ArangoDeploymentStatus,
        status_manager: &StatusManager<'_>,
    ) -> Result<Acceptance> {
        let object = deployment.object_ref(&());

        let mut spec = deployment.spec.clone();
        spec.set_defaults(self.name);
        if spec != deployment.spec {
            info!(name = self.name, "Writing spec defaults");
            self.kube
                .patch_deployment(self.namespace, self.name, &json!({ "spec": spec }))
                .await
                .context("Applying spec defaults")?;
            return Ok(Acceptance::Patched);
        }

        let checksum = spec.checksum()?;
        if status.accepted_spec_version.as_deref() == Some(checksum.as_str()) {
            return Ok(Acceptance::Unchanged);
        }

        if let Some(accepted) = &status.accepted_spec {
            let reverted = spec.reset_immutable_fields(accepted);
            if !reverted.is_empty() {
                warn!(fields = ?reverted, "Reverting immutable fields");
                self.kube
                    .patch_deployment(self.namespace, self.name, &immutable_fields_patch(&spec, &reverted))
                    .await
                    .context("Reverting immutable fields")?;
                self.publish(
                    &object,
                    EventType::Warning,
                    reasons::IMMUTABLE_FIELD_RESET,
                    format!("reverted {}", reverted.join(", ")),
                )
                .await;
                return Ok(Acceptance::Patched);
            }
        }

        if let Err(e) = self.validate(&spec, status.accepted_spec.as_ref()) {
            let message = e.to_string();
            warn!(error = %message, "Spec rejected");
            self.publish(&object, EventType::Warning, reasons::SPEC_INVALID, message.clone())
                .await;
            return Ok(Acceptance::Rejected(message));
        }

        status.accepted_spec = Some(spec);
        status.accepted_spec_version = Some(checksum.clone());
        status_manager.update(status).await?;
        info!(version = %checksum, "Spec accepted");
        self.publish(
            &object,
            EventType::Normal,
            reasons::SPEC_ACCEPTED,
            format!("accepted spec version {checksum}"),
        )
        .await;
        Ok(Acceptance::Accepted)
    }

    fn validate(&self, spec: &ArangoDeploymentSpec, accepted: Option<&ArangoDeploymentSpec>) -> Result<()> {
        validate_spec(spec)?;
        if let Some(accepted) = accepted {
            validate_spec_change(accepted, spec)?;
        }
        Ok(())
    }

    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, note: String) {
        self.events
            .publish(object, type_, reason, actions::ACCEPT_SPEC, Some(note))
            .await;
    }
}

/// Merge patch that writes the reverted fields back, with `null` for unset ones
fn immutable_fields_patch(spec: &ArangoDeploymentSpec, reverted: &[&str]) -> Value {
    let mut fields = Map::new();
    if reverted.contains(&"spec.mode") {
        fields.insert("mode".to_string(), json!(spec.mode));
    }
    if reverted.contains(&"spec.storageEngine") {
        fields.insert("storageEngine".to_string(), json!(spec.storage_engine));
    }
    if reverted.contains(&"spec.rocksdb.encryption.keySecretName") {
        let key_secret_name = spec
            .rocksdb
            .as_ref()
            .and_then(|r| r.encryption.as_ref())
            .and_then(|e| e.key_secret_name.clone());
        fields.insert(
            "rocksdb".to_string(),
            json!({ "encryption": { "keySecretName": key_secret_name } }),
        );
    }
    json!({ "spec": fields })
}
