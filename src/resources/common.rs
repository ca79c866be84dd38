//! Common utilities for Kubernetes resource generation
//!
//! Names, labels and owner references shared by every object the operator
//! creates on behalf of an ArangoDeployment.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::{ArangoDeployment, ServerGroup};

/// API version for ArangoDeployment CRD
pub const API_VERSION: &str = "database.arangodb.com/v1";

/// Kind for ArangoDeployment CRD
pub const KIND: &str = "ArangoDeployment";

/// Operator field manager name for status patches
pub const FIELD_MANAGER: &str = "arango-operator";

pub const LABEL_APP: &str = "app";
pub const LABEL_DEPLOYMENT: &str = "arango_deployment";
pub const LABEL_ROLE: &str = "role";
pub const LABEL_MEMBER: &str = "arango_member";
pub const LABEL_ZONE: &str = "deployment.arangodb.com/zone";

/// Generate an owner reference for an ArangoDeployment
///
/// Pods and PVCs created for members are garbage collected with the
/// deployment.
pub fn owner_reference(deployment: &ArangoDeployment) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: deployment.name_any(),
        uid: deployment.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels carried by every object belonging to a deployment
pub fn standard_labels(deployment_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), "arangodb".to_string()),
        (LABEL_DEPLOYMENT.to_string(), deployment_name.to_string()),
    ])
}

/// Labels for the pod and volume of one member
pub fn member_labels(deployment_name: &str, group: ServerGroup, member_id: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(deployment_name);
    labels.insert(LABEL_ROLE.to_string(), group.as_role().to_string());
    labels.insert(LABEL_MEMBER.to_string(), member_id.to_lowercase());
    labels
}

/// Label selector matching every object of a deployment
pub fn deployment_selector(deployment_name: &str) -> String {
    format!("{LABEL_DEPLOYMENT}={deployment_name}")
}

/// Headless service that gives members stable DNS names
pub fn internal_service_name(deployment_name: &str) -> String {
    format!("{deployment_name}-int")
}
