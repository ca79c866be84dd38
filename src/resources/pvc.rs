//! PersistentVolumeClaim generation and size helpers

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use super::common::{member_labels, owner_reference};
use super::pod::pod_name;
use crate::crd::{ArangoDeployment, ArangoDeploymentSpec, ServerGroup};

/// Name of the claim holding a member's data
pub fn pvc_name(deployment_name: &str, group: ServerGroup, member_id: &str) -> String {
    format!("{}-data", pod_name(deployment_name, group, member_id))
}

/// Build the data claim for a member, or `None` if the group keeps no data
pub fn build_pvc(
    deployment: &ArangoDeployment,
    spec: &ArangoDeploymentSpec,
    group: ServerGroup,
    member_id: &str,
) -> Option<PersistentVolumeClaim> {
    let size = spec.volume_size(group)?;
    let deployment_name = deployment.name_any();
    let storage_class_name = spec
        .group_spec(group)
        .and_then(|g| g.storage_class_name.clone());

    Some(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(&deployment_name, group, member_id)),
            namespace: deployment.namespace(),
            labels: Some(member_labels(&deployment_name, group, member_id)),
            owner_references: Some(vec![owner_reference(deployment)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            storage_class_name,
            ..Default::default()
        }),
        status: None,
    })
}

/// Parse a Kubernetes quantity such as `8Gi` or `500M` into bytes
pub fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => return None,
    };

    let bytes = (number * multiplier).ceil();
    if bytes.is_finite() && bytes >= 0.0 {
        Some(bytes as u64)
    } else {
        None
    }
}

/// Storage requested by the claim, in bytes
pub fn requested_size(pvc: &PersistentVolumeClaim) -> Option<u64> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .and_then(|q| parse_quantity(&q.0))
}

/// Storage actually provisioned for the claim, in bytes
pub fn capacity(pvc: &PersistentVolumeClaim) -> Option<u64> {
    pvc.status
        .as_ref()?
        .capacity
        .as_ref()?
        .get("storage")
        .and_then(|q| parse_quantity(&q.0))
}
