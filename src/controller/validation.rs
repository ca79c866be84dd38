//! Validation of ArangoDeployment specs
//!
//! A spec is validated on its own before it is accepted, and then against
//! the previously accepted spec:
//! - member counts per mode
//! - volume sizes
//! - fields that may not change once a deployment runs

use crate::controller::error::{Error, Result};
use crate::crd::{ArangoDeploymentSpec, DeploymentMode, ServerGroup};
use crate::resources::pvc::parse_quantity;

/// Minimum number of members in any group of a cluster
pub const MIN_MEMBERS: i32 = 1;

/// Maximum number of members in a single group
pub const MAX_MEMBERS: i32 = 100;

/// Validate a spec on its own. Defaults are expected to be applied.
pub fn validate_spec(spec: &ArangoDeploymentSpec) -> Result<()> {
    validate_counts(spec)?;
    validate_volumes(spec)?;
    if spec.image().trim().is_empty() {
        return Err(Error::ValidationError("image must not be empty".to_string()));
    }
    if let Some(topology) = &spec.topology
        && topology.zones < 1
    {
        return Err(Error::ValidationError(format!(
            "topology needs at least one zone, got {}",
            topology.zones
        )));
    }
    Ok(())
}

fn validate_counts(spec: &ArangoDeploymentSpec) -> Result<()> {
    match spec.mode() {
        DeploymentMode::Single => {
            let count = spec.count(ServerGroup::Single);
            if count != 1 {
                return Err(Error::ValidationError(format!(
                    "single mode runs exactly one server, got {count}"
                )));
            }
        }
        DeploymentMode::Cluster => {
            for &group in spec.groups() {
                let count = spec.count(group);
                if !(MIN_MEMBERS..=MAX_MEMBERS).contains(&count) {
                    return Err(Error::ValidationError(format!(
                        "{group} count {count} is outside {MIN_MEMBERS}..={MAX_MEMBERS}"
                    )));
                }
            }
            let agents = spec.count(ServerGroup::Agents);
            if agents % 2 == 0 {
                return Err(Error::ValidationError(format!(
                    "agent count must be odd, got {agents}"
                )));
            }
        }
    }
    Ok(())
}

fn validate_volumes(spec: &ArangoDeploymentSpec) -> Result<()> {
    for &group in spec.groups() {
        if let Some(size) = spec.volume_size(group) {
            match parse_quantity(size) {
                Some(bytes) if bytes > 0 => {}
                _ => {
                    return Err(Error::ValidationError(format!(
                        "invalid volume size {size:?} for {group}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Result of comparing the accepted spec with a new one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecDiff {
    pub counts_changed: bool,
    pub image_changed: bool,
    pub volumes_changed: bool,
    pub topology_changed: bool,
}

impl SpecDiff {
    pub fn has_changes(&self) -> bool {
        self.counts_changed || self.image_changed || self.volumes_changed || self.topology_changed
    }
}

/// Validate a new spec against the accepted one
pub fn validate_spec_change(old: &ArangoDeploymentSpec, new: &ArangoDeploymentSpec) -> Result<SpecDiff> {
    if new.mode() == DeploymentMode::Cluster
        && old.count(ServerGroup::Agents) != new.count(ServerGroup::Agents)
    {
        return Err(Error::ValidationError(format!(
            "agent count cannot change from {} to {}",
            old.count(ServerGroup::Agents),
            new.count(ServerGroup::Agents)
        )));
    }

    for &group in new.groups() {
        let old_class = old.group_spec(group).and_then(|g| g.storage_class_name.as_ref());
        let new_class = new.group_spec(group).and_then(|g| g.storage_class_name.as_ref());
        if old_class != new_class {
            return Err(Error::ValidationError(format!(
                "storage class of {group} cannot be changed"
            )));
        }

        let old_size = old.volume_size(group).and_then(parse_quantity);
        let new_size = new.volume_size(group).and_then(parse_quantity);
        if let (Some(old_size), Some(new_size)) = (old_size, new_size)
            && new_size < old_size
        {
            return Err(Error::ValidationError(format!(
                "volume of {group} cannot shrink"
            )));
        }
    }

    Ok(SpecDiff {
        counts_changed: new
            .groups()
            .iter()
            .any(|&g| old.count(g) != new.count(g)),
        image_changed: old.image() != new.image(),
        volumes_changed: new
            .groups()
            .iter()
            .any(|&g| old.volume_size(g) != new.volume_size(g)),
        topology_changed: old.topology != new.topology,
    })
}
