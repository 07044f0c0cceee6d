//! Cluster-legal names for pipeline identifiers
//!
//! Pipeline identifiers use underscores freely, Kubernetes object names may
//! not. Only underscores are rewritten; any other illegal character must be
//! sanitized by the pipeline compiler before it reaches the engine.

use crate::error::{Error, Result};

/// A parsed `<volume-name>:<mount-path>[:ro|rw]` binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// Replace every underscore with a hyphen.
#[must_use]
pub fn to_cluster_name(id: &str) -> String {
    id.replace('_', "-")
}

/// Cluster name of a pipeline volume declaration.
#[must_use]
pub fn claim_name(volume: &str) -> String {
    match volume.split_once(':') {
        Some((name, _)) => to_cluster_name(name),
        None => to_cluster_name(volume),
    }
}

/// Split a step's volume specifier on its first colon.
pub fn parse_volume_spec(spec: &str) -> Result<VolumeBinding> {
    let invalid = |reason: &str| Error::InvalidVolumeSpec {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let (name, rest) = spec
        .split_once(':')
        .ok_or_else(|| invalid("expected <name>:<mount-path>"))?;

    if name.is_empty() {
        return Err(invalid("volume name is empty"));
    }

    let (mount_path, read_only) = match rest.rsplit_once(':') {
        Some((path, "ro")) => (path, true),
        Some((path, "rw")) => (path, false),
        _ => (rest, false),
    };

    if !mount_path.starts_with('/') {
        return Err(invalid("mount path must be absolute"));
    }

    Ok(VolumeBinding {
        name: to_cluster_name(name),
        mount_path: mount_path.to_string(),
        read_only,
    })
}
