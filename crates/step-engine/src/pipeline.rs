//! Pipeline data model consumed by the engine
//!
//! A [`PipelineConfig`] is produced by the pipeline compiler and handed to the
//! engine read-only. Field names follow the compiled backend format, so both
//! JSON and YAML documents deserialize directly.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::naming;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub stages: Vec<Stage>,

    /// Volume declarations; the first one is shared by every step
    #[serde(default)]
    pub volumes: Vec<VolumeDecl>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VolumeDecl {
    pub name: String,
    #[serde(default)]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    /// Role of the step within the pipeline, e.g. `clone`
    #[serde(default)]
    pub alias: String,
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default, alias = "command")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Raw `<volume-name>:<mount-path>` bindings
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Result of waiting on a step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub exit_code: i32,
    pub exited: bool,
    pub oom_killed: bool,
}

impl PipelineConfig {
    /// Cluster name of the shared claim backing this pipeline
    pub fn primary_claim(&self) -> Result<String> {
        self.volumes
            .first()
            .map(|volume| naming::claim_name(&volume.name))
            .ok_or_else(|| Error::InvalidPipeline("pipeline declares no volumes".to_string()))
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.stages.iter().flat_map(|stage| stage.steps.iter())
    }
}

impl Step {
    /// Cluster name of the pod that runs this step
    #[must_use]
    pub fn workload_name(&self) -> String {
        naming::to_cluster_name(&self.name)
    }

    /// Name of the step's container inside its pod
    #[must_use]
    pub fn container_name(&self) -> String {
        if self.alias.trim().is_empty() {
            self.workload_name()
        } else {
            naming::to_cluster_name(&self.alias)
        }
    }

    pub fn bindings(&self) -> Result<Vec<naming::VolumeBinding>> {
        self.volumes
            .iter()
            .map(|spec| naming::parse_volume_spec(spec))
            .collect()
    }

    /// Claim the step shares with the rest of its pipeline
    pub fn primary_claim(&self) -> Result<String> {
        let first = self.volumes.first().ok_or_else(|| Error::InvalidStep {
            step: self.name.clone(),
            reason: "step binds no volume".to_string(),
        })?;
        Ok(naming::parse_volume_spec(first)?.name)
    }
}
