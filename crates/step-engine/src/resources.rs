//! Declarative resources for a pipeline run
//!
//! Pure construction of the shared `PersistentVolumeClaim` and the per-step
//! `Pod`. Submission is the cluster client's job.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::pipeline::Step;

/// Alias of the repository checkout step
pub const CHECKOUT_ALIAS: &str = "clone";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_STEP: &str = "step-engine.5dlabs.com/step";
pub const MANAGER: &str = "step-engine";

#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    namespace: String,
    storage_class: Option<String>,
    claim_size: Quantity,
}

impl ResourceBuilder {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            storage_class: config.storage_class.clone(),
            claim_size: config.claim_quantity(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Single-writer claim of the configured size for a pipeline's shared volume
    #[must_use]
    pub fn build_volume_claim(&self, volume_name: &str) -> PersistentVolumeClaim {
        let mut labels = managed_labels("workspace");
        labels.insert("step-engine.5dlabs.com/volume".to_string(), volume_name.to_string());

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(volume_name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: self.storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        self.claim_size.clone(),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Single-container, never-restarted pod for one step.
    ///
    /// A pipeline provisions one claim, so every binding must name the same
    /// volume; only the mount paths may differ.
    pub fn build_workload(&self, step: &Step) -> Result<Pod> {
        let name = step.workload_name();
        let bindings = step.bindings()?;

        if let Some(first) = bindings.first() {
            if let Some(other) = bindings.iter().find(|binding| binding.name != first.name) {
                return Err(Error::InvalidStep {
                    step: step.name.clone(),
                    reason: format!(
                        "binds volume '{}' but the pipeline only provisions '{}'",
                        other.name, first.name
                    ),
                });
            }
        }

        let working_dir = match bindings.first() {
            Some(first) if step.alias == CHECKOUT_ALIAS => Some(first.mount_path.clone()),
            _ => non_empty(&step.working_dir),
        };

        let mut volumes: Vec<Volume> = Vec::new();
        for binding in &bindings {
            if volumes.iter().any(|volume| volume.name == binding.name) {
                continue;
            }
            volumes.push(Volume {
                name: binding.name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: binding.name.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            });
        }

        let volume_mounts: Vec<VolumeMount> = bindings
            .iter()
            .map(|binding| VolumeMount {
                name: binding.name.clone(),
                mount_path: binding.mount_path.clone(),
                read_only: binding.read_only.then_some(true),
                ..Default::default()
            })
            .collect();

        let mut env: Vec<EnvVar> = step
            .environment
            .iter()
            .map(|(key, value)| EnvVar {
                name: key.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();
        env.sort_by(|a, b| a.name.cmp(&b.name));

        let mut labels = step.labels.clone();
        labels.extend(managed_labels("step"));
        labels.insert(LABEL_STEP.to_string(), name.clone());

        let container = Container {
            name: step.container_name(),
            image: Some(step.image.clone()),
            command: non_empty_vec(&step.entrypoint),
            args: non_empty_vec(&step.args),
            working_dir,
            env: (!env.is_empty()).then_some(env),
            volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
            ..Default::default()
        };

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: (!volumes.is_empty()).then_some(volumes),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn managed_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
    ])
}

fn non_empty(value: &str) -> Option<String> {
    (!value.trim().is_empty()).then(|| value.to_string())
}

fn non_empty_vec(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}
