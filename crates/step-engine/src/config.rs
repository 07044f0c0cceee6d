//! Engine Configuration
//!
//! Connection and provisioning settings fixed at engine construction. Loaded
//! from a YAML file and optionally overridden by the runner's flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main engine configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// API server URL, overriding the one in the kubeconfig
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Explicit kubeconfig path; in-cluster or default discovery when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace every claim and pod is created in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Storage class for the shared claim (cluster default when unset)
    #[serde(default)]
    pub storage_class: Option<String>,

    /// Storage request for the shared claim
    #[serde(default = "default_claim_size")]
    pub claim_size: String,

    /// Upper bound on a single `wait`/`tail` call
    #[serde(default)]
    pub wait_timeout_seconds: Option<u64>,

    /// Grace period used when a single step is killed
    #[serde(default = "default_kill_grace_period")]
    pub kill_grace_period_seconds: u32,

    /// Grace period used when step pods are swept at teardown
    #[serde(default)]
    pub destroy_grace_period_seconds: u32,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_claim_size() -> String {
    "1G".to_string()
}

fn default_kill_grace_period() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            kubeconfig: None,
            namespace: default_namespace(),
            storage_class: None,
            claim_size: default_claim_size(),
            wait_timeout_seconds: None,
            kill_grace_period_seconds: default_kill_grace_period(),
            destroy_grace_period_seconds: 0,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("Failed to parse config YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that configuration has the fields the engine cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::Config("namespace must not be empty".to_string()));
        }

        if !is_valid_quantity(&self.claim_size) {
            return Err(Error::Config(format!(
                "claimSize '{}' is not a storage quantity",
                self.claim_size
            )));
        }

        if self.wait_timeout_seconds == Some(0) {
            return Err(Error::Config(
                "waitTimeoutSeconds must be greater than zero when set".to_string(),
            ));
        }

        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(Error::Config(format!(
                    "endpoint '{endpoint}' must be an http(s) URL"
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_seconds.map(Duration::from_secs)
    }

    #[must_use]
    pub fn claim_quantity(&self) -> Quantity {
        Quantity(self.claim_size.clone())
    }
}

/// Accepts the decimal/binary suffix forms Kubernetes uses for storage sizes.
fn is_valid_quantity(raw: &str) -> bool {
    const SUFFIXES: [&str; 13] = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "k", "M", "G", "T", "P", "E", "",
    ];

    let raw = raw.trim();
    SUFFIXES.iter().any(|suffix| {
        raw.strip_suffix(suffix).is_some_and(|number| {
            number.chars().any(|c| c.is_ascii_digit())
                && number.chars().all(|c| c.is_ascii_digit() || c == '.')
                && number.chars().filter(|c| *c == '.').count() <= 1
        })
    })
}
