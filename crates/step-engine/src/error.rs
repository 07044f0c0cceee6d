//! Error types for the step engine

use std::time::Duration;

use kube::config::{InferConfigError, KubeconfigError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    #[error("Failed to infer cluster configuration: {0}")]
    InferConfig(#[from] InferConfigError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch stream error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error("Invalid volume spec '{spec}': {reason}")]
    InvalidVolumeSpec { spec: String, reason: String },

    #[error("Invalid step {step}: {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Cannot {operation} pipeline {pipeline} while it is {state}")]
    InvalidState {
        pipeline: String,
        state: String,
        operation: &'static str,
    },

    #[error("Lost track of workload {workload}: {reason}")]
    Observation { workload: String, reason: String },

    #[error("Wait on workload {workload} was cancelled")]
    Cancelled { workload: String },

    #[error("Wait on workload {workload} exceeded {timeout:?}")]
    DeadlineExceeded { workload: String, timeout: Duration },
}

impl Error {
    /// The API rejected a create because the object already exists (409).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// The API reported the object missing (404).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// True for errors produced by abandoning a blocking wait.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
