//! Pod status decoded once at the cluster boundary

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::pipeline::ExecutionState;

/// Coarse lifecycle state of a step's pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkloadPhase {
    /// Decode the API's phase string. `Unknown` and missing phases are
    /// treated as not yet started.
    #[must_use]
    pub fn from_api(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Pending,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    #[must_use]
    pub fn has_started(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// How a container ended, when it has
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTermination {
    pub container: String,
    pub exit_code: i32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub name: String,
    pub phase: WorkloadPhase,
    pub terminations: Vec<ContainerTermination>,
}

impl WorkloadStatus {
    #[must_use]
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: WorkloadPhase::Pending,
            terminations: Vec::new(),
        }
    }

    /// Termination of the named container, or of the first container that
    /// has terminated when the name doesn't match.
    #[must_use]
    pub fn termination_of(&self, container: &str) -> Option<&ContainerTermination> {
        self.terminations
            .iter()
            .find(|t| t.container == container)
            .or_else(|| self.terminations.first())
    }

    /// Build the wait result. Returns `None` when the pod is terminal but no
    /// container reported a termination (e.g. it was evicted before start);
    /// the caller decides how to report that.
    #[must_use]
    pub fn execution_state(&self, container: &str) -> Option<ExecutionState> {
        self.termination_of(container).map(|t| ExecutionState {
            exit_code: t.exit_code,
            exited: true,
            oom_killed: t.reason.as_deref() == Some("OOMKilled"),
        })
    }
}

impl From<&Pod> for WorkloadStatus {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let phase = WorkloadPhase::from_api(status.and_then(|s| s.phase.as_deref()));

        let terminations = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .filter_map(|cs| {
                        let terminated = cs.state.as_ref()?.terminated.as_ref()?;
                        Some(ContainerTermination {
                            container: cs.name.clone(),
                            exit_code: terminated.exit_code,
                            reason: terminated.reason.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: pod.name_any(),
            phase,
            terminations,
        }
    }
}
