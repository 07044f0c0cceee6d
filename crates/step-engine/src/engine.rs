//! Engine facade
//!
//! The five operations a pipeline runner calls, in order: `setup` once,
//! `exec` + `wait`/`tail` per step, `destroy` once. [`KubernetesEngine`] keeps
//! a small ledger of pipeline runs keyed by their shared claim so calls made
//! out of order are rejected before they reach the cluster.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, KubeCluster};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::logs::LogStream;
use crate::pipeline::{ExecutionState, PipelineConfig, Step};
use crate::resources::ResourceBuilder;
use crate::watch::{Condition, WatchHub};

/// Lifecycle operations exposed to the pipeline runner
#[async_trait]
pub trait Engine: Send + Sync {
    /// Provision the pipeline's shared volume.
    async fn setup(&self, config: &PipelineConfig) -> Result<()>;

    /// Start a step. Returns once the pod exists, not when it finishes.
    async fn exec(&self, step: &Step) -> Result<()>;

    /// Block until the step's pod reaches a terminal phase.
    async fn wait(&self, step: &Step, cancel: &CancellationToken) -> Result<ExecutionState>;

    /// Block until the step's pod has started, then follow its logs.
    async fn tail(&self, step: &Step, cancel: &CancellationToken) -> Result<LogStream>;

    /// Remove every step pod, then the shared volume.
    async fn destroy(&self, config: &PipelineConfig) -> Result<()>;
}

/// Where a pipeline run is in its lifecycle. An unknown run is uninitialized;
/// the ledger forgets a run once its teardown has fully succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    Provisioned,
    Running { active: usize },
    TornDown,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Provisioned => f.write_str("provisioned"),
            Self::Running { active } => write!(f, "running ({active} active)"),
            Self::TornDown => f.write_str("torn down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Provisioned,
    Running,
    TornDown,
}

/// Ledger entry for one pipeline run
#[derive(Debug)]
struct Run {
    lifecycle: Lifecycle,
    /// Step pods created and not yet seen to finish or disappear
    active: BTreeSet<String>,
}

impl Run {
    fn provisioned() -> Self {
        Self {
            lifecycle: Lifecycle::Provisioned,
            active: BTreeSet::new(),
        }
    }

    fn state(&self) -> RunState {
        match self.lifecycle {
            Lifecycle::Provisioned => RunState::Provisioned,
            Lifecycle::Running => RunState::Running {
                active: self.active.len(),
            },
            Lifecycle::TornDown => RunState::TornDown,
        }
    }
}

pub struct KubernetesEngine {
    cluster: Arc<dyn ClusterApi>,
    builder: ResourceBuilder,
    watches: WatchHub,
    runs: DashMap<String, Run>,
    wait_timeout: Option<Duration>,
    kill_grace_period_seconds: u32,
    destroy_grace_period_seconds: u32,
}

impl KubernetesEngine {
    /// Connect to the cluster described by `config`.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let cluster = KubeCluster::connect(config).await?;
        Ok(Self::with_cluster(Arc::new(cluster), config))
    }

    #[must_use]
    pub fn with_cluster(cluster: Arc<dyn ClusterApi>, config: &EngineConfig) -> Self {
        Self {
            watches: WatchHub::new(cluster.clone()),
            cluster,
            builder: ResourceBuilder::new(config),
            runs: DashMap::new(),
            wait_timeout: config.wait_timeout(),
            kill_grace_period_seconds: config.kill_grace_period_seconds,
            destroy_grace_period_seconds: config.destroy_grace_period_seconds,
        }
    }

    #[must_use]
    pub fn builder(&self) -> &ResourceBuilder {
        &self.builder
    }

    #[must_use]
    pub fn watches(&self) -> &WatchHub {
        &self.watches
    }

    pub fn run_state(&self, config: &PipelineConfig) -> Result<RunState> {
        let claim = config.primary_claim()?;
        Ok(self.state_of(&claim))
    }

    /// Delete one step's pod with the kill grace period.
    #[instrument(skip(self, step), fields(step = %step.name))]
    pub async fn kill(&self, step: &Step) -> Result<()> {
        let workload = step.workload_name();
        info!(workload = %workload, "Killing step");
        match self
            .cluster
            .delete_workload(&workload, self.kill_grace_period_seconds)
            .await
        {
            Ok(()) => {
                self.step_finished(step);
                Ok(())
            }
            Err(e) => {
                if e.is_not_found() {
                    self.step_finished(step);
                }
                Err(e)
            }
        }
    }

    /// Number of pipeline runs the ledger is tracking
    #[must_use]
    pub fn tracked_runs(&self) -> usize {
        self.runs.len()
    }

    fn state_of(&self, claim: &str) -> RunState {
        self.runs
            .get(claim)
            .map_or(RunState::Uninitialized, |entry| entry.value().state())
    }

    /// Record a created pod against its run. Returns the state that refused
    /// it when the run was torn down while the pod was being created.
    fn step_started(&self, claim: &str, workload: &str) -> std::result::Result<(), RunState> {
        let Some(mut entry) = self.runs.get_mut(claim) else {
            return Err(RunState::Uninitialized);
        };
        let run = entry.value_mut();
        match run.lifecycle {
            Lifecycle::Provisioned | Lifecycle::Running => {
                run.lifecycle = Lifecycle::Running;
                run.active.insert(workload.to_string());
                Ok(())
            }
            Lifecycle::TornDown => Err(run.state()),
        }
    }

    fn step_finished(&self, step: &Step) {
        let Ok(claim) = step.primary_claim() else {
            return;
        };
        if let Some(mut entry) = self.runs.get_mut(&claim) {
            entry.value_mut().active.remove(&step.workload_name());
        }
    }
}

#[async_trait]
impl Engine for KubernetesEngine {
    #[instrument(skip(self, config))]
    async fn setup(&self, config: &PipelineConfig) -> Result<()> {
        let claim = config.primary_claim()?;

        match self.state_of(&claim) {
            RunState::Uninitialized | RunState::TornDown => {}
            state => {
                return Err(Error::InvalidState {
                    pipeline: claim,
                    state: state.to_string(),
                    operation: "set up",
                })
            }
        }

        let spec = self.builder.build_volume_claim(&claim);
        self.cluster.create_claim(&spec).await?;
        self.runs.insert(claim.clone(), Run::provisioned());

        info!(claim = %claim, "Pipeline provisioned");
        Ok(())
    }

    #[instrument(skip(self, step), fields(step = %step.name))]
    async fn exec(&self, step: &Step) -> Result<()> {
        let claim = step.primary_claim()?;

        match self.state_of(&claim) {
            RunState::Provisioned | RunState::Running { .. } => {}
            state => {
                return Err(Error::InvalidState {
                    pipeline: claim,
                    state: state.to_string(),
                    operation: "exec a step in",
                })
            }
        }

        let workload = step.workload_name();
        let pod = self.builder.build_workload(step)?;
        self.cluster.create_workload(&pod).await?;

        if let Err(state) = self.step_started(&claim, &workload) {
            warn!(
                workload = %workload,
                state = %state,
                "Run ended while the step was starting, removing its pod"
            );
            if let Err(e) = self
                .cluster
                .delete_workload(&workload, self.destroy_grace_period_seconds)
                .await
            {
                if !e.is_not_found() {
                    warn!(workload = %workload, error = %e, "Failed to remove orphaned step pod");
                }
            }
            return Err(Error::InvalidState {
                pipeline: claim,
                state: state.to_string(),
                operation: "exec a step in",
            });
        }

        info!(workload = %workload, image = %step.image, "Step started");
        Ok(())
    }

    #[instrument(skip(self, step, cancel), fields(step = %step.name))]
    async fn wait(&self, step: &Step, cancel: &CancellationToken) -> Result<ExecutionState> {
        let workload = step.workload_name();

        // An abandoned wait leaves the pod active; a finished or vanished one does not.
        let phase = match self
            .watches
            .await_condition(&workload, Condition::Terminated, cancel, self.wait_timeout)
            .await
        {
            Ok(phase) => phase,
            Err(e) => {
                if matches!(e, Error::Observation { .. }) {
                    self.step_finished(step);
                }
                return Err(e);
            }
        };
        self.step_finished(step);
        debug!(workload = %workload, phase = %phase, "Step reached terminal phase");

        let status = self
            .cluster
            .get_workload(&workload)
            .await
            .map_err(|e| Error::Observation {
                workload: workload.clone(),
                reason: format!("failed to read finished pod: {e}"),
            })?;

        let state = status
            .execution_state(&step.container_name())
            .ok_or_else(|| Error::Observation {
                workload: workload.clone(),
                reason: format!("pod is {phase} but no container reported an exit code"),
            })?;

        info!(
            workload = %workload,
            exit_code = state.exit_code,
            oom_killed = state.oom_killed,
            "Step finished"
        );
        Ok(state)
    }

    #[instrument(skip(self, step, cancel), fields(step = %step.name))]
    async fn tail(&self, step: &Step, cancel: &CancellationToken) -> Result<LogStream> {
        let workload = step.workload_name();

        self.watches
            .await_condition(&workload, Condition::Started, cancel, self.wait_timeout)
            .await?;

        debug!(workload = %workload, "Opening log stream");
        self.cluster
            .open_log_stream(&workload, &step.container_name())
            .await
    }

    #[instrument(skip(self, config))]
    async fn destroy(&self, config: &PipelineConfig) -> Result<()> {
        // Marked before the sweep so an exec racing with it removes its own pod.
        let claim = config.primary_claim();
        if let Ok(claim) = &claim {
            self.runs.insert(
                claim.clone(),
                Run {
                    lifecycle: Lifecycle::TornDown,
                    active: BTreeSet::new(),
                },
            );
        }

        for step in config.steps() {
            let workload = step.workload_name();
            match self
                .cluster
                .delete_workload(&workload, self.destroy_grace_period_seconds)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(workload = %workload, "Step pod already gone");
                }
                Err(e) => {
                    warn!(workload = %workload, error = %e, "Failed to delete step pod");
                }
            }
        }

        let claim = claim?;
        self.cluster.delete_claim(&claim).await?;
        self.runs.remove(&claim);

        info!(claim = %claim, "Pipeline torn down");
        Ok(())
    }
}
