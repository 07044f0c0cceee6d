//! Drives a compiled pipeline through the engine
//!
//! Stages run in order; the steps of one stage run concurrently. Teardown
//! always happens, whether the pipeline succeeded, failed, or was cancelled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use step_engine::{
    CancellationToken, Engine, ExecutionState, KubernetesEngine, PipelineConfig, Step,
};
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long to keep printing logs after a step has finished
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub state: ExecutionState,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
}

impl RunReport {
    /// Exit code of the first failed step, or zero
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.steps
            .iter()
            .map(|step| step.state.exit_code)
            .find(|code| *code != 0)
            .unwrap_or(0)
    }
}

pub struct PipelineRunner {
    engine: Arc<KubernetesEngine>,
    cancel: CancellationToken,
}

impl PipelineRunner {
    #[must_use]
    pub fn new(engine: Arc<KubernetesEngine>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    pub async fn run(&self, config: &PipelineConfig) -> Result<RunReport> {
        self.engine
            .setup(config)
            .await
            .context("Failed to provision pipeline volume")?;

        let outcome = self.run_stages(config).await;

        if let Err(e) = self.engine.destroy(config).await {
            error!(error = %e, "Failed to tear down pipeline");
            if outcome.is_ok() {
                return Err(e).context("Failed to tear down pipeline");
            }
        }

        outcome
    }

    async fn run_stages(&self, config: &PipelineConfig) -> Result<RunReport> {
        let mut report = RunReport::default();

        for stage in &config.stages {
            info!(stage = %stage.name, steps = stage.steps.len(), "Starting stage");

            let results = join_all(stage.steps.iter().map(|step| self.run_step(step))).await;

            let mut failed = false;
            for result in results {
                let step = result?;
                failed |= step.state.exit_code != 0;
                report.steps.push(step);
            }

            if failed {
                warn!(stage = %stage.name, "Stage failed, skipping remaining stages");
                break;
            }
        }

        Ok(report)
    }

    async fn run_step(&self, step: &Step) -> Result<StepReport> {
        self.engine
            .exec(step)
            .await
            .with_context(|| format!("Failed to start step {}", step.name))?;

        let logs = tokio::spawn(follow_logs(
            self.engine.clone(),
            step.clone(),
            self.cancel.child_token(),
        ));

        match self.engine.wait(step, &self.cancel).await {
            Ok(state) => {
                if !drain_logs(logs, LOG_DRAIN_TIMEOUT).await {
                    warn!(step = %step.name, "Log stream outlived its step, aborted it");
                }
                info!(step = %step.name, exit_code = state.exit_code, "Step finished");
                Ok(StepReport {
                    name: step.name.clone(),
                    state,
                })
            }
            Err(e) => {
                logs.abort();
                if e.is_abandoned() {
                    if let Err(kill_err) = self.engine.kill(step).await {
                        warn!(step = %step.name, error = %kill_err, "Failed to kill step");
                    }
                }
                Err(e).with_context(|| format!("Step {} did not complete", step.name))
            }
        }
    }
}

/// Let the log task finish within `timeout`, aborting it otherwise.
/// Returns whether it finished on its own.
async fn drain_logs(mut logs: JoinHandle<()>, timeout: Duration) -> bool {
    if tokio::time::timeout(timeout, &mut logs).await.is_ok() {
        return true;
    }
    logs.abort();
    false
}

async fn follow_logs(engine: Arc<KubernetesEngine>, step: Step, cancel: CancellationToken) {
    let stream = match engine.tail(&step, &cancel).await {
        Ok(stream) => stream,
        Err(e) if e.is_abandoned() => return,
        Err(e) => {
            warn!(step = %step.name, error = %e, "Failed to follow step logs");
            return;
        }
    };

    let mut lines = stream.lines();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => println!("[{}] {line}", step.name),
                Ok(None) => break,
                Err(e) => {
                    warn!(step = %step.name, error = %e, "Log stream interrupted");
                    break;
                }
            },
        }
    }
}
