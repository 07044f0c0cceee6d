/*
 * 5D Labs Agent Platform - Pipeline Step Runner
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Pipeline Step Runner - runs a compiled pipeline as Kubernetes pods
//!
//! Provisions the shared volume, runs every stage in order, streams each
//! step's logs to stdout and tears everything down on exit. Ctrl-C kills
//! the running steps before teardown.

mod runner;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use step_engine::resources::ResourceBuilder;
use step_engine::{CancellationToken, EngineConfig, KubernetesEngine, PipelineConfig};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runner::PipelineRunner;

/// Exit code reported when the run was interrupted
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Parser)]
#[command(
    name = "step-runner",
    version,
    about = "Run compiled pipelines as Kubernetes pods"
)]
#[command(propagate_version = true)]
struct Cli {
    /// Engine configuration file (YAML)
    #[arg(long, global = true, env = "STEP_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Kubeconfig file, instead of the inferred configuration
    #[arg(long, global = true, env = "STEP_ENGINE_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// API server URL override
    #[arg(long, global = true, env = "STEP_ENGINE_ENDPOINT")]
    endpoint: Option<String>,

    /// Namespace for claims and pods
    #[arg(long, global = true, env = "STEP_ENGINE_NAMESPACE")]
    namespace: Option<String>,

    /// Storage class for the pipeline volume
    #[arg(long, global = true, env = "STEP_ENGINE_STORAGE_CLASS")]
    storage_class: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = LogFormat::Text,
        env = "STEP_ENGINE_LOG_FORMAT"
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline to completion
    Run {
        /// Compiled pipeline (YAML or JSON)
        pipeline: PathBuf,
    },

    /// Print the resources a pipeline would create, without contacting the cluster
    Render {
        /// Compiled pipeline (YAML or JSON)
        pipeline: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => EngineConfig::default(),
        };

        if let Some(kubeconfig) = &self.kubeconfig {
            config.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = Some(endpoint.clone());
        }
        if let Some(namespace) = &self.namespace {
            config.namespace.clone_from(namespace);
        }
        if let Some(storage_class) = &self.storage_class {
            config.storage_class = Some(storage_class.clone());
        }

        config.validate().context("Invalid engine configuration")?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    // Step output owns stdout
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn load_pipeline(path: &Path) -> Result<PipelineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse pipeline {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.engine_config()?;

    match &cli.command {
        Commands::Run { pipeline } => run(&config, pipeline).await,
        Commands::Render { pipeline } => {
            render(&config, pipeline)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: &EngineConfig, path: &Path) -> Result<ExitCode> {
    let pipeline = load_pipeline(path)?;

    info!(
        "Starting step-runner v{} (namespace: {})",
        env!("CARGO_PKG_VERSION"),
        config.namespace
    );

    let engine = Arc::new(
        KubernetesEngine::connect(config)
            .await
            .context("Failed to connect to cluster")?,
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping running steps");
                cancel.cancel();
            }
        }
    });

    let runner = PipelineRunner::new(engine, cancel.clone());
    match runner.run(&pipeline).await {
        Ok(report) => {
            let code = report.exit_code();
            if code == 0 {
                info!(steps = report.steps.len(), "Pipeline succeeded");
                Ok(ExitCode::SUCCESS)
            } else {
                error!(exit_code = code, "Pipeline failed");
                Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
            }
        }
        Err(e) if cancel.is_cancelled() => {
            warn!(error = %e, "Pipeline interrupted");
            Ok(ExitCode::from(INTERRUPTED_EXIT_CODE))
        }
        Err(e) => Err(e),
    }
}

fn render(config: &EngineConfig, path: &Path) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    let builder = ResourceBuilder::new(config);

    let claim = builder.build_volume_claim(&pipeline.primary_claim()?);
    let mut documents = vec![serde_yaml::to_string(&claim)?];
    for step in pipeline.steps() {
        let pod = builder
            .build_workload(step)
            .with_context(|| format!("Failed to build pod for step {}", step.name))?;
        documents.push(serde_yaml::to_string(&pod)?);
    }

    print!("{}", documents.join("---\n"));
    Ok(())
}
