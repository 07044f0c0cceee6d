/*
 * 5D Labs Agent Platform - Pipeline Step Engine
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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Pipeline step engine
//!
//! Runs CI/CD pipeline steps as Kubernetes pods. A pipeline shares one
//! PersistentVolumeClaim between its steps; each step becomes one pod whose
//! completion is observed through a watch and whose logs can be followed
//! while it runs.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod logs;
pub mod naming;
pub mod pipeline;
pub mod resources;
pub mod status;
pub mod watch;

// Re-export commonly used types
pub use cluster::{ClusterApi, KubeCluster, WorkloadEvent};
pub use config::EngineConfig;
pub use engine::{Engine, KubernetesEngine, RunState};
pub use error::{Error, Result};
pub use logs::LogStream;
pub use pipeline::{ExecutionState, PipelineConfig, Stage, Step, VolumeDecl};
pub use status::{WorkloadPhase, WorkloadStatus};

// Callers need the token type to abandon waits
pub use tokio_util::sync::CancellationToken;
