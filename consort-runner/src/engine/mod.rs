//! Execution engine contract
//!
//! The engine runs a resolved pipeline and reports live state while doing so.
//! The orchestrator only talks to this trait; `LocalEngine` is the in-process
//! implementation for local runs.

mod local;

pub use local::LocalEngine;

use async_trait::async_trait;
use consort_core::domain::pipeline::PipelineSnapshot;
use consort_core::domain::run::{ErrorReport, RunType};
use consort_core::dto::event::StateUpdate;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

/// Everything the engine needs to start a run
#[derive(Debug, Clone)]
pub struct StartPipeline {
    pub consortium_id: String,
    /// Pipeline with every owner mapping already resolved
    pub pipeline: PipelineSnapshot,
    /// Staged input files
    pub files: Vec<PathBuf>,
    /// Directory the staged files live under
    pub staging_dir: PathBuf,
    /// Canonical output directory of the run
    pub output_dir: PathBuf,
    pub run_id: String,
    pub client_id: String,
    pub run_type: RunType,
    /// Per-step configuration, passed through untouched
    pub pipeline_steps: Vec<Value>,
    pub network_volume: bool,
    /// State captured by an earlier suspension
    pub run_state: Option<Value>,
}

pub type ResultFuture = Pin<Box<dyn Future<Output = Result<Value, EngineFailure>> + Send>>;

/// Handle on a started run
pub struct EngineRun {
    /// Live state; closes when the run ends
    pub updates: mpsc::Receiver<StateUpdate>,
    /// Resolves with the results, or rejects with why the run ended early
    pub result: ResultFuture,
}

/// Why a run did not produce results
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    Failed,
    Stopped,
    /// Holds the state needed to resume
    Suspended(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineFailure {
    pub kind: FailureKind,
    pub report: ErrorReport,
}

impl EngineFailure {
    pub fn failed(report: ErrorReport) -> Self {
        Self {
            kind: FailureKind::Failed,
            report,
        }
    }

    pub fn stopped(report: ErrorReport) -> Self {
        Self {
            kind: FailureKind::Stopped,
            report,
        }
    }

    pub fn suspended(run_state: Value) -> Self {
        Self {
            kind: FailureKind::Suspended(run_state),
            report: ErrorReport::new("Pipeline suspended"),
        }
    }
}

/// Requests the engine refused
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unsupported run: {0}")]
    Unsupported(String),

    #[error("Failed to start pipeline: {0}")]
    Start(String),

    #[error("No active run {0}")]
    NotRunning(String),

    #[error("Engine is shut down")]
    ShutDown,

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Execution engine contract
#[async_trait]
pub trait PipelineEngine: Send + Sync {
    async fn start_pipeline(&self, request: StartPipeline) -> Result<EngineRun, EngineError>;

    /// Asks the engine to stop a run; the run's result rejects with `Stopped`
    async fn request_stop(&self, pipeline_id: &str, run_id: &str) -> Result<(), EngineError>;

    /// Asks the engine to pause a run; the result rejects with `Suspended`
    async fn suspend(&self, run_id: &str) -> Result<(), EngineError>;

    /// Removes engine-side scratch files of a run
    async fn unlink_files(&self, run_id: &str) -> Result<(), EngineError>;

    fn set_remote_endpoint(&self, url: &str);

    /// Stops every run and resolves once the engine has released its transport
    async fn shutdown(&self);
}
