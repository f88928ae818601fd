//! Run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::pipeline::PipelineSnapshot;

/// One execution of a consortium pipeline
///
/// The pipeline snapshot is fixed at construction; it has no setter and no
/// mutable accessor so later pipeline edits can never leak into a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub consortium_id: String,
    pipeline_snapshot: PipelineSnapshot,
    /// Participant id -> display label
    #[serde(default)]
    pub clients: BTreeMap<String, String>,
    #[serde(rename = "type")]
    pub run_type: RunType,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_date: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_date: Option<DateTime<Utc>>,
    /// Per-step configuration handed to the engine untouched
    #[serde(default)]
    pub pipeline_steps: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_pipeline_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_pipeline_state: Option<Value>,
    /// Engine state captured on suspension, used to resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_state: Option<Value>,
}

/// Whether this client initiated the run or only joined it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Local,
    Decentralized,
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    #[default]
    Queued,
    DownloadingImages,
    Running,
    Suspended,
    Complete,
    Error,
    Stopped,
}

impl RunStatus {
    /// Complete, error and stopped are final
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Error | RunStatus::Stopped)
    }

    /// Checks the run state machine's transition table
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, DownloadingImages)
                | (Queued, Error)
                | (DownloadingImages, Running)
                | (DownloadingImages, Error)
                | (Running, Suspended)
                | (Running, Complete)
                | (Running, Error)
                | (Running, Stopped)
                | (Suspended, Running)
                | (Suspended, Stopped)
                | (Suspended, Error)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Queued => "queued",
            RunStatus::DownloadingImages => "downloading-images",
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Complete => "complete",
            RunStatus::Error => "error",
            RunStatus::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

/// Rejected status change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid run transition from {from} to {to}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Structured error attached to failed runs and error events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_error: Option<Value>,
    /// Partial input the failing step was working on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            inner_error: None,
            input: None,
        }
    }

    /// Builds a report from an error and its source chain
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
            inner_error: None,
            input: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_inner_error(mut self, inner: Value) -> Self {
        self.inner_error = Some(inner);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

impl Run {
    /// Creates a queued run over a frozen pipeline snapshot
    pub fn new(
        id: impl Into<String>,
        consortium_id: impl Into<String>,
        pipeline_snapshot: PipelineSnapshot,
        run_type: RunType,
    ) -> Self {
        Self {
            id: id.into(),
            consortium_id: consortium_id.into(),
            pipeline_snapshot,
            clients: BTreeMap::new(),
            run_type,
            status: RunStatus::Queued,
            results: None,
            error: None,
            start_date: Utc::now(),
            end_date: None,
            pipeline_steps: Vec::new(),
            local_pipeline_state: None,
            remote_pipeline_state: None,
            run_state: None,
        }
    }

    /// Creates a queued local run under a fresh id
    pub fn local(consortium_id: impl Into<String>, pipeline_snapshot: PipelineSnapshot) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            consortium_id,
            pipeline_snapshot,
            RunType::Local,
        )
    }

    /// The pipeline as it was when the run was created
    pub fn pipeline_snapshot(&self) -> &PipelineSnapshot {
        &self.pipeline_snapshot
    }

    pub fn is_local(&self) -> bool {
        self.run_type == RunType::Local
    }

    /// True once results or an error have been recorded
    pub fn is_finished(&self) -> bool {
        self.results.is_some() || self.error.is_some()
    }

    /// Moves the run to `next`, enforcing the transition table
    pub fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Terminal success
    pub fn complete(&mut self, results: Value) -> Result<(), TransitionError> {
        self.transition(RunStatus::Complete)?;
        self.results = Some(results);
        self.error = None;
        self.end_date = Some(Utc::now());
        Ok(())
    }

    /// Terminal failure
    pub fn fail(&mut self, report: ErrorReport) -> Result<(), TransitionError> {
        self.transition(RunStatus::Error)?;
        self.finish_with_error(report);
        Ok(())
    }

    /// Terminal stop requested by a user
    pub fn stop(&mut self, report: ErrorReport) -> Result<(), TransitionError> {
        self.transition(RunStatus::Stopped)?;
        self.finish_with_error(report);
        Ok(())
    }

    /// Pauses a running run, keeping the engine state needed to resume
    pub fn suspend(&mut self, run_state: Value) -> Result<(), TransitionError> {
        self.transition(RunStatus::Suspended)?;
        self.run_state = Some(run_state);
        Ok(())
    }

    fn finish_with_error(&mut self, report: ErrorReport) {
        self.results = None;
        self.error = Some(report);
        self.end_date = Some(Utc::now());
    }
}
