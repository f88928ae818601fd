//! Run event DTOs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::run::{ErrorReport, Run};

/// Everything a run reports to its front-end, in emission order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RunEvent {
    /// The run record was persisted after mapping succeeded
    Saved { run: Run },
    Progress { run_id: String, progress: ImageProgress },
    StateUpdate { run_id: String, update: StateUpdate },
    /// The run reached complete, error, stopped or suspended
    Terminal { run: Run },
    Notice { notice: Notice },
}

impl RunEvent {
    /// Id of the run this event is about, if any
    pub fn run_id(&self) -> Option<&str> {
        match self {
            RunEvent::Saved { run } | RunEvent::Terminal { run } => Some(&run.id),
            RunEvent::Progress { run_id, .. } | RunEvent::StateUpdate { run_id, .. } => {
                Some(run_id)
            }
            RunEvent::Notice { .. } => None,
        }
    }
}

/// Progress of a single image pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProgress {
    pub image: String,
    #[serde(flatten)]
    pub status: PullStatus,
}

impl ImageProgress {
    pub fn downloading(image: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            status: PullStatus::Downloading {
                detail: detail.into(),
            },
        }
    }

    pub fn complete(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            status: PullStatus::Complete,
        }
    }

    pub fn failed(image: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            status: PullStatus::Failed {
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PullStatus {
    Downloading { detail: String },
    Complete,
    Failed { message: String },
}

/// Live state reported while a run is being driven
///
/// Engines may attach arbitrary extra fields; they are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_iteration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StateUpdate {
    /// An update that only carries a controller state label
    pub fn controller(state: impl Into<String>) -> Self {
        Self {
            controller_state: Some(state.into()),
            ..Default::default()
        }
    }
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "lowercase")]
pub enum Notice {
    Info { message: String },
    Warning { message: String },
    Error(ErrorReport),
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Notice::Info {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Notice::Warning {
            message: message.into(),
        }
    }

    pub fn error(report: ErrorReport) -> Self {
        Notice::Error(report)
    }

    pub fn message(&self) -> &str {
        match self {
            Notice::Info { message } | Notice::Warning { message } => message,
            Notice::Error(report) => &report.message,
        }
    }
}
