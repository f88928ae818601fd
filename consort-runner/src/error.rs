//! Run error taxonomy

use consort_core::domain::run::{ErrorReport, TransitionError};
use consort_core::mapping::MappingError;
use serde_json::json;
use thiserror::Error;

/// Errors raised while driving a run or serving a control request
#[derive(Debug, Error)]
pub enum RunError {
    /// User-fixable; blocks the run from starting
    #[error(transparent)]
    MappingIncomplete(#[from] MappingError),

    #[error("Failed to pull image {image}: {message}")]
    ImageAcquisition { image: String, message: String },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Staging failed: {0}")]
    Staging(String),

    #[error("Failed to fetch run assets: {0}")]
    RemoteFetch(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Run {run_id} of consortium {consortium_id} is already being driven")]
    LeaseHeld {
        consortium_id: String,
        run_id: String,
    },

    #[error("Local store error: {0}")]
    Store(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

impl RunError {
    /// Wraps any error chain as a staging failure
    pub fn staging(err: impl std::fmt::Display) -> Self {
        Self::Staging(format!("{:#}", err))
    }

    /// Wraps failures of local bookkeeping such as leases
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(format!("{:#}", err))
    }

    pub fn runtime(err: impl std::fmt::Display) -> Self {
        Self::Runtime(format!("{:#}", err))
    }

    /// Structured report attached to runs and error notices
    pub fn report(&self) -> ErrorReport {
        let report = ErrorReport::from_error(self);
        match self {
            RunError::ImageAcquisition { image, message } => {
                report.with_inner_error(json!({ "image": image, "message": message }))
            }
            _ => report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_error_message_passes_through() {
        let err = RunError::from(MappingError::Incomplete {
            consortium: "Brain Study".to_string(),
            step: 0,
            key: "covariates".to_string(),
        });
        assert!(
            err.to_string()
                .starts_with("Mapping incomplete for new run from Brain Study.")
        );
    }

    #[test]
    fn test_image_report_names_image() {
        let err = RunError::ImageAcquisition {
            image: "img-b".to_string(),
            message: "manifest unknown".to_string(),
        };
        let report = err.report();

        assert_eq!(report.message, "Failed to pull image img-b: manifest unknown");
        assert_eq!(report.inner_error.unwrap()["image"], "img-b");
    }
}
