//! Error types for the Consort API client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the API server
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Writing a downloaded body to disk failed
    #[error("Failed to write download: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Check if the server rejected the credentials
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::ApiError { status: 401 | 403, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ClientError::api_error(404, "gone").is_not_found());
        assert!(ClientError::api_error(401, "bad token").is_unauthorized());
        assert!(ClientError::api_error(403, "forbidden").is_unauthorized());
        assert!(!ClientError::api_error(500, "boom").is_unauthorized());
        assert!(!ClientError::api_error(400, "bad").is_not_found());
    }

    #[test]
    fn test_api_error_message() {
        let err = ClientError::api_error(500, "boom");
        assert_eq!(err.to_string(), "API error (status 500): boom");
    }
}
