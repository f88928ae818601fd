//! Consort HTTP Client
//!
//! A small client for the consortium API server. The run controller only needs
//! it to fetch the result bundle of a finished run.
//!
//! # Example
//!
//! ```no_run
//! use consort_client::ApiClient;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> consort_client::Result<()> {
//!     let client = ApiClient::new("http://localhost:3100");
//!     let bytes = client
//!         .download_run_assets("run-1", "token", Path::new("/tmp/run-1.tar.gz"))
//!         .await?;
//!     println!("Downloaded {} bytes", bytes);
//!     Ok(())
//! }
//! ```

pub mod error;
mod assets;

pub use error::{ClientError, Result};

use reqwest::Client;
use serde::Deserialize;

/// Error body the API server answers with
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Prefers the server's own message over the raw body
fn error_message(body: String) -> String {
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody {
            message: Some(message),
            ..
        })
        | Ok(ErrorBody {
            error: Some(message),
            ..
        }) => message,
        _ => body,
    }
}

/// HTTP client for the consortium API server
#[derive(Debug, Clone)]
pub struct ApiClient {
    /// Base URL of the API server (e.g., "http://localhost:3100")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new API client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Turns a non-success response into an `ApiError`
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_message(error_text)));
        }

        Ok(response)
    }
}
