//! Run asset endpoints

use reqwest::multipart::Form;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::ApiClient;
use crate::error::{ClientError, Result};

impl ApiClient {
    /// Streams the result bundle of a run to `dest`
    ///
    /// The body is written chunk by chunk; nothing is buffered in memory. On
    /// error the partially written file is left for the caller to remove.
    ///
    /// # Returns
    /// Number of bytes written
    pub async fn download_run_assets(
        &self,
        run_id: &str,
        auth_token: &str,
        dest: &Path,
    ) -> Result<u64> {
        if run_id.is_empty() {
            return Err(ClientError::InvalidRequest("run id is empty".to_string()));
        }

        let url = format!("{}/downloadFiles", self.base_url);
        let form = Form::new().text("runId", run_id.to_string());

        debug!("Requesting assets for run {} from {}", run_id, url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(auth_token)
            .multipart(form)
            .send()
            .await?;
        let mut response = self.check_status(response).await?;

        let mut file = File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!(
            "Downloaded {} bytes of assets for run {} to {}",
            written,
            run_id,
            dest.display()
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_run_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new("http://127.0.0.1:9");

        let err = client
            .download_run_assets("", "token", &dir.path().join("x.tar.gz"))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::InvalidRequest(_)));
        assert!(!dir.path().join("x.tar.gz").exists());
    }
}
