//! Run asset downloader
//!
//! Fetches the result bundle of a run from the API server into
//! `output/<clientId>/<runId>/`. The bundle is a gzipped tarball; it is
//! unpacked into a temporary directory inside the run directory and only
//! merged into place once the whole archive extracted cleanly.

use consort_client::{ApiClient, ClientError};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::RunError;

#[derive(Debug, Clone)]
pub struct AssetDownloader {
    /// `output/`
    output_root: PathBuf,
    http: reqwest::Client,
}

impl AssetDownloader {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self::with_client(output_root, reqwest::Client::new())
    }

    pub fn with_client(output_root: impl Into<PathBuf>, http: reqwest::Client) -> Self {
        Self {
            output_root: output_root.into(),
            http,
        }
    }

    /// Downloads and unpacks a run's assets, returning the run output directory
    ///
    /// Single attempt. The archive is removed whether or not this succeeds.
    pub async fn download(
        &self,
        run_id: &str,
        auth_token: &str,
        client_id: &str,
        api_url: &str,
    ) -> Result<PathBuf, RunError> {
        let run_dir = self.output_root.join(client_id).join(run_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| RunError::RemoteFetch(format!("{}: {}", run_dir.display(), e)))?;

        let archive = run_dir.join(format!("{}.tar.gz", run_id));
        let client = ApiClient::with_client(api_url, self.http.clone());

        let result = async {
            client
                .download_run_assets(run_id, auth_token, &archive)
                .await
                .map_err(|e| fetch_error(run_id, e))?;
            extract(&archive, &run_dir).await
        }
        .await;

        match tokio::fs::remove_file(&archive).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove archive {}: {}", archive.display(), e),
        }

        match &result {
            Ok(()) => info!("Assets of run {} available in {}", run_id, run_dir.display()),
            Err(e) => warn!("Asset download for run {} failed: {}", run_id, e),
        }
        result.map(|()| run_dir)
    }
}

fn fetch_error(run_id: &str, err: ClientError) -> RunError {
    if err.is_unauthorized() {
        RunError::RemoteFetch(format!("not authorized to fetch run {}: {}", run_id, err))
    } else if err.is_not_found() {
        RunError::RemoteFetch(format!("no results published for run {}", run_id))
    } else {
        RunError::RemoteFetch(err.to_string())
    }
}

/// Unpacks a `.tar.gz` into `dest`, all or nothing
pub async fn extract(archive: &Path, dest: &Path) -> Result<(), RunError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| RunError::RemoteFetch(e.to_string()))?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<(), RunError> {
    let fetch_err = |e: std::io::Error| RunError::RemoteFetch(format!("{}: {}", archive.display(), e));

    let scratch = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(dest)
        .map_err(fetch_err)?;

    let file = File::open(archive).map_err(fetch_err)?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));
    tarball.unpack(scratch.path()).map_err(fetch_err)?;

    merge(scratch.path(), dest)
}

/// Moves everything under `from` into `into`, replacing files of the same name
fn merge(from: &Path, into: &Path) -> Result<(), RunError> {
    let merge_err = |path: &Path, e: std::io::Error| {
        RunError::RemoteFetch(format!("merging {}: {}", path.display(), e))
    };

    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| RunError::RemoteFetch(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| RunError::RemoteFetch(e.to_string()))?;
        let target = into.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| merge_err(&target, e))?;
            continue;
        }

        if target.symlink_metadata().is_ok() {
            std::fs::remove_file(&target).map_err(|e| merge_err(&target, e))?;
        }
        std::fs::rename(entry.path(), &target).map_err(|e| merge_err(&target, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Serves one HTTP response with `body` and returns the base URL
    async fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            // Read the request until the client goes quiet
            while let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(200), socket.read(&mut buf)).await
            {
                if n == 0 {
                    break;
                }
            }
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_download_extracts_and_removes_archive() {
        let output = tempfile::tempdir().unwrap();
        let url = serve_once(
            "200 OK",
            tarball(&[("local0/beta.json", "[0.1]"), ("global.json", "{}")]),
        )
        .await;
        let downloader = AssetDownloader::new(output.path());

        let run_dir = downloader
            .download("run-1", "token", "user-1", &url)
            .await
            .unwrap();

        assert_eq!(run_dir, output.path().join("user-1").join("run-1"));
        assert_eq!(
            std::fs::read_to_string(run_dir.join("local0").join("beta.json")).unwrap(),
            "[0.1]"
        );
        assert!(run_dir.join("global.json").exists());
        assert!(!run_dir.join("run-1.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_corrupt_archive_leaves_nothing_behind() {
        let output = tempfile::tempdir().unwrap();
        let url = serve_once("200 OK", b"definitely not gzip".to_vec()).await;
        let downloader = AssetDownloader::new(output.path());

        let err = downloader
            .download("run-1", "token", "user-1", &url)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::RemoteFetch(_)));
        let run_dir = output.path().join("user-1").join("run-1");
        let leftovers: Vec<_> = std::fs::read_dir(&run_dir).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_propagates() {
        let output = tempfile::tempdir().unwrap();
        let url = serve_once("500 Internal Server Error", b"boom".to_vec()).await;
        let downloader = AssetDownloader::new(output.path());

        let err = downloader
            .download("run-1", "token", "user-1", &url)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("500"));
        assert!(!output.path().join("user-1/run-1/run-1.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_rejected_token_is_reported() {
        let output = tempfile::tempdir().unwrap();
        let url = serve_once("401 Unauthorized", b"{\"message\":\"jwt expired\"}".to_vec()).await;
        let downloader = AssetDownloader::new(output.path());

        let err = downloader
            .download("run-1", "token", "user-1", &url)
            .await
            .unwrap_err();

        let RunError::RemoteFetch(message) = err else {
            panic!("expected a fetch error");
        };
        assert!(message.starts_with("not authorized to fetch run run-1"));
        assert!(message.contains("jwt expired"));
    }

    #[tokio::test]
    async fn test_missing_results_are_reported() {
        let output = tempfile::tempdir().unwrap();
        let url = serve_once("404 Not Found", Vec::new()).await;
        let downloader = AssetDownloader::new(output.path());

        let err = downloader
            .download("run-1", "token", "user-1", &url)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed to fetch run assets: no results published for run run-1"
        );
    }

    #[tokio::test]
    async fn test_truncated_archive_keeps_existing_outputs() {
        let output = tempfile::tempdir().unwrap();
        let run_dir = output.path().join("user-1").join("run-1");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("provenance.json"), "{}").unwrap();

        let big = "x".repeat(64 * 1024);
        let mut body = tarball(&[("local0/beta.json", "[0.1]"), ("local0/big.bin", big.as_str())]);
        body.truncate(body.len() / 2);
        let url = serve_once("200 OK", body).await;
        let downloader = AssetDownloader::new(output.path());

        let err = downloader
            .download("run-1", "token", "user-1", &url)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::RemoteFetch(_)));
        let mut left: Vec<String> = std::fs::read_dir(&run_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["provenance.json"]);
        assert_eq!(
            std::fs::read_to_string(run_dir.join("provenance.json")).unwrap(),
            "{}"
        );
    }

    #[test]
    fn test_merge_replaces_existing_files() {
        let from = tempfile::tempdir().unwrap();
        let into = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(from.path().join("local0")).unwrap();
        std::fs::write(from.path().join("local0").join("beta.json"), "new").unwrap();
        std::fs::create_dir_all(into.path().join("local0")).unwrap();
        std::fs::write(into.path().join("local0").join("beta.json"), "old").unwrap();

        merge(from.path(), into.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(into.path().join("local0").join("beta.json")).unwrap(),
            "new"
        );
    }
}
