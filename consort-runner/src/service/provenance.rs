//! Provenance writer
//!
//! Writes `output/<userId>/<runId>/provenance.json` once per run. The record
//! is written to a temporary file next to it and moved into place without
//! clobbering, so a second write never replaces it and a failed write leaves
//! nothing behind.

use consort_core::domain::consortium::Consortium;
use consort_core::domain::provenance::ProvenanceRecord;
use consort_core::domain::run::Run;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::RunError;

pub const PROVENANCE_FILE: &str = "provenance.json";

#[derive(Debug, Clone)]
pub struct ProvenanceWriter {
    /// `output/<userId>`
    root: PathBuf,
}

impl ProvenanceWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id).join(PROVENANCE_FILE)
    }

    /// Writes the record; returns false when one already exists
    pub async fn write(&self, run: &Run, consortium: &Consortium) -> Result<bool, RunError> {
        let record = ProvenanceRecord::from_run(run, consortium).map_err(RunError::staging)?;
        let bytes = serde_json::to_vec_pretty(&record).map_err(RunError::staging)?;

        let path = self.path(&run.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RunError::Staging(format!("{}: {}", parent.display(), e)))?;
        }

        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            write_once(&target, |file| file.write_all(&bytes))
        })
        .await
        .map_err(RunError::staging)?
        .map_err(|e| RunError::Staging(format!("{}: {}", path.display(), e)))?;

        if !written {
            debug!("Provenance of run {} already written", run.id);
            return Ok(false);
        }
        info!("Wrote provenance of run {}", run.id);
        Ok(true)
    }
}

/// Fills a temp file beside `path` and persists it unless `path` exists
fn write_once(
    path: &Path,
    fill: impl FnOnce(&mut File) -> std::io::Result<()>,
) -> std::io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    fill(tmp.as_file_mut())?;
    tmp.as_file_mut().sync_all()?;

    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}
