//! Output mirror
//!
//! Builds a browsable tree of run outputs under `runs/<userId>/`:
//! `<consortium>/<pipeline> - <runId> - <YYYY-MM-DD>/…`, each file a symlink
//! into the canonical `output/<userId>/<runId>/` directory.

use chrono::{DateTime, Utc};
use consort_core::domain::run::Run;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::RunError;

/// The runs of one consortium to mirror
#[derive(Debug, Clone, PartialEq)]
pub struct ConsortiumRuns {
    pub name: String,
    pub runs: Vec<RunFolder>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunFolder {
    pub id: String,
    pub pipeline_name: String,
    pub end_date: DateTime<Utc>,
}

impl RunFolder {
    /// Unfinished runs are dated by their start
    pub fn from_run(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            pipeline_name: run.pipeline_snapshot().name.clone(),
            end_date: run.end_date.unwrap_or(run.start_date),
        }
    }

    fn dir_name(&self) -> String {
        format!(
            "{} - {} - {}",
            self.pipeline_name,
            self.id,
            self.end_date.format("%Y-%m-%d")
        )
    }
}

#[derive(Debug, Clone)]
pub struct OutputMirror {
    output_root: PathBuf,
    runs_root: PathBuf,
}

impl OutputMirror {
    /// `output_root` is `output/<userId>`, `runs_root` is `runs/<userId>`
    pub fn new(output_root: impl Into<PathBuf>, runs_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            runs_root: runs_root.into(),
        }
    }

    /// Links every output file; returns the links made, relative to `runs/<userId>`
    pub async fn mirror(&self, consortia: Vec<ConsortiumRuns>) -> Result<Vec<PathBuf>, RunError> {
        let output_root = self.output_root.clone();
        let runs_root = self.runs_root.clone();

        tokio::task::spawn_blocking(move || mirror_tree(&output_root, &runs_root, &consortia))
            .await
            .map_err(RunError::staging)?
    }
}

fn mirror_tree(
    output_root: &Path,
    runs_root: &Path,
    consortia: &[ConsortiumRuns],
) -> Result<Vec<PathBuf>, RunError> {
    let mut created = Vec::new();

    for consortium in consortia {
        let consortium_dir = runs_root.join(sanitize(&consortium.name));

        for run in &consortium.runs {
            let source_dir = output_root.join(&run.id);
            if !source_dir.is_dir() {
                debug!("No outputs for run {}", run.id);
                continue;
            }
            let run_dir = consortium_dir.join(run.dir_name());

            for entry in WalkDir::new(&source_dir).min_depth(1) {
                let entry = entry.map_err(RunError::staging)?;
                if entry.file_type().is_dir() {
                    continue;
                }

                let relative = entry
                    .path()
                    .strip_prefix(&source_dir)
                    .map_err(RunError::staging)?;
                let link = run_dir.join(relative);

                if link.symlink_metadata().is_ok() {
                    continue;
                }
                if let Some(parent) = link.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| RunError::Staging(format!("{}: {}", parent.display(), e)))?;
                }
                symlink(entry.path(), &link)?;

                if let Ok(shown) = link.strip_prefix(runs_root) {
                    created.push(shown.to_path_buf());
                }
            }
        }
    }

    info!("Mirrored {} output file(s)", created.len());
    Ok(created)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<(), RunError> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| RunError::Staging(format!("{}: {}", link.display(), e)))
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> Result<(), RunError> {
    std::fs::copy(target, link)
        .map(|_| ())
        .map_err(|e| RunError::Staging(format!("{}: {}", link.display(), e)))
}

/// Every character outside `[a-z0-9]` (either case) becomes `_`, then lowercase
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn folder() -> RunFolder {
        RunFolder {
            id: "run-1".to_string(),
            pipeline_name: "Regression".to_string(),
            end_date: Utc.with_ymd_and_hms(2024, 3, 9, 17, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Brain Study #2"), "brain_study__2");
        assert_eq!(sanitize("ÄBC"), "_bc");
    }

    #[test]
    fn test_run_dir_name() {
        assert_eq!(folder().dir_name(), "Regression - run-1 - 2024-03-09");
    }

    #[tokio::test]
    async fn test_mirror_links_outputs_once() {
        let app = tempfile::tempdir().unwrap();
        let output_root = app.path().join("output").join("user-1");
        let runs_root = app.path().join("runs").join("user-1");
        std::fs::create_dir_all(output_root.join("run-1").join("local0")).unwrap();
        std::fs::write(output_root.join("run-1").join("local0").join("beta.json"), "{}").unwrap();
        std::fs::write(output_root.join("run-1").join("provenance.json"), "{}").unwrap();

        let mirror = OutputMirror::new(&output_root, &runs_root);
        let consortia = vec![
            ConsortiumRuns {
                name: "Brain Study".to_string(),
                runs: vec![folder()],
            },
            ConsortiumRuns {
                name: "Empty".to_string(),
                runs: vec![RunFolder {
                    id: "no-output".to_string(),
                    ..folder()
                }],
            },
        ];

        let mut created = mirror.mirror(consortia.clone()).await.unwrap();
        created.sort();

        let run_dir = PathBuf::from("brain_study").join("Regression - run-1 - 2024-03-09");
        assert_eq!(
            created,
            vec![run_dir.join("local0").join("beta.json"), run_dir.join("provenance.json")]
        );
        assert!(runs_root.join(&run_dir).join("provenance.json").exists());

        let again = mirror.mirror(consortia).await.unwrap();
        assert!(again.is_empty());
    }
}
