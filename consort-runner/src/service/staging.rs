//! Run staging area
//!
//! Input files of a run are linked into `staging/<userId>/<runId>/`, each one
//! under its own absolute path (`/data/a.csv` becomes `<runDir>/data/a.csv`).
//! Hard links are used so the files stay readable when the directory is
//! mounted into a container; files on another filesystem are copied.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::RunError;

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// `root` is the user's staging directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Stages `files` for a run and returns the staged paths
    pub async fn stage(&self, run_id: &str, files: &[PathBuf]) -> Result<Vec<PathBuf>, RunError> {
        let run_dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| RunError::Staging(format!("{}: {}", run_dir.display(), e)))?;

        let mut staged = Vec::with_capacity(files.len());
        for file in files {
            let target = run_dir.join(relative_to_root(file)?);

            if tokio::fs::symlink_metadata(&target).await.is_ok() {
                staged.push(target);
                continue;
            }

            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RunError::Staging(format!("{}: {}", parent.display(), e)))?;
            }

            if let Err(link_err) = tokio::fs::hard_link(file, &target).await {
                debug!(
                    "Hard link of {} failed ({}), copying instead",
                    file.display(),
                    link_err
                );
                tokio::fs::copy(file, &target)
                    .await
                    .map_err(|e| RunError::Staging(format!("{}: {}", file.display(), e)))?;
            }
            staged.push(target);
        }

        info!("Staged {} file(s) for run {}", staged.len(), run_id);
        Ok(staged)
    }

    /// Removes a run's staging directory; a missing directory is fine
    pub async fn unstage(&self, run_id: &str) -> Result<(), RunError> {
        let run_dir = self.run_dir(run_id);
        match tokio::fs::remove_dir_all(&run_dir).await {
            Ok(()) => {
                debug!("Unstaged files of run {}", run_id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RunError::Staging(format!("{}: {}", run_dir.display(), e))),
        }
    }

    /// Unstages, logging instead of failing
    pub async fn unstage_quietly(&self, run_id: &str) {
        if let Err(e) = self.unstage(run_id).await {
            warn!("Failed to unstage run {}: {}", run_id, e);
        }
    }
}

/// `/data/a.csv` -> `data/a.csv`; relative or parent-escaping paths are rejected
fn relative_to_root(file: &Path) -> Result<PathBuf, RunError> {
    if !file.is_absolute() {
        return Err(RunError::Staging(format!(
            "{} is not an absolute path",
            file.display()
        )));
    }

    let mut relative = PathBuf::new();
    for component in file.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(RunError::Staging(format!(
                    "{} must not contain '..'",
                    file.display()
                )));
            }
        }
    }
    Ok(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_mirrors_absolute_paths() {
        let data = tempfile::tempdir().unwrap();
        let staging_root = tempfile::tempdir().unwrap();
        let file = data.path().join("site1").join("a.csv");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "age,isControl\n30,true\n").unwrap();

        let staging = StagingArea::new(staging_root.path());
        let staged = staging.stage("run-1", &[file.clone()]).await.unwrap();

        let expected = staging
            .run_dir("run-1")
            .join(file.strip_prefix("/").unwrap());
        assert_eq!(staged, vec![expected.clone()]);
        assert_eq!(
            std::fs::read_to_string(expected).unwrap(),
            "age,isControl\n30,true\n"
        );
    }

    #[tokio::test]
    async fn test_stage_twice_is_harmless() {
        let data = tempfile::tempdir().unwrap();
        let staging_root = tempfile::tempdir().unwrap();
        let file = data.path().join("a.csv");
        std::fs::write(&file, "x").unwrap();

        let staging = StagingArea::new(staging_root.path());
        staging.stage("run-1", &[file.clone()]).await.unwrap();
        let again = staging.stage("run-1", &[file]).await.unwrap();

        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_unstage_is_idempotent() {
        let staging_root = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(staging_root.path());

        staging.unstage("never-staged").await.unwrap();

        std::fs::create_dir_all(staging.run_dir("run-1").join("data")).unwrap();
        staging.unstage("run-1").await.unwrap();
        staging.unstage("run-1").await.unwrap();
        assert!(!staging.run_dir("run-1").exists());
    }

    #[tokio::test]
    async fn test_relative_paths_rejected() {
        let staging_root = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(staging_root.path());

        let err = staging
            .stage("run-1", &[PathBuf::from("data/a.csv")])
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Staging(_)));
    }

    #[test]
    fn test_parent_components_rejected() {
        assert!(relative_to_root(Path::new("/data/../etc/passwd")).is_err());
        assert_eq!(
            relative_to_root(Path::new("/data/./a.csv")).unwrap(),
            PathBuf::from("data/a.csv")
        );
    }
}
