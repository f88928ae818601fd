//! Run history
//!
//! Folds run changes pushed by the remote side into the local run store.

use anyhow::{Context, Result};
use chrono::Utc;
use consort_core::domain::run::{Run, RunStatus};
use consort_core::dto::run::RemoteRunChange;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::control::RunController;
use crate::repository::RunRepository;

pub struct RunHistory {
    runs: Arc<dyn RunRepository>,
    controller: Arc<RunController>,
}

impl RunHistory {
    pub fn new(runs: Arc<dyn RunRepository>, controller: Arc<RunController>) -> Self {
        Self { runs, controller }
    }

    /// Applies one remote change, returning the record as now stored
    ///
    /// `suspended` holds the ids of runs the remote side reports as paused.
    pub async fn reconcile(
        &self,
        change: RemoteRunChange,
        suspended: &HashSet<String>,
    ) -> Result<Option<Run>> {
        let RemoteRunChange { mut run, delete } = change;

        if delete {
            if self.runs.delete(&run.id).await? {
                info!("Removed run {} deleted remotely", run.id);
            }
            return Ok(None);
        }

        let status = if run.results.is_some() {
            Some(RunStatus::Complete)
        } else if run.error.is_some() {
            Some(RunStatus::Error)
        } else if suspended.contains(&run.id) {
            Some(RunStatus::Suspended)
        } else {
            None
        };

        let Some(status) = status else {
            return self.track_progress(run).await.map(Some);
        };

        run.status = status;
        if run.end_date.is_none() {
            run.end_date = Some(Utc::now());
        }

        self.controller.clean_run(&run.id).await;
        self.runs
            .put(&run)
            .await
            .with_context(|| format!("Failed to store run {}", run.id))?;
        info!("Run {} finished remotely as {}", run.id, run.status);
        Ok(Some(run))
    }

    /// Unfinished runs only carry the remote pipeline state forward
    async fn track_progress(&self, remote: Run) -> Result<Run> {
        let run = match self.runs.get(&remote.id).await? {
            Some(mut local) => {
                local.remote_pipeline_state = remote.remote_pipeline_state;
                local
            }
            None => remote,
        };
        self.runs
            .put(&run)
            .await
            .with_context(|| format!("Failed to store run {}", run.id))?;
        debug!("Updated remote state of run {}", run.id);
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::repository::FileStore;
    use crate::testing::{FakeEngine, FakeRuntime, RecordingObserver, snapshot};
    use consort_core::domain::run::{ErrorReport, RunType};
    use serde_json::json;

    struct Fixture {
        app: tempfile::TempDir,
        store: Arc<FileStore>,
        engine: Arc<FakeEngine>,
        history: RunHistory,
    }

    async fn fixture() -> Fixture {
        let app = tempfile::tempdir().unwrap();
        let config = Config::new("user-1".to_string(), app.path().to_path_buf());
        let store = Arc::new(FileStore::open(config.store_dir()).await.unwrap());
        let engine = Arc::new(FakeEngine::resolving(json!({})));
        let controller = Arc::new(RunController::new(
            &config,
            store.clone(),
            Arc::new(FakeRuntime::new()),
            engine.clone(),
            Arc::new(RecordingObserver::default()),
        ));

        Fixture {
            history: RunHistory::new(store.clone(), controller),
            app,
            store,
            engine,
        }
    }

    fn remote(run: Run) -> RemoteRunChange {
        RemoteRunChange { run, delete: false }
    }

    fn decentralized() -> Run {
        let mut run = Run::new("run-1", "cons-1", snapshot(), RunType::Decentralized);
        run.status = RunStatus::Running;
        run
    }

    #[tokio::test]
    async fn test_results_complete_run_and_clean_up() {
        let f = fixture().await;
        let staged = f.app.path().join("staging/user-1/run-1");
        std::fs::create_dir_all(&staged).unwrap();
        let mut run = decentralized();
        run.results = Some(json!({"global": [1, 2]}));

        let stored = f
            .history
            .reconcile(remote(run), &HashSet::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.status, RunStatus::Complete);
        assert!(stored.end_date.is_some());
        assert!(!staged.exists());
        assert_eq!(*f.engine.unlinked.lock().unwrap(), vec!["run-1"]);
        let saved = f.store.get("run-1").await.unwrap().unwrap();
        assert_eq!(saved.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn test_error_and_suspension_are_terminal() {
        let f = fixture().await;
        let mut failed = decentralized();
        failed.error = Some(ErrorReport::new("remote failure"));

        let stored = f
            .history
            .reconcile(remote(failed), &HashSet::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RunStatus::Error);

        let mut paused = decentralized();
        paused.id = "run-2".to_string();
        let suspended: HashSet<String> = ["run-2".to_string()].into_iter().collect();
        let stored = f
            .history
            .reconcile(remote(paused), &suspended)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RunStatus::Suspended);
    }

    #[tokio::test]
    async fn test_unfinished_run_only_takes_remote_state() {
        let f = fixture().await;
        let mut local = decentralized();
        local.local_pipeline_state = Some(json!({"iteration": 3}));
        f.store.put(&local).await.unwrap();

        let mut update = decentralized();
        update.remote_pipeline_state = Some(json!({"iteration": 4}));
        let stored = f
            .history
            .reconcile(remote(update), &HashSet::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(stored.local_pipeline_state, Some(json!({"iteration": 3})));
        assert_eq!(stored.remote_pipeline_state, Some(json!({"iteration": 4})));
        assert!(f.engine.unlinked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_run_is_removed() {
        let f = fixture().await;
        f.store.put(&decentralized()).await.unwrap();

        let change = RemoteRunChange {
            run: decentralized(),
            delete: true,
        };
        let stored = f.history.reconcile(change, &HashSet::new()).await.unwrap();

        assert!(stored.is_none());
        assert!(f.store.get("run-1").await.unwrap().is_none());
    }
}
