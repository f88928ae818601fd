//! Login sessions
//!
//! A session owns everything a logged-in user drives runs with: the local
//! stores, the container runtime, the execution engine and the controller.
//! The engine lives exactly as long as the session does.

use anyhow::{Context, Result};
use consort_core::domain::run::RunStatus;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::control::RunController;
use crate::engine::{LocalEngine, PipelineEngine};
use crate::observer::RunObserver;
use crate::podman::{ContainerRuntime, PodmanRuntime};
use crate::repository::{ConsortiumRepository, FileStore, RunRepository};
use crate::service::{ConsortiumRuns, MappingService, RunFolder, RunHistory};

pub struct Session {
    config: Config,
    store: Arc<FileStore>,
    engine: Arc<dyn PipelineEngine>,
    controller: Arc<RunController>,
    mapping: MappingService,
    history: RunHistory,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    pub fn controller(&self) -> &Arc<RunController> {
        &self.controller
    }

    pub fn mapping(&self) -> &MappingService {
        &self.mapping
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Mirrors the outputs of every completed run in the local history
    pub async fn mirror_outputs(&self) -> Result<Vec<PathBuf>> {
        let mut by_consortium: BTreeMap<String, Vec<RunFolder>> = BTreeMap::new();
        for run in RunRepository::list(self.store.as_ref()).await? {
            if run.status != RunStatus::Complete {
                continue;
            }
            let name = ConsortiumRepository::get(self.store.as_ref(), &run.consortium_id)
                .await?
                .map(|c| c.name)
                .unwrap_or_else(|| run.consortium_id.clone());
            by_consortium
                .entry(name)
                .or_default()
                .push(RunFolder::from_run(&run));
        }

        let consortia = by_consortium
            .into_iter()
            .map(|(name, runs)| ConsortiumRuns { name, runs })
            .collect();
        Ok(self.controller.mirror_outputs(consortia).await?)
    }
}

/// Holds the session of the logged-in user, if any
pub struct SessionManager {
    config: Config,
    current: Mutex<Option<Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            current: Mutex::new(None),
        }
    }

    /// Logs a user in with the podman runtime and the local engine
    pub async fn login(&self, user_id: &str, observer: Arc<dyn RunObserver>) -> Result<Arc<Session>> {
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(PodmanRuntime::new(self.config.container_bin.clone()));
        let engine = Arc::new(LocalEngine::new(
            Arc::clone(&runtime),
            self.config.engine_dir(),
            self.config.max_iterations,
        ));
        self.login_with(user_id, observer, runtime, engine).await
    }

    /// Logs a user in; logging the same user in again returns the live session
    pub async fn login_with(
        &self,
        user_id: &str,
        observer: Arc<dyn RunObserver>,
        runtime: Arc<dyn ContainerRuntime>,
        engine: Arc<dyn PipelineEngine>,
    ) -> Result<Arc<Session>> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if session.user_id() == user_id {
                return Ok(Arc::clone(session));
            }
            anyhow::bail!(
                "{} is still logged in; log out before switching users",
                session.user_id()
            );
        }

        let mut config = self.config.clone();
        config.user_id = user_id.to_string();
        config.validate()?;

        let store = Arc::new(
            FileStore::open(config.store_dir())
                .await
                .context("Failed to open local store")?,
        );
        let controller = Arc::new(RunController::new(
            &config,
            store.clone(),
            runtime,
            Arc::clone(&engine),
            observer,
        ));

        let session = Arc::new(Session {
            mapping: MappingService::new(store.clone(), store.clone()),
            history: RunHistory::new(store.clone(), Arc::clone(&controller)),
            config,
            store,
            engine,
            controller,
        });

        info!("Logged in as {}", user_id);
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Shuts the engine down, then forgets the session
    pub async fn logout(&self) {
        let mut current = self.current.lock().await;
        let Some(session) = current.as_ref() else {
            return;
        };

        session.engine.shutdown().await;
        info!("Logged out {}", session.user_id());
        *current = None;
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().await.clone()
    }
}
