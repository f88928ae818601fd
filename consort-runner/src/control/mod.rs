//! Run control surface
//!
//! The one entry point front-ends use to drive runs: start, stop, suspend,
//! clean up, fetch results and manage computation images.

use consort_core::domain::run::{ErrorReport, Run};
use consort_core::dto::event::Notice;
use consort_core::dto::run::StartRun;
use rand::RngExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::PipelineEngine;
use crate::error::RunError;
use crate::observer::RunObserver;
use crate::podman::{ContainerRuntime, ImageInfo};
use crate::repository::RunRepository;
use crate::service::{
    AssetDownloader, ConsortiumRuns, ImageAcquisition, OrchestratorParts, OutputMirror,
    ProgressSink, RunLeases, RunOrchestrator, StagingArea,
};

pub struct RunController {
    client_id: String,
    api_url: String,
    max_start_jitter: Duration,
    orchestrator: Arc<RunOrchestrator>,
    engine: Arc<dyn PipelineEngine>,
    runtime: Arc<dyn ContainerRuntime>,
    staging: StagingArea,
    assets: AssetDownloader,
    outputs: OutputMirror,
    observer: Arc<dyn RunObserver>,
}

impl RunController {
    pub fn new(
        config: &Config,
        runs: Arc<dyn RunRepository>,
        runtime: Arc<dyn ContainerRuntime>,
        engine: Arc<dyn PipelineEngine>,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        let user_output = config.output_root().join(&config.user_id);
        let staging = StagingArea::new(config.staging_dir());

        let orchestrator = RunOrchestrator::new(OrchestratorParts {
            client_id: config.user_id.clone(),
            output_dir: user_output.clone(),
            runs,
            runtime: Arc::clone(&runtime),
            engine: Arc::clone(&engine),
            staging: staging.clone(),
            leases: RunLeases::new(config.leases_dir(), config.lease_ttl),
            observer: Arc::clone(&observer),
        });

        Self {
            client_id: config.user_id.clone(),
            api_url: config.api_url.clone(),
            max_start_jitter: config.max_start_jitter,
            orchestrator: Arc::new(orchestrator),
            engine,
            runtime,
            staging,
            assets: AssetDownloader::new(config.output_root()),
            outputs: OutputMirror::new(user_output, config.runs_dir()),
            observer,
        }
    }

    /// Starts driving a run after a random delay
    ///
    /// The delay spreads out the sites of a consortium that all react to the
    /// same remote start. The handle resolves with the run in its final local
    /// state; failures are on the run and reported through the observer.
    pub fn start_run(&self, request: StartRun) -> JoinHandle<Run> {
        let jitter = self.jitter();
        let orchestrator = Arc::clone(&self.orchestrator);
        debug!(
            "Starting run {} in {}ms",
            request.run.id,
            jitter.as_millis()
        );

        tokio::spawn(async move {
            tokio::time::sleep(jitter).await;
            orchestrator.execute(request).await
        })
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.max_start_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }

    /// Asks the engine to stop a run; refusals are reported as notices
    pub async fn stop_run(&self, pipeline_id: &str, run_id: &str) {
        info!("Stop requested for run {}", run_id);
        if let Err(e) = self.engine.request_stop(pipeline_id, run_id).await {
            warn!("Stop of run {} refused: {}", run_id, e);
            self.observer
                .on_notice(Notice::error(ErrorReport::from_error(&e)));
        }
    }

    /// Asks the engine to suspend a run; refusals are reported as notices
    pub async fn suspend_run(&self, run_id: &str) {
        info!("Suspend requested for run {}", run_id);
        if let Err(e) = self.engine.suspend(run_id).await {
            warn!("Suspend of run {} refused: {}", run_id, e);
            self.observer
                .on_notice(Notice::error(ErrorReport::from_error(&e)));
        }
    }

    pub fn set_remote_endpoint(&self, url: &str) {
        self.engine.set_remote_endpoint(url);
    }

    /// Fetches a run's result bundle into its output directory
    pub async fn download_run_assets(
        &self,
        run_id: &str,
        auth_token: &str,
    ) -> Result<PathBuf, RunError> {
        self.assets
            .download(run_id, auth_token, &self.client_id, &self.api_url)
            .await
    }

    /// Removes a run's staged files and the engine's scratch files
    pub async fn clean_run(&self, run_id: &str) {
        self.staging.unstage_quietly(run_id).await;
        if let Err(e) = self.engine.unlink_files(run_id).await {
            warn!("Failed to unlink engine files of run {}: {}", run_id, e);
        }
        debug!("Cleaned run {}", run_id);
    }

    /// Pulls images outside of any run
    pub async fn pull_images(&self, images: &[String], sink: ProgressSink) -> Result<(), RunError> {
        ImageAcquisition::new(Arc::clone(&self.runtime))
            .acquire(images, sink)
            .await
    }

    /// Version of the container runtime, failing when it does not answer
    pub async fn runtime_status(&self) -> Result<String, RunError> {
        self.runtime.status().await.map_err(RunError::runtime)
    }

    pub async fn list_images(&self) -> Result<Vec<ImageInfo>, RunError> {
        self.runtime.list_images().await.map_err(RunError::runtime)
    }

    pub async fn remove_image(&self, image_id: &str) -> Result<(), RunError> {
        self.runtime
            .remove_image(image_id)
            .await
            .map_err(RunError::runtime)?;
        info!("Removed image {}", image_id);
        Ok(())
    }

    /// Mirrors run outputs into the browsable `runs/` tree
    pub async fn mirror_outputs(
        &self,
        consortia: Vec<ConsortiumRuns>,
    ) -> Result<Vec<PathBuf>, RunError> {
        self.outputs.mirror(consortia).await
    }
}
