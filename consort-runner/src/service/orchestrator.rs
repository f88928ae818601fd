//! Run execution orchestrator
//!
//! Drives one run from `queued` to a terminal state:
//! - Resolving the frozen pipeline against the supplied data mappings
//! - Taking the run lease
//! - Pulling every computation image
//! - Staging input files and starting the engine
//! - Relaying live state until the engine settles
//! - Writing provenance, unstaging and reporting the outcome
//!
//! Nothing escapes `execute`: every failure ends up on the run record and is
//! reported through the observer.

use consort_core::domain::consortium::Consortium;
use consort_core::domain::pipeline::PipelineSnapshot;
use consort_core::domain::run::{ErrorReport, Run, RunStatus};
use consort_core::dto::event::{Notice, StateUpdate};
use consort_core::dto::run::StartRun;
use consort_core::mapping;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::engine::{EngineFailure, EngineRun, FailureKind, PipelineEngine, StartPipeline};
use crate::error::RunError;
use crate::observer::RunObserver;
use crate::podman::ContainerRuntime;
use crate::repository::RunRepository;
use crate::service::images::{ImageAcquisition, ProgressSink};
use crate::service::lease::RunLeases;
use crate::service::provenance::ProvenanceWriter;
use crate::service::staging::StagingArea;

pub const DOWNLOADING_IMAGES: &str = "Downloading required docker images";

pub struct RunOrchestrator {
    client_id: String,
    /// `output/<userId>`
    output_dir: PathBuf,
    runs: Arc<dyn RunRepository>,
    runtime: Arc<dyn ContainerRuntime>,
    images: ImageAcquisition,
    engine: Arc<dyn PipelineEngine>,
    staging: StagingArea,
    provenance: ProvenanceWriter,
    leases: RunLeases,
    observer: Arc<dyn RunObserver>,
}

/// Everything the orchestrator is wired to
pub struct OrchestratorParts {
    pub client_id: String,
    pub output_dir: PathBuf,
    pub runs: Arc<dyn RunRepository>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub engine: Arc<dyn PipelineEngine>,
    pub staging: StagingArea,
    pub leases: RunLeases,
    pub observer: Arc<dyn RunObserver>,
}

impl RunOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            client_id: parts.client_id,
            provenance: ProvenanceWriter::new(&parts.output_dir),
            output_dir: parts.output_dir,
            runs: parts.runs,
            images: ImageAcquisition::new(Arc::clone(&parts.runtime)),
            runtime: parts.runtime,
            engine: parts.engine,
            staging: parts.staging,
            leases: parts.leases,
            observer: parts.observer,
        }
    }

    /// Drives a run and returns it in its final local state
    pub async fn execute(&self, request: StartRun) -> Run {
        let StartRun {
            consortium,
            mut run,
            data_mappings,
            network_volume,
        } = request;

        info!("Starting run {} of consortium {}", run.id, consortium.name);

        let resolution = match mapping::resolve(
            &consortium.name,
            &run.pipeline_snapshot().steps,
            &data_mappings.step_io,
            Some(&data_mappings.files_by_group),
        ) {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!("Run {} not started: {}", run.id, err);
                let message = err.to_string();
                self.fail(&mut run, RunError::from(err).report()).await;
                self.observer.on_notice(Notice::warning(message));
                return run;
            }
        };

        self.save(&run).await;
        self.observer.on_saved(&run);

        let _lease = match self.leases.acquire(&consortium.id, &run.id) {
            Ok(lease) => lease,
            Err(err @ RunError::LeaseHeld { .. }) => {
                warn!("{}", err);
                self.observer.on_notice(Notice::warning(err.to_string()));
                return run;
            }
            Err(err) => {
                error!("Failed to lease run {}: {}", run.id, err);
                self.fail(&mut run, err.report()).await;
                return run;
            }
        };

        let pipeline = PipelineSnapshot {
            steps: resolution.steps,
            ..run.pipeline_snapshot().clone()
        };

        match run.status {
            RunStatus::Queued => {
                if let Err(err) = self.acquire_images(&mut run).await {
                    self.fail(&mut run, err.report()).await;
                    return run;
                }
            }
            // Resumed runs already pulled their images
            RunStatus::Suspended => {}
            status => {
                let err = RunError::Execution(format!("run {} is already {}", run.id, status));
                warn!("{}", err);
                self.observer.on_notice(Notice::error(err.report()));
                return run;
            }
        }

        if let Err(e) = self.runtime.prune_images().await {
            warn!("Failed to prune images: {:#}", e);
        }

        if let Err(err) = run.transition(RunStatus::Running) {
            self.fail(&mut run, RunError::from(err).report()).await;
            return run;
        }
        self.save(&run).await;

        let engine_run = match self
            .start_engine(&run, &consortium, pipeline, &data_mappings.files, network_volume)
            .await
        {
            Ok(engine_run) => engine_run,
            Err(err) => {
                error!("Run {} failed to start: {}", run.id, err);
                self.fail(&mut run, err.report()).await;
                return run;
            }
        };

        self.observer.on_notice(Notice::info(format!(
            "Pipeline {} started on consortia {}",
            run.pipeline_snapshot().name,
            consortium.name
        )));

        let outcome = self.relay(&run.id, engine_run).await;
        self.settle(&mut run, &consortium, outcome).await;
        run
    }

    async fn acquire_images(&self, run: &mut Run) -> Result<(), RunError> {
        run.transition(RunStatus::DownloadingImages)?;
        self.save(run).await;

        self.observer
            .on_state_update(&run.id, StateUpdate::controller(DOWNLOADING_IMAGES));

        let observer = Arc::clone(&self.observer);
        let run_id = run.id.clone();
        let sink: ProgressSink = Arc::new(move |progress| observer.on_progress(&run_id, progress));

        let images = run.pipeline_snapshot().images();
        self.images.acquire(&images, sink).await
    }

    async fn start_engine(
        &self,
        run: &Run,
        consortium: &Consortium,
        pipeline: PipelineSnapshot,
        files: &[PathBuf],
        network_volume: bool,
    ) -> Result<EngineRun, RunError> {
        let staged = self.staging.stage(&run.id, files).await?;

        self.engine
            .start_pipeline(StartPipeline {
                consortium_id: consortium.id.clone(),
                pipeline,
                files: staged,
                staging_dir: self.staging.run_dir(&run.id),
                output_dir: self.output_dir.join(&run.id),
                run_id: run.id.clone(),
                client_id: self.client_id.clone(),
                run_type: run.run_type,
                pipeline_steps: run.pipeline_steps.clone(),
                network_volume,
                run_state: run.run_state.clone(),
            })
            .await
            .map_err(|e| RunError::Execution(e.to_string()))
    }

    /// Forwards state updates until the engine settles
    async fn relay(
        &self,
        run_id: &str,
        engine_run: EngineRun,
    ) -> Result<serde_json::Value, EngineFailure> {
        let EngineRun {
            mut updates,
            mut result,
        } = engine_run;

        let outcome = loop {
            tokio::select! {
                biased;
                Some(update) = updates.recv() => self.observer.on_state_update(run_id, update),
                outcome = &mut result => break outcome,
            }
        };

        while let Ok(update) = updates.try_recv() {
            self.observer.on_state_update(run_id, update);
        }
        outcome
    }

    async fn settle(
        &self,
        run: &mut Run,
        consortium: &Consortium,
        outcome: Result<serde_json::Value, EngineFailure>,
    ) {
        let pipeline_name = run.pipeline_snapshot().name.clone();

        match outcome {
            Ok(results) => {
                info!("Run {} finished", run.id);
                if run.is_local() {
                    if let Err(err) = run.complete(results) {
                        self.fail(run, RunError::from(err).report()).await;
                        return;
                    }
                }

                match self.provenance.write(run, consortium).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Provenance of run {} already existed", run.id),
                    Err(e) => warn!("Failed to write provenance of run {}: {}", run.id, e),
                }

                self.staging.unstage_quietly(&run.id).await;

                self.observer.on_notice(Notice::info(format!(
                    "Pipeline {} finished on consortia {}",
                    pipeline_name, consortium.name
                )));

                // Decentralized completion is reported by the remote side
                if run.is_local() {
                    self.save(run).await;
                    self.observer.on_terminal(run);
                }
            }
            Err(EngineFailure { kind, report }) => {
                self.staging.unstage_quietly(&run.id).await;

                let settled = match kind {
                    FailureKind::Failed => {
                        error!("Run {} failed: {}", run.id, report.message);
                        self.observer.on_notice(Notice::warning(format!(
                            "Pipeline {} stopped on consortia {}",
                            pipeline_name, consortium.name
                        )));
                        run.fail(report)
                    }
                    FailureKind::Stopped => {
                        info!("Run {} stopped", run.id);
                        run.stop(report)
                    }
                    FailureKind::Suspended(run_state) => {
                        info!("Run {} suspended", run.id);
                        run.suspend(run_state)
                    }
                };

                if let Err(err) = settled {
                    error!("Run {} could not settle: {}", run.id, err);
                    self.observer.on_notice(Notice::error(RunError::from(err).report()));
                    return;
                }
                self.save(run).await;
                self.observer.on_terminal(run);
            }
        }
    }

    /// Unstages, moves the run to `error`, saves and reports it
    async fn fail(&self, run: &mut Run, report: ErrorReport) {
        self.staging.unstage_quietly(&run.id).await;

        if let Err(err) = run.fail(report) {
            error!("Run {} cannot fail from {}: {}", run.id, run.status, err);
            return;
        }
        self.save(run).await;
        self.observer.on_terminal(run);
    }

    async fn save(&self, run: &Run) {
        if let Err(e) = self.runs.put(run).await {
            warn!("Failed to save run {}: {:#}", run.id, e);
        }
    }
}
