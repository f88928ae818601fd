//! Local execution engine
//!
//! Runs `local` pipelines step by step on this machine. Every computation is a
//! container fed a JSON document on stdin and answering with one on stdout:
//!
//! ```text
//! in:  {"input": {...}, "state": {...}, "cache": {...}}
//! out: {"output": {...}, "cache": {...}, "success": true}
//! ```
//!
//! A step repeats until its computations report `success`, bounded by the
//! configured maximum number of iterations.

use async_trait::async_trait;
use consort_core::domain::pipeline::PipelineStep;
use consort_core::domain::run::{ErrorReport, RunType};
use consort_core::dto::event::StateUpdate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{EngineError, EngineFailure, EngineRun, PipelineEngine, StartPipeline};
use crate::podman::{ContainerRuntime, ContainerSpec, Mount};

const INPUT_DIR: &str = "/input";
const TRANSFER_DIR: &str = "/transfer";
const OUTPUT_DIR: &str = "/output";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Continue,
    Stop,
    Suspend,
}

struct RunHandle {
    pipeline_id: String,
    control: watch::Sender<Control>,
    /// Name of the container currently executing, if any
    container: Mutex<Option<String>>,
}

/// Where a suspended run picks up again
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeState {
    step: usize,
    iteration: u64,
    #[serde(default)]
    cache: Value,
    #[serde(default)]
    previous_output: Value,
}

#[derive(Debug, Deserialize)]
struct ComputationOutput {
    #[serde(default)]
    output: Value,
    #[serde(default)]
    cache: Option<Value>,
    #[serde(default)]
    success: bool,
}

type Registry = Arc<Mutex<HashMap<String, Arc<RunHandle>>>>;

/// `PipelineEngine` executing local runs in containers
pub struct LocalEngine {
    runtime: Arc<dyn ContainerRuntime>,
    work_dir: PathBuf,
    max_iterations: u64,
    remote_endpoint: RwLock<Option<String>>,
    runs: Registry,
    drained: Arc<Notify>,
    shut_down: AtomicBool,
}

impl LocalEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, work_dir: impl Into<PathBuf>, max_iterations: u64) -> Self {
        Self {
            runtime,
            work_dir: work_dir.into(),
            max_iterations,
            remote_endpoint: RwLock::new(None),
            runs: Arc::new(Mutex::new(HashMap::new())),
            drained: Arc::new(Notify::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Last endpoint handed to `set_remote_endpoint`
    pub fn remote_endpoint(&self) -> Option<String> {
        self.remote_endpoint.read().ok().and_then(|e| e.clone())
    }

    async fn signal(&self, run_id: &str, control: Control) -> Result<(), EngineError> {
        let handle = self
            .runs
            .lock()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::NotRunning(run_id.to_string()))?;

        handle.control.send_replace(control);

        let container = handle.container.lock().await.clone();
        if let Some(name) = container {
            if let Err(e) = self.runtime.kill_container(&name).await {
                warn!("Failed to kill container {}: {:#}", name, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineEngine for LocalEngine {
    async fn start_pipeline(&self, request: StartPipeline) -> Result<EngineRun, EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        if request.run_type == RunType::Decentralized {
            return Err(EngineError::Unsupported(format!(
                "run {} is decentralized; the local engine only runs local pipelines",
                request.run_id
            )));
        }

        let (control_tx, control_rx) = watch::channel(Control::Continue);
        let handle = Arc::new(RunHandle {
            pipeline_id: request.pipeline.id.clone(),
            control: control_tx,
            container: Mutex::new(None),
        });

        {
            let mut runs = self.runs.lock().await;
            if runs.contains_key(&request.run_id) {
                return Err(EngineError::Start(format!(
                    "run {} is already executing",
                    request.run_id
                )));
            }
            runs.insert(request.run_id.clone(), Arc::clone(&handle));
        }

        info!(
            "Starting local pipeline {} for run {}",
            request.pipeline.name, request.run_id
        );

        let (updates_tx, updates_rx) = mpsc::channel(64);
        let (result_tx, result_rx) = oneshot::channel();
        let run_id = request.run_id.clone();

        let driver = Driver {
            runtime: Arc::clone(&self.runtime),
            run_dir: self.work_dir.join(&request.run_id),
            max_iterations: self.max_iterations,
            handle,
            control: control_rx,
            updates: updates_tx,
            request,
        };

        let runs = Arc::clone(&self.runs);
        let drained = Arc::clone(&self.drained);
        tokio::spawn(async move {
            let outcome = driver.drive().await;
            runs.lock().await.remove(&run_id);
            drained.notify_waiters();
            if result_tx.send(outcome).is_err() {
                debug!("Result of run {} had no listener", run_id);
            }
        });

        Ok(EngineRun {
            updates: updates_rx,
            result: Box::pin(async move {
                result_rx.await.unwrap_or_else(|_| {
                    Err(EngineFailure::failed(ErrorReport::new(
                        "Engine dropped the run before it finished",
                    )))
                })
            }),
        })
    }

    async fn request_stop(&self, pipeline_id: &str, run_id: &str) -> Result<(), EngineError> {
        if let Some(handle) = self.runs.lock().await.get(run_id) {
            if handle.pipeline_id != pipeline_id {
                warn!(
                    "Stop for run {} names pipeline {}, run uses {}",
                    run_id, pipeline_id, handle.pipeline_id
                );
            }
        }
        info!("Stopping run {}", run_id);
        self.signal(run_id, Control::Stop).await
    }

    async fn suspend(&self, run_id: &str) -> Result<(), EngineError> {
        info!("Suspending run {}", run_id);
        self.signal(run_id, Control::Suspend).await
    }

    async fn unlink_files(&self, run_id: &str) -> Result<(), EngineError> {
        match tokio::fs::remove_dir_all(self.work_dir.join(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_remote_endpoint(&self, url: &str) {
        if let Ok(mut endpoint) = self.remote_endpoint.write() {
            *endpoint = Some(url.to_string());
        }
        info!("Remote endpoint set to {}", url);
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);

        let active: Vec<String> = self.runs.lock().await.keys().cloned().collect();
        for run_id in &active {
            if let Err(e) = self.signal(run_id, Control::Stop).await {
                debug!("Run {} ended during shutdown: {}", run_id, e);
            }
        }

        loop {
            let drained = self.drained.notified();
            if self.runs.lock().await.is_empty() {
                break;
            }
            drained.await;
        }
        info!("Local engine shut down");
    }
}

/// Executes one run; owned by the run's task
struct Driver {
    runtime: Arc<dyn ContainerRuntime>,
    run_dir: PathBuf,
    max_iterations: u64,
    handle: Arc<RunHandle>,
    control: watch::Receiver<Control>,
    updates: mpsc::Sender<StateUpdate>,
    request: StartPipeline,
}

impl Driver {
    async fn drive(self) -> Result<Value, EngineFailure> {
        let resume: ResumeState = self
            .request
            .run_state
            .clone()
            .and_then(|state| serde_json::from_value(state).ok())
            .unwrap_or_default();

        let mut cache = if resume.cache.is_null() {
            json!({})
        } else {
            resume.cache.clone()
        };
        let mut previous = resume.previous_output.clone();

        tokio::fs::create_dir_all(&self.request.output_dir)
            .await
            .map_err(|e| failure(format!("{}: {}", self.request.output_dir.display(), e), None))?;

        let steps = self.request.pipeline.steps.clone();
        for (index, step) in steps.iter().enumerate().skip(resume.step) {
            let transfer = self.run_dir.join(format!("step-{}", index));
            tokio::fs::create_dir_all(&transfer)
                .await
                .map_err(|e| failure(format!("{}: {}", transfer.display(), e), None))?;

            let input = step_input(step);
            let mut iteration = if index == resume.step {
                resume.iteration.max(1)
            } else {
                1
            };

            loop {
                let checkpoint = ResumeState {
                    step: index,
                    iteration,
                    cache: cache.clone(),
                    previous_output: previous.clone(),
                };
                self.check_control(&checkpoint)?;

                self.emit(StateUpdate {
                    current_iteration: Some(iteration),
                    pipeline_step: Some(index),
                    controller_state: Some("iterating".to_string()),
                    mode: Some("local".to_string()),
                    ..Default::default()
                })
                .await;

                let mut success = true;
                let mut step_output = Value::Null;

                for (position, computation) in step.computations.iter().enumerate() {
                    let payload = json!({
                        "input": input,
                        "cache": cache,
                        "state": {
                            "clientId": self.request.client_id,
                            "runId": self.request.run_id,
                            "consortiumId": self.request.consortium_id,
                            "baseDirectory": INPUT_DIR,
                            "transferDirectory": TRANSFER_DIR,
                            "outputDirectory": OUTPUT_DIR,
                            "iteration": iteration,
                            "step": index,
                            "stepConfig": self.request.pipeline_steps.get(index),
                            "previousOutput": previous,
                        },
                    });

                    let spec = ContainerSpec {
                        name: container_name(&self.request.run_id, index, position, iteration),
                        image: computation.docker_image.clone(),
                        command: computation.command.clone(),
                        mounts: vec![
                            Mount {
                                host: self.request.staging_dir.clone(),
                                container: INPUT_DIR.to_string(),
                                read_only: true,
                            },
                            Mount {
                                host: transfer.clone(),
                                container: TRANSFER_DIR.to_string(),
                                read_only: false,
                            },
                            Mount {
                                host: self.request.output_dir.clone(),
                                container: OUTPUT_DIR.to_string(),
                                read_only: false,
                            },
                        ],
                        network: self.request.network_volume,
                        stdin: payload.to_string().into_bytes(),
                    };

                    *self.handle.container.lock().await = Some(spec.name.clone());
                    let ran = self.runtime.run_container(spec).await;
                    *self.handle.container.lock().await = None;

                    // A kill shows up as a failed container; report why it was killed
                    self.check_control(&checkpoint)?;

                    let ran = ran.map_err(|e| {
                        failure(format!("{:#}", e), Some(input.clone()))
                    })?;
                    if !ran.success() {
                        let detail = ran.stderr.lines().last().unwrap_or_default().trim();
                        return Err(failure(
                            format!(
                                "Computation {} exited with code {}: {}",
                                computation.name, ran.exit_code, detail
                            ),
                            Some(input.clone()),
                        ));
                    }

                    let parsed = parse_output(&ran.stdout).map_err(|message| {
                        failure(
                            format!("Computation {} {}", computation.name, message),
                            Some(input.clone()),
                        )
                    })?;
                    if let Some(next_cache) = parsed.cache {
                        cache = next_cache;
                    }
                    success &= parsed.success;
                    step_output = parsed.output;
                }

                if success {
                    previous = step_output;
                    break;
                }
                if iteration >= self.max_iterations {
                    return Err(failure(
                        format!(
                            "Step {} did not finish within {} iterations",
                            index, self.max_iterations
                        ),
                        Some(input.clone()),
                    ));
                }
                iteration += 1;
            }

            cache = json!({});
        }

        self.emit(StateUpdate {
            controller_state: Some("complete".to_string()),
            mode: Some("local".to_string()),
            ..Default::default()
        })
        .await;

        info!("Local run {} completed", self.request.run_id);
        Ok(previous)
    }

    fn check_control(&self, checkpoint: &ResumeState) -> Result<(), EngineFailure> {
        match *self.control.borrow() {
            Control::Continue => Ok(()),
            Control::Stop => Err(EngineFailure::stopped(ErrorReport::new(
                "Pipeline stopped by user",
            ))),
            Control::Suspend => {
                let state = serde_json::to_value(checkpoint).unwrap_or(Value::Null);
                Err(EngineFailure::suspended(state))
            }
        }
    }

    async fn emit(&self, update: StateUpdate) {
        if self.updates.send(update).await.is_err() {
            debug!("State update of run {} dropped", self.request.run_id);
        }
    }
}

fn failure(message: String, input: Option<Value>) -> EngineFailure {
    error!("{}", message);
    let report = ErrorReport::new(message);
    EngineFailure::failed(match input {
        Some(input) => report.with_input(input),
        None => report,
    })
}

/// Resolved values of a step's inputs, by key
fn step_input(step: &PipelineStep) -> Value {
    let input: Map<String, Value> = step
        .input_map
        .iter()
        .map(|(key, spec)| (key.clone(), spec.value.clone().unwrap_or(Value::Null)))
        .collect();
    Value::Object(input)
}

/// The computation answers with its last non-empty stdout line
fn parse_output(stdout: &str) -> Result<ComputationOutput, String> {
    let line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| "produced no output".to_string())?;
    serde_json::from_str(line).map_err(|e| format!("produced invalid output: {}", e))
}

fn container_name(run_id: &str, step: usize, position: usize, iteration: u64) -> String {
    let run: String = run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("consort-{}-{}-{}-{}", run, step, position, iteration)
}
