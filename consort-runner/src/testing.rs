//! In-memory fakes shared by the unit tests

use anyhow::Result;
use async_trait::async_trait;
use consort_core::domain::pipeline::{Computation, PipelineSnapshot, PipelineStep};
use consort_core::domain::run::Run;
use consort_core::dto::event::{ImageProgress, Notice, RunEvent, StateUpdate};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

use crate::engine::{EngineError, EngineFailure, EngineRun, PipelineEngine, StartPipeline};
use crate::observer::RunObserver;
use crate::podman::{
    ContainerOutput, ContainerRuntime, ContainerSpec, ImageInfo, ImagePull, PullEvent, PullOutcome,
};

/// Scripted behaviour of one image pull
pub enum FakePull {
    Succeed(Vec<String>),
    Fail(String),
    Immediate(String),
    Hold(mpsc::Receiver<PullEvent>),
}

/// Scripted behaviour of one container run
pub enum FakeContainer {
    Exit(ContainerOutput),
    BlockUntilKilled,
}

type ContainerScript = Box<dyn Fn(&ContainerSpec) -> FakeContainer + Send + Sync>;

pub struct FakeRuntime {
    pulls: Mutex<HashMap<String, FakePull>>,
    script: Mutex<Option<ContainerScript>>,
    pub pulled: Mutex<Vec<String>>,
    pub prunes: AtomicUsize,
    pub removed: Mutex<Vec<String>>,
    pub containers: Mutex<Vec<ContainerSpec>>,
    pub killed: Mutex<Vec<String>>,
    pub started: Notify,
    kill_signal: Notify,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            pulls: Mutex::new(HashMap::new()),
            script: Mutex::new(None),
            pulled: Mutex::new(Vec::new()),
            prunes: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
            containers: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            started: Notify::new(),
            kill_signal: Notify::new(),
        }
    }

    pub fn with_pull(self, image: &str, pull: FakePull) -> Self {
        self.pulls.lock().unwrap().insert(image.to_string(), pull);
        self
    }

    pub fn with_containers(
        self,
        script: impl Fn(&ContainerSpec) -> FakeContainer + Send + Sync + 'static,
    ) -> Self {
        *self.script.lock().unwrap() = Some(Box::new(script));
        self
    }

    pub fn prune_count(&self) -> usize {
        self.prunes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn status(&self) -> Result<String> {
        Ok("fake 1.0".to_string())
    }

    async fn pull_images(&self, images: &[String]) -> Vec<ImagePull> {
        let mut pulls = self.pulls.lock().unwrap();
        self.pulled.lock().unwrap().extend(images.iter().cloned());

        images
            .iter()
            .map(|image| {
                let scripted = pulls
                    .remove(image)
                    .unwrap_or(FakePull::Succeed(Vec::new()));
                let outcome = match scripted {
                    FakePull::Immediate(message) => PullOutcome::Failure(message),
                    FakePull::Hold(rx) => PullOutcome::Stream(rx),
                    FakePull::Succeed(lines) => {
                        let (tx, rx) = mpsc::channel(lines.len().max(1));
                        for line in lines {
                            tx.try_send(PullEvent::Progress(line)).unwrap();
                        }
                        PullOutcome::Stream(rx)
                    }
                    FakePull::Fail(message) => {
                        let (tx, rx) = mpsc::channel(1);
                        tx.try_send(PullEvent::Failed(message)).unwrap();
                        PullOutcome::Stream(rx)
                    }
                };
                ImagePull {
                    image: image.clone(),
                    outcome,
                }
            })
            .collect()
    }

    async fn prune_images(&self) -> Result<()> {
        self.prunes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        if image_id == "in-use" {
            anyhow::bail!("image is in use by a container");
        }
        self.removed.lock().unwrap().push(image_id.to_string());
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(vec![ImageInfo {
            id: "3f2a".to_string(),
            names: vec!["img-a".to_string()],
            size: 10,
        }])
    }

    async fn run_container(&self, spec: ContainerSpec) -> Result<ContainerOutput> {
        self.containers.lock().unwrap().push(spec.clone());
        let behaviour = {
            let script = self.script.lock().unwrap();
            match script.as_ref() {
                Some(script) => script(&spec),
                None => FakeContainer::Exit(ContainerOutput {
                    stdout: r#"{"output":{},"success":true}"#.to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                }),
            }
        };
        self.started.notify_one();

        match behaviour {
            FakeContainer::Exit(output) => Ok(output),
            FakeContainer::BlockUntilKilled => {
                self.kill_signal.notified().await;
                Ok(ContainerOutput {
                    stdout: String::new(),
                    stderr: "killed".to_string(),
                    exit_code: 137,
                })
            }
        }
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        self.killed.lock().unwrap().push(name.to_string());
        self.kill_signal.notify_one();
        Ok(())
    }
}

pub struct FakeEngine {
    outcome: Mutex<Option<Result<Value, EngineFailure>>>,
    updates: Vec<StateUpdate>,
    start_error: Option<String>,
    pub started: Mutex<Vec<StartPipeline>>,
    /// Whether the staging directory existed when the engine was started
    pub staged_at_start: Mutex<Vec<bool>>,
    pub stops: Mutex<Vec<(String, String)>>,
    pub suspends: Mutex<Vec<String>>,
    pub unlinked: Mutex<Vec<String>>,
    pub endpoint: Mutex<Option<String>>,
    pub shutdowns: AtomicUsize,
}

impl FakeEngine {
    pub fn resolving(results: Value) -> Self {
        Self::with_outcome(Ok(results))
    }

    pub fn with_outcome(outcome: Result<Value, EngineFailure>) -> Self {
        Self {
            outcome: Mutex::new(Some(outcome)),
            updates: Vec::new(),
            start_error: None,
            started: Mutex::new(Vec::new()),
            staged_at_start: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            suspends: Mutex::new(Vec::new()),
            unlinked: Mutex::new(Vec::new()),
            endpoint: Mutex::new(None),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn refusing(message: &str) -> Self {
        let mut engine = Self::resolving(Value::Null);
        engine.start_error = Some(message.to_string());
        engine
    }

    pub fn with_updates(mut self, updates: Vec<StateUpdate>) -> Self {
        self.updates = updates;
        self
    }

    pub fn start_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }
}

#[async_trait]
impl PipelineEngine for FakeEngine {
    async fn start_pipeline(&self, request: StartPipeline) -> Result<EngineRun, EngineError> {
        self.staged_at_start
            .lock()
            .unwrap()
            .push(request.staging_dir.exists());
        self.started.lock().unwrap().push(request);

        if let Some(message) = &self.start_error {
            return Err(EngineError::Start(message.clone()));
        }

        let (tx, rx) = mpsc::channel(self.updates.len().max(1));
        for update in &self.updates {
            tx.try_send(update.clone()).unwrap();
        }
        let outcome = self
            .outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Ok(Value::Null));

        Ok(EngineRun {
            updates: rx,
            result: Box::pin(async move { outcome }),
        })
    }

    async fn request_stop(&self, pipeline_id: &str, run_id: &str) -> Result<(), EngineError> {
        if run_id == "missing" {
            return Err(EngineError::NotRunning(run_id.to_string()));
        }
        self.stops
            .lock()
            .unwrap()
            .push((pipeline_id.to_string(), run_id.to_string()));
        Ok(())
    }

    async fn suspend(&self, run_id: &str) -> Result<(), EngineError> {
        self.suspends.lock().unwrap().push(run_id.to_string());
        Ok(())
    }

    async fn unlink_files(&self, run_id: &str) -> Result<(), EngineError> {
        self.unlinked.lock().unwrap().push(run_id.to_string());
        Ok(())
    }

    fn set_remote_endpoint(&self, url: &str) {
        *self.endpoint.lock().unwrap() = Some(url.to_string());
    }

    async fn shutdown(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Observer that records every callback as a `RunEvent`
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn terminal_runs(&self) -> Vec<Run> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RunEvent::Terminal { run } => Some(run),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RunEvent::Notice { notice } => Some(notice),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: RunEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RunObserver for RecordingObserver {
    fn on_saved(&self, run: &Run) {
        self.push(RunEvent::Saved { run: run.clone() });
    }

    fn on_progress(&self, run_id: &str, progress: ImageProgress) {
        self.push(RunEvent::Progress {
            run_id: run_id.to_string(),
            progress,
        });
    }

    fn on_state_update(&self, run_id: &str, update: StateUpdate) {
        self.push(RunEvent::StateUpdate {
            run_id: run_id.to_string(),
            update,
        });
    }

    fn on_terminal(&self, run: &Run) {
        self.push(RunEvent::Terminal { run: run.clone() });
    }

    fn on_notice(&self, notice: Notice) {
        self.push(RunEvent::Notice { notice });
    }
}

/// A two-step snapshot using `img-a` and `img-b`
pub fn snapshot() -> PipelineSnapshot {
    let step = |id: &str, image: &str| PipelineStep {
        id: id.to_string(),
        computations: vec![Computation {
            id: format!("comp-{}", id),
            name: image.to_string(),
            docker_image: image.to_string(),
            command: vec!["python".to_string(), "entry.py".to_string()],
        }],
        input_map: Default::default(),
        controller: None,
    };

    PipelineSnapshot {
        id: "pipe-1".to_string(),
        name: "Regression".to_string(),
        steps: vec![step("s1", "img-a"), step("s2", "img-b"), step("s3", "img-a")],
    }
}

/// Polls `check` until it holds or a second passes
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
