//! Podman container runtime
//!
//! Handles everything the controller needs from a container engine:
//! - Checking podman availability
//! - Pulling computation images with streamed progress
//! - Listing, removing and pruning local images
//! - Running one computation container to completion, and killing it

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One event of a streamed pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullEvent {
    Progress(String),
    Failed(String),
}

/// Result of asking the runtime for one image
///
/// A stream ends successfully when its channel closes without a `Failed` event.
#[derive(Debug)]
pub enum PullOutcome {
    Stream(mpsc::Receiver<PullEvent>),
    /// The pull could not even be started
    Failure(String),
}

#[derive(Debug)]
pub struct ImagePull {
    pub image: String,
    pub outcome: PullOutcome,
}

/// A locally stored image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Size", default)]
    pub size: u64,
}

/// A host directory visible inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// A single computation container to run to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    /// Without it the container runs with `--network none`
    pub network: bool,
    pub stdin: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ContainerOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container engine contract
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Version string of a working runtime
    async fn status(&self) -> Result<String>;

    /// Starts one pull per image; never fails as a whole
    async fn pull_images(&self, images: &[String]) -> Vec<ImagePull>;

    /// Removes dangling images
    async fn prune_images(&self) -> Result<()>;

    async fn remove_image(&self, image_id: &str) -> Result<()>;

    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Runs a container and waits for it to exit
    async fn run_container(&self, spec: ContainerSpec) -> Result<ContainerOutput>;

    /// Kills a running container by name
    async fn kill_container(&self, name: &str) -> Result<()>;
}

/// `ContainerRuntime` driving the podman CLI
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    bin: String,
}

impl PodmanRuntime {
    /// Creates a runtime calling the given CLI binary (`podman` by default)
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.bin);
        command.kill_on_drop(true);
        command
    }

    /// Runs a short podman command and returns its stdout
    async fn output(&self, args: &[&str]) -> Result<String> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute '{} {}'", self.bin, args.join(" ")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "'{} {}' failed: exit_code={}, stderr='{}'",
                self.bin,
                args.join(" "),
                exit_code,
                stderr.trim()
            );
        }

        Ok(stdout)
    }

    fn start_pull(&self, image: &str) -> PullOutcome {
        let mut child = match self
            .command()
            .arg("pull")
            .arg(image)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return PullOutcome::Failure(format!("Failed to execute podman pull: {}", e));
            }
        };

        let Some(stderr) = child.stderr.take() else {
            return PullOutcome::Failure("podman pull stderr not captured".to_string());
        };

        let (tx, rx) = mpsc::channel(64);
        let image = image.to_string();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last_line = String::new();

            while let Ok(Some(line)) = lines.next_line().await {
                debug!("podman pull {}: {}", image, line);
                last_line = line.clone();
                // Keep draining stderr even if nobody listens anymore
                let _ = tx.send(PullEvent::Progress(line)).await;
            }

            match child.wait().await {
                Ok(status) if status.success() => {
                    info!("Pulled image {}", image);
                }
                Ok(status) => {
                    let message = format!(
                        "exit_code={}, {}",
                        status.code().unwrap_or(-1),
                        last_line.trim()
                    );
                    error!("Failed to pull image {}: {}", image, message);
                    let _ = tx.send(PullEvent::Failed(message)).await;
                }
                Err(e) => {
                    let _ = tx.send(PullEvent::Failed(e.to_string())).await;
                }
            }
        });

        PullOutcome::Stream(rx)
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new("podman")
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn status(&self) -> Result<String> {
        let version = self
            .output(&["--version"])
            .await
            .context("Podman is not working correctly. Is podman installed?")?;
        let version = version.trim().to_string();
        info!("Podman is available: {}", version);
        Ok(version)
    }

    async fn pull_images(&self, images: &[String]) -> Vec<ImagePull> {
        images
            .iter()
            .map(|image| ImagePull {
                image: image.clone(),
                outcome: self.start_pull(image),
            })
            .collect()
    }

    async fn prune_images(&self) -> Result<()> {
        let stdout = self.output(&["image", "prune", "-f"]).await?;
        let pruned = stdout.lines().filter(|l| !l.trim().is_empty()).count();
        debug!("Pruned {} dangling image(s)", pruned);
        Ok(())
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        self.output(&["rmi", image_id]).await?;
        info!("Removed image {}", image_id);
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let stdout = self.output(&["images", "--format", "json"]).await?;
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&stdout).context("Failed to parse podman images output")
    }

    async fn run_container(&self, spec: ContainerSpec) -> Result<ContainerOutput> {
        let mut command = self.command();
        command
            .arg("run")
            .arg("--rm")
            .arg("-i")
            .arg("--name")
            .arg(&spec.name);

        if !spec.network {
            command.arg("--network").arg("none");
        }

        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.host.display(), mount.container);
            if mount.read_only {
                volume.push_str(":ro");
            }
            command.arg("-v").arg(volume);
        }

        command
            .arg(&spec.image)
            .args(&spec.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!("Starting container {} from image {}", spec.name, spec.image);
        let mut child = command
            .spawn()
            .context("Failed to execute podman run command")?;

        // Input is written concurrently with draining the output pipes
        let feeder = child.stdin.take().map(|mut stdin| {
            let input = spec.stdin.clone();
            tokio::spawn(async move {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
                Ok::<(), std::io::Error>(())
            })
        });

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for container")?;

        if let Some(feeder) = feeder {
            match feeder.await.context("Input writer task failed")? {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("Container {} closed its input early", spec.name);
                }
                Err(e) => return Err(e).context("Failed to write computation input"),
            }
        }

        let result = ContainerOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if !result.stderr.trim().is_empty() {
            debug!("container {} stderr: {}", spec.name, result.stderr.trim());
        }
        if result.success() {
            debug!(
                "Container {} exited cleanly, stdout_len={}",
                spec.name,
                result.stdout.len()
            );
        } else {
            warn!(
                "Container {} exited with code {}",
                spec.name, result.exit_code
            );
        }

        Ok(result)
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        self.output(&["kill", name]).await?;
        info!("Killed container {}", name);
        Ok(())
    }
}
