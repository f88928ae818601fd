//! Image acquisition fan-in
//!
//! Pulls every computation image of a pipeline concurrently and joins the
//! pulls into one outcome. Each pull is driven by its own task that reports
//! progress straight to the sink, so a pull that is still running when the
//! join has already failed keeps reporting until it ends.

use consort_core::dto::event::ImageProgress;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::RunError;
use crate::podman::{ContainerRuntime, ImagePull, PullEvent, PullOutcome};

/// Where pull progress goes
pub type ProgressSink = Arc<dyn Fn(ImageProgress) + Send + Sync>;

#[derive(Clone)]
pub struct ImageAcquisition {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageAcquisition {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Pulls `images`, resolving once every pull ended
    ///
    /// Fails with the first pull that fails; the others are left running.
    pub async fn acquire(&self, images: &[String], sink: ProgressSink) -> Result<(), RunError> {
        let images = dedup(images);
        if images.is_empty() {
            return Ok(());
        }

        info!("Pulling {} image(s): {}", images.len(), images.join(", "));
        let pulls = self.runtime.pull_images(&images).await;

        let mut tasks = JoinSet::new();
        for pull in pulls {
            tasks.spawn(drive_pull(pull, Arc::clone(&sink)));
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(RunError::ImageAcquisition {
                    image: "unknown".to_string(),
                    message: format!("pull task failed: {}", e),
                })
            });

            if let Err(err) = outcome {
                warn!("{}", err);
                tasks.detach_all();
                return Err(err);
            }
        }

        info!("All images available");
        Ok(())
    }
}

async fn drive_pull(pull: ImagePull, sink: ProgressSink) -> Result<(), RunError> {
    let ImagePull { image, outcome } = pull;

    let mut stream = match outcome {
        PullOutcome::Stream(stream) => stream,
        PullOutcome::Failure(message) => {
            sink(ImageProgress::failed(&image, &message));
            return Err(RunError::ImageAcquisition { image, message });
        }
    };

    while let Some(event) = stream.recv().await {
        match event {
            PullEvent::Progress(detail) => sink(ImageProgress::downloading(&image, detail)),
            PullEvent::Failed(message) => {
                sink(ImageProgress::failed(&image, &message));
                return Err(RunError::ImageAcquisition { image, message });
            }
        }
    }

    debug!("Pull of {} ended", image);
    sink(ImageProgress::complete(&image));
    Ok(())
}

/// Removes repeated images, first occurrence first
fn dedup(images: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(images.len());
    for image in images {
        if !unique.contains(image) {
            unique.push(image.clone());
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePull, FakeRuntime, eventually};
    use consort_core::dto::event::PullStatus;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn recorder() -> (Arc<Mutex<Vec<ImageProgress>>>, ProgressSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |p| sink_seen.lock().unwrap().push(p));
        (seen, sink)
    }

    #[tokio::test]
    async fn test_all_pulls_end() {
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_pull("img-a", FakePull::Succeed(vec!["Copying blob 1".to_string()]))
                .with_pull("img-b", FakePull::Succeed(vec![])),
        );
        let acquisition = ImageAcquisition::new(runtime.clone());
        let (seen, sink) = recorder();

        let images = vec!["img-a".to_string(), "img-b".to_string(), "img-a".to_string()];
        acquisition.acquire(&images, sink).await.unwrap();

        assert_eq!(*runtime.pulled.lock().unwrap(), vec!["img-a", "img-b"]);
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&ImageProgress::downloading("img-a", "Copying blob 1")));
        assert!(seen.contains(&ImageProgress::complete("img-a")));
        assert!(seen.contains(&ImageProgress::complete("img-b")));
    }

    #[tokio::test]
    async fn test_failing_pull_rejects_while_other_keeps_reporting() {
        let (tx_a, rx_a) = mpsc::channel(4);
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_pull("img-a", FakePull::Hold(rx_a))
                .with_pull("img-b", FakePull::Fail("manifest unknown".to_string())),
        );
        let acquisition = ImageAcquisition::new(runtime);
        let (seen, sink) = recorder();

        let err = acquisition
            .acquire(&["img-a".to_string(), "img-b".to_string()], sink)
            .await
            .unwrap_err();

        match err {
            RunError::ImageAcquisition { image, message } => {
                assert_eq!(image, "img-b");
                assert_eq!(message, "manifest unknown");
            }
            other => panic!("unexpected error: {other}"),
        }

        // img-a finishes after the join already failed
        tx_a.send(PullEvent::Progress("Writing manifest".to_string()))
            .await
            .unwrap();
        drop(tx_a);

        assert!(
            eventually(|| seen
                .lock()
                .unwrap()
                .contains(&ImageProgress::complete("img-a")))
            .await
        );
    }

    #[tokio::test]
    async fn test_immediate_failure_is_a_rejected_pull() {
        let runtime = Arc::new(
            FakeRuntime::new().with_pull("img-a", FakePull::Immediate("no such host".to_string())),
        );
        let acquisition = ImageAcquisition::new(runtime);
        let (seen, sink) = recorder();

        let err = acquisition
            .acquire(&["img-a".to_string()], sink)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::ImageAcquisition { .. }));
        assert!(matches!(
            seen.lock().unwrap()[0].status,
            PullStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_no_images_is_immediate_success() {
        let runtime = Arc::new(FakeRuntime::new());
        let acquisition = ImageAcquisition::new(runtime.clone());
        let (_, sink) = recorder();

        acquisition.acquire(&[], sink).await.unwrap();
        assert!(runtime.pulled.lock().unwrap().is_empty());
    }
}
