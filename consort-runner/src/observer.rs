//! Run observers
//!
//! The orchestrator reports everything a front-end needs through a
//! `RunObserver`. Callbacks for one run are invoked from that run's own task,
//! so per-run ordering is the emission order.

use consort_core::domain::run::Run;
use consort_core::dto::event::{ImageProgress, Notice, RunEvent, StateUpdate};
use tokio::sync::mpsc;
use tracing::debug;

/// Receiver of run lifecycle callbacks
pub trait RunObserver: Send + Sync {
    /// The run was persisted after a successful mapping
    fn on_saved(&self, _run: &Run) {}

    fn on_progress(&self, run_id: &str, progress: ImageProgress);

    fn on_state_update(&self, run_id: &str, update: StateUpdate);

    /// The run reached complete, error, stopped or suspended
    fn on_terminal(&self, run: &Run);

    fn on_notice(&self, _notice: Notice) {}
}

/// Forwards every callback as a `RunEvent` over a channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { tx }
    }

    /// Creates an observer together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: RunEvent) {
        if self.tx.send(event).is_err() {
            debug!("Run event dropped, receiver closed");
        }
    }
}

impl RunObserver for ChannelObserver {
    fn on_saved(&self, run: &Run) {
        self.send(RunEvent::Saved { run: run.clone() });
    }

    fn on_progress(&self, run_id: &str, progress: ImageProgress) {
        self.send(RunEvent::Progress {
            run_id: run_id.to_string(),
            progress,
        });
    }

    fn on_state_update(&self, run_id: &str, update: StateUpdate) {
        self.send(RunEvent::StateUpdate {
            run_id: run_id.to_string(),
            update,
        });
    }

    fn on_terminal(&self, run: &Run) {
        self.send(RunEvent::Terminal { run: run.clone() });
    }

    fn on_notice(&self, notice: Notice) {
        self.send(RunEvent::Notice { notice });
    }
}
