//! Consort Runner
//!
//! The client-side run controller for consortium pipelines.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Repositories: File-backed local stores (consortia, collections, run history)
//! - Podman: Container runtime used to pull images and run computations
//! - Services: Image acquisition, staging, provenance, outputs, assets, leases,
//!   mapping upkeep, run history and the run orchestrator
//! - Engine: Execution engine contract and the local podman-backed engine
//! - Control: The surface front-ends use to start, stop and suspend runs
//! - Session: Login/logout lifecycle owning the engine handle

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod observer;
pub mod podman;
pub mod repository;
pub mod service;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use control::RunController;
pub use error::RunError;
pub use observer::{ChannelObserver, RunObserver};
pub use session::{Session, SessionManager};
