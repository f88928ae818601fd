//! Service layer
//!
//! Services contain the business logic of the run controller. They drive
//! the container runtime, the execution engine and the local stores, and
//! report back through a `RunObserver`.

mod assets;
mod history;
mod images;
mod lease;
mod mapping;
mod orchestrator;
mod outputs;
mod provenance;
mod staging;

pub use assets::AssetDownloader;
pub use history::RunHistory;
pub use images::{ImageAcquisition, ProgressSink};
pub use lease::{RunLease, RunLeases};
pub use mapping::MappingService;
pub use orchestrator::{DOWNLOADING_IMAGES, OrchestratorParts, RunOrchestrator};
pub use outputs::{ConsortiumRuns, OutputMirror, RunFolder};
pub use provenance::ProvenanceWriter;
pub use staging::StagingArea;
