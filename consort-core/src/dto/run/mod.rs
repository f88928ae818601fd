//! Run DTOs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::consortium::{Consortium, StepIo};
use crate::domain::run::Run;
use crate::mapping::FilesByGroup;

/// Local data gathered for a consortium ahead of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMappings {
    #[serde(rename = "stepIO", default)]
    pub step_io: StepIo,
    #[serde(default)]
    pub files_by_group: FilesByGroup,
    /// Every file of every referenced group; these get staged
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

/// Request to drive a run end to end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRun {
    pub consortium: Consortium,
    pub run: Run,
    pub data_mappings: DataMappings,
    /// Lets computation containers reach the network
    #[serde(default)]
    pub network_volume: bool,
}

/// A run record change pushed by the remote side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRunChange {
    pub run: Run,
    /// The remote side deleted the run
    #[serde(default)]
    pub delete: bool,
}
