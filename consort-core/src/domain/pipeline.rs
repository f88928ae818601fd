//! Pipeline domain types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Mapping type whose inputs are addressed by file group alone
pub const FREESURFER_TYPE: &str = "FreeSurfer";

/// A pipeline step as declared by the consortium owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub computations: Vec<Computation>,
    #[serde(default)]
    pub input_map: BTreeMap<String, InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<Value>,
}

impl PipelineStep {
    /// Images referenced by this step's computations, in declaration order
    pub fn images(&self) -> impl Iterator<Item = &str> {
        self.computations.iter().map(|c| c.docker_image.as_str())
    }
}

/// A containerized computation a step runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Computation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub docker_image: String,
    #[serde(default)]
    pub command: Vec<String>,
}

/// Declared input for one variable of a step
///
/// Unresolved specs carry `owner_mappings`; the mapping resolver replaces them
/// with a `value` holding the `[values, labels, types]` lanes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_mappings: Option<Vec<OwnerMapping>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InputSpec {
    /// Creates a resolved spec holding only a value
    pub fn resolved(value: Value) -> Self {
        Self {
            value: Some(value),
            ..Default::default()
        }
    }
}

/// One declared source for a step variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerMapping {
    pub source: MappingSource,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mapping_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OwnerMapping {
    /// True for mappings pre-resolved by group id (FreeSurfer inputs)
    pub fn is_freesurfer(&self) -> bool {
        self.mapping_type.as_deref() == Some(FREESURFER_TYPE)
    }
}

/// Where an owner mapping's data comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    File,
    Owner,
    Literal,
}

/// Frozen, run-specific copy of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

impl PipelineSnapshot {
    /// Deduplicated computation images across all steps, first occurrence first
    pub fn images(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.steps
            .iter()
            .flat_map(|step| step.images())
            .filter(|image| seen.insert(*image))
            .map(str::to_string)
            .collect()
    }
}
