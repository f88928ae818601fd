//! Mapping resolution
//!
//! Turns a pipeline's declared step inputs plus a user's recorded
//! (collection, group, column) choices into concrete per-step input lanes.
//!
//! Resolution runs in two modes:
//! - validation (`files_by_group = None`): checks completeness and lists the
//!   collections the consortium depends on without touching file contents
//! - materializing (`files_by_group = Some(..)`): additionally fills the
//!   `[values, labels, types]` lanes handed to the execution engine

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::consortium::{StepIo, StepIoEntry, lookup};
use crate::domain::pipeline::{FREESURFER_TYPE, InputSpec, MappingSource, PipelineStep};

/// Backing data per file group id (file paths or meta file rows)
pub type FilesByGroup = BTreeMap<String, Value>;

/// A (group, collection) pair a consortium's mapping depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRef {
    pub group_id: String,
    pub collection_id: String,
}

/// Successful resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Steps with every owner-mapped input replaced by its resolved lanes
    pub steps: Vec<PipelineStep>,
    /// Referenced groups, first occurrence first, without duplicates
    pub collections_used: Vec<CollectionRef>,
}

impl Resolution {
    /// Distinct collection ids referenced by the mapping
    pub fn collection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for used in &self.collections_used {
            if !ids.contains(&used.collection_id) {
                ids.push(used.collection_id.clone());
            }
        }
        ids
    }
}

/// Resolution failures; both name the consortium
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error(
        "Mapping incomplete for new run from {consortium}. Please complete variable mapping before continuing."
    )]
    Incomplete {
        consortium: String,
        step: usize,
        key: String,
    },

    #[error(
        "File group {group_id} mapped for {consortium} is no longer available. Please complete variable mapping before continuing."
    )]
    MissingGroup { consortium: String, group_id: String },
}

#[derive(Default)]
struct Lanes {
    values: Vec<Value>,
    labels: Vec<Value>,
    types: Vec<Value>,
}

impl Lanes {
    fn into_value(self) -> Value {
        json!([self.values, self.labels, self.types])
    }
}

/// Resolves `steps` against `step_io`
///
/// Steps are visited in declared order and the first incomplete mapping
/// aborts the whole resolution; no partial step list is ever returned.
pub fn resolve(
    consortium_name: &str,
    steps: &[PipelineStep],
    step_io: &StepIo,
    files_by_group: Option<&FilesByGroup>,
) -> Result<Resolution, MappingError> {
    let mut resolved_steps = Vec::with_capacity(steps.len());
    let mut collections_used: Vec<CollectionRef> = Vec::new();

    for (step_index, step) in steps.iter().enumerate() {
        let mut input_map = step.input_map.clone();

        for (key, spec) in &step.input_map {
            let Some(mappings) = &spec.owner_mappings else {
                continue;
            };

            let incomplete = || MappingError::Incomplete {
                consortium: consortium_name.to_string(),
                step: step_index,
                key: key.clone(),
            };

            let mut lanes = Lanes::default();

            for (mapping_index, mapping) in mappings.iter().enumerate() {
                let entry = lookup(step_io, step_index, key, mapping_index);

                if mapping.is_freesurfer() {
                    if let Some((group_id, collection_id)) = complete_entry(entry) {
                        record_used(&mut collections_used, group_id, collection_id);
                    }
                    if let Some(files) = files_by_group {
                        let group_id = entry
                            .and_then(|e| e.group_id.as_deref())
                            .ok_or_else(incomplete)?;
                        lanes
                            .values
                            .push(group_data(consortium_name, files, group_id)?);
                        lanes
                            .labels
                            .push(mapping.value.clone().unwrap_or(Value::Null));
                        lanes.types.push(json!(FREESURFER_TYPE));
                    }
                    continue;
                }

                if mapping.source != MappingSource::File {
                    continue;
                }

                let (group_id, collection_id) =
                    complete_entry(entry).ok_or_else(incomplete)?;

                record_used(&mut collections_used, group_id, collection_id);

                if let Some(files) = files_by_group {
                    lanes
                        .values
                        .push(group_data(consortium_name, files, group_id)?);
                    lanes.labels.push(
                        entry
                            .and_then(|e| e.column.clone())
                            .map(Value::String)
                            .unwrap_or(Value::Null),
                    );
                    if let Some(mapping_type) = &mapping.mapping_type {
                        lanes.types.push(Value::String(mapping_type.clone()));
                    }
                }
            }

            input_map.insert(key.clone(), InputSpec::resolved(lanes.into_value()));
        }

        resolved_steps.push(PipelineStep {
            input_map,
            ..step.clone()
        });
    }

    Ok(Resolution {
        steps: resolved_steps,
        collections_used,
    })
}

/// A file mapping entry is usable once it names both a group and a collection
fn complete_entry(entry: Option<&StepIoEntry>) -> Option<(&str, &str)> {
    let entry = entry?;
    Some((entry.group_id.as_deref()?, entry.collection_id.as_deref()?))
}

fn record_used(used: &mut Vec<CollectionRef>, group_id: &str, collection_id: &str) {
    let entry = CollectionRef {
        group_id: group_id.to_string(),
        collection_id: collection_id.to_string(),
    };
    if !used.contains(&entry) {
        used.push(entry);
    }
}

fn group_data(
    consortium_name: &str,
    files_by_group: &FilesByGroup,
    group_id: &str,
) -> Result<Value, MappingError> {
    files_by_group
        .get(group_id)
        .cloned()
        .ok_or_else(|| MappingError::MissingGroup {
            consortium: consortium_name.to_string(),
            group_id: group_id.to_string(),
        })
}
