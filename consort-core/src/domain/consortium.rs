//! Consortium domain types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::domain::pipeline::{PipelineSnapshot, PipelineStep};
use crate::mapping::{self, FilesByGroup, MappingError, Resolution};

/// Per-step record of the user's mapping choices
///
/// Positional: `step_io[step_index][key][mapping_index]`. Holes are `None`.
pub type StepIo = Vec<BTreeMap<String, Vec<Option<StepIoEntry>>>>;

/// A consortium the local user has joined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consortium {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active_pipeline_id: Option<String>,
    #[serde(default)]
    pub active_pipeline_name: Option<String>,
    #[serde(default)]
    pub pipeline_steps: Vec<PipelineStep>,
    #[serde(rename = "stepIO", default)]
    pub step_io: StepIo,
    #[serde(default)]
    pub is_mapped: bool,
}

/// The collection, group and column chosen for one owner mapping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepIoEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Consortium {
    /// Creates an unmapped consortium with no pipeline
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            active_pipeline_id: None,
            active_pipeline_name: None,
            pipeline_steps: Vec::new(),
            step_io: Vec::new(),
            is_mapped: false,
        }
    }

    /// Frozen copy of the active pipeline, named after the pipeline itself
    pub fn active_pipeline(&self) -> Option<PipelineSnapshot> {
        let id = self.active_pipeline_id.clone()?;
        Some(PipelineSnapshot {
            name: self.active_pipeline_name.clone().unwrap_or_else(|| id.clone()),
            id,
            steps: self.pipeline_steps.clone(),
        })
    }

    /// Looks up the recorded choice for one owner mapping
    pub fn step_io_entry(&self, step: usize, key: &str, mapping: usize) -> Option<&StepIoEntry> {
        lookup(&self.step_io, step, key, mapping)
    }

    /// Resolves this consortium's active pipeline against its recorded mappings
    ///
    /// With `files_by_group` set, this materializes the inputs; without it,
    /// only completeness is checked.
    pub fn resolve(&self, files_by_group: Option<&FilesByGroup>) -> Result<Resolution, MappingError> {
        mapping::resolve(&self.name, &self.pipeline_steps, &self.step_io, files_by_group)
    }

    /// Every collection id referenced anywhere in `step_io`, duplicates removed
    pub fn referenced_collection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for entry in self.step_io.iter().flat_map(|step| step.values()).flatten().flatten() {
            if let Some(id) = &entry.collection_id {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }

    /// Drops every mapping entry that points at `collection_id`
    ///
    /// Returns true when anything was removed; `is_mapped` is cleared in that case.
    pub fn scrub_collection(&mut self, collection_id: &str) -> bool {
        let mut removed = false;
        for slot in self
            .step_io
            .iter_mut()
            .flat_map(|step| step.values_mut())
            .flat_map(|entries| entries.iter_mut())
        {
            if slot
                .as_ref()
                .is_some_and(|entry| entry.collection_id.as_deref() == Some(collection_id))
            {
                *slot = None;
                removed = true;
            }
        }
        if removed {
            self.is_mapped = false;
        }
        removed
    }

    /// Forgets the active pipeline and every mapping choice
    pub fn reset_mapping(&mut self) {
        self.active_pipeline_id = None;
        self.active_pipeline_name = None;
        self.is_mapped = false;
        self.step_io.clear();
    }
}

pub(crate) fn lookup<'a>(
    step_io: &'a StepIo,
    step: usize,
    key: &str,
    mapping: usize,
) -> Option<&'a StepIoEntry> {
    step_io.get(step)?.get(key)?.get(mapping)?.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapped_consortium() -> Consortium {
        serde_json::from_value(json!({
            "id": "cons-1",
            "name": "Brain Study",
            "stepIO": [{
                "covariates": [
                    { "groupId": "g1", "collectionId": "c1", "column": "age" },
                    null,
                    { "groupId": "g2", "collectionId": "c2", "column": "isControl" }
                ],
                "data": [{ "groupId": "g1", "collectionId": "c1" }]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_step_io_entry_handles_holes() {
        let consortium = mapped_consortium();

        assert!(consortium.step_io_entry(0, "covariates", 0).is_some());
        assert!(consortium.step_io_entry(0, "covariates", 1).is_none());
        assert!(consortium.step_io_entry(0, "missing", 0).is_none());
        assert!(consortium.step_io_entry(3, "covariates", 0).is_none());
    }

    #[test]
    fn test_referenced_collection_ids() {
        let consortium = mapped_consortium();
        assert_eq!(consortium.referenced_collection_ids(), vec!["c1", "c2"]);
    }

    #[test]
    fn test_scrub_collection() {
        let mut consortium = mapped_consortium();
        consortium.is_mapped = true;

        assert!(consortium.scrub_collection("c1"));
        assert!(!consortium.is_mapped);
        assert_eq!(consortium.referenced_collection_ids(), vec!["c2"]);
        assert!(!consortium.scrub_collection("c1"));
    }

    #[test]
    fn test_reset_mapping() {
        let mut consortium = mapped_consortium();
        consortium.active_pipeline_id = Some("p1".to_string());
        consortium.is_mapped = true;

        consortium.reset_mapping();

        assert!(consortium.active_pipeline_id.is_none());
        assert!(consortium.active_pipeline_name.is_none());
        assert!(!consortium.is_mapped);
        assert!(consortium.step_io.is_empty());
    }

    #[test]
    fn test_active_pipeline_uses_pipeline_name() {
        let mut consortium = Consortium::new("cons-1", "Brain Study");
        assert!(consortium.active_pipeline().is_none());

        consortium.active_pipeline_id = Some("pipe-1".to_string());
        assert_eq!(consortium.active_pipeline().unwrap().name, "pipe-1");

        consortium.active_pipeline_name = Some("Ridge Regression".to_string());
        let snapshot = consortium.active_pipeline().unwrap();
        assert_eq!(snapshot.id, "pipe-1");
        assert_eq!(snapshot.name, "Ridge Regression");
    }
}
