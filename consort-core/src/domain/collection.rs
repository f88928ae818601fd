//! Collection domain types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A user-curated set of local file groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_groups: BTreeMap<String, FileGroup>,
    /// Consortia whose mappings point into this collection (back-references)
    #[serde(default)]
    pub associated_consortia: Vec<String>,
}

/// A group of files, optionally described by a CSV meta file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Parsed meta file rows, header first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_file: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub first_row: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<i64>,
}

impl FileGroup {
    /// The data handed to computations for this group: meta file rows when present, else file paths
    pub fn backing_data(&self) -> Value {
        match &self.meta_file {
            Some(rows) => serde_json::json!(rows),
            None => serde_json::json!(self.files),
        }
    }
}

impl Collection {
    /// Removes a consortium back-reference, returning whether it was present
    pub fn detach_consortium(&mut self, consortium_id: &str) -> bool {
        let before = self.associated_consortia.len();
        self.associated_consortia.retain(|id| id != consortium_id);
        before != self.associated_consortia.len()
    }

    /// Records a consortium back-reference once
    pub fn attach_consortium(&mut self, consortium_id: &str) {
        if !self.associated_consortia.iter().any(|id| id == consortium_id) {
            self.associated_consortia.push(consortium_id.to_string());
        }
    }
}
