//! Mapping upkeep
//!
//! Keeps consortia, their recorded mapping choices and the collections those
//! choices point into consistent with each other, and gathers the local data
//! a run needs before it starts.

use anyhow::{Context, Result, anyhow};
use consort_core::domain::collection::Collection;
use consort_core::domain::consortium::{Consortium, StepIo};
use consort_core::domain::pipeline::PipelineStep;
use consort_core::dto::run::DataMappings;
use consort_core::mapping::{FilesByGroup, Resolution};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::repository::{CollectionRepository, ConsortiumRepository};

pub struct MappingService {
    consortia: Arc<dyn ConsortiumRepository>,
    collections: Arc<dyn CollectionRepository>,
}

impl MappingService {
    pub fn new(
        consortia: Arc<dyn ConsortiumRepository>,
        collections: Arc<dyn CollectionRepository>,
    ) -> Self {
        Self {
            consortia,
            collections,
        }
    }

    async fn consortium(&self, consortium_id: &str) -> Result<Consortium> {
        self.consortia.get(consortium_id).await?.ok_or_else(|| {
            anyhow!(
                "No associated consortia in local db. Please visit Collections and map variables for {}.",
                consortium_id
            )
        })
    }

    /// Gathers the files and group data a run of this consortium needs
    pub async fn collection_files(&self, consortium_id: &str) -> Result<DataMappings> {
        let consortium = self.consortium(consortium_id).await?;
        let resolution = self.validate(consortium).await?;
        let consortium = self.consortium(consortium_id).await?;

        let mut files = Vec::new();
        let mut files_by_group = FilesByGroup::new();
        for collection_id in resolution.collection_ids() {
            let Some(collection) = self.collections.get(&collection_id).await? else {
                warn!(
                    "Collection {} mapped by {} is missing locally",
                    collection_id, consortium.name
                );
                continue;
            };
            for group in collection.file_groups.values() {
                files.extend(group.files.iter().cloned());
                files_by_group.insert(group.id.clone(), group.backing_data());
            }
        }

        // Surfaces groups that disappeared since the mapping was recorded
        consortium.resolve(Some(&files_by_group))?;

        debug!(
            "Gathered {} files in {} groups for {}",
            files.len(),
            files_by_group.len(),
            consortium.name
        );
        Ok(DataMappings {
            step_io: consortium.step_io,
            files_by_group,
            files,
        })
    }

    /// Runs the completeness check and records its outcome on the consortium
    pub async fn check_mapping(&self, consortium_id: &str) -> Result<Resolution> {
        let consortium = self.consortium(consortium_id).await?;
        self.validate(consortium).await
    }

    async fn validate(&self, mut consortium: Consortium) -> Result<Resolution> {
        let checked = consortium.resolve(None);
        let is_mapped = checked.is_ok();
        if consortium.is_mapped != is_mapped {
            consortium.is_mapped = is_mapped;
            self.consortia
                .put(&consortium)
                .await
                .with_context(|| format!("Failed to update consortium {}", consortium.id))?;
        }
        Ok(checked?)
    }

    /// Records the user's mapping choices and links the collections they use
    pub async fn save_mapping(&self, consortium_id: &str, step_io: StepIo) -> Result<Resolution> {
        let mut consortium = self.consortium(consortium_id).await?;
        let previous = consortium.referenced_collection_ids();
        consortium.step_io = step_io;
        let current = consortium.referenced_collection_ids();
        self.consortia.put(&consortium).await?;

        for collection_id in &current {
            self.update_collection(collection_id, |c| {
                c.attach_consortium(consortium_id);
                true
            })
            .await?;
        }
        for collection_id in previous.iter().filter(|id| !current.contains(id)) {
            self.update_collection(collection_id, |c| c.detach_consortium(consortium_id))
                .await?;
        }

        self.check_mapping(consortium_id).await
    }

    /// Detaches a consortium from its collections; deletes it or resets its mapping
    pub async fn unmap(&self, consortium_id: &str, delete: bool) -> Result<()> {
        let Some(mut consortium) = self.consortia.get(consortium_id).await? else {
            debug!("Consortium {} not stored locally, nothing to unmap", consortium_id);
            return Ok(());
        };

        for collection_id in consortium.referenced_collection_ids() {
            self.update_collection(&collection_id, |c| c.detach_consortium(consortium_id))
                .await?;
        }

        if delete {
            self.consortia.delete(consortium_id).await?;
            info!("Removed consortium {}", consortium.name);
        } else {
            consortium.reset_mapping();
            self.consortia.put(&consortium).await?;
            info!("Cleared mapping of consortium {}", consortium.name);
        }
        Ok(())
    }

    /// Deletes a collection and every mapping choice pointing into it
    pub async fn delete_collection(&self, collection_id: &str) -> Result<()> {
        self.collections.delete(collection_id).await?;

        for mut consortium in self.consortia.list().await? {
            if consortium.scrub_collection(collection_id) {
                self.consortia.put(&consortium).await?;
                info!(
                    "Consortium {} lost mappings to collection {}",
                    consortium.name, collection_id
                );
            }
        }
        Ok(())
    }

    /// Applies a consortium change made on the remote side
    ///
    /// A new active pipeline invalidates the recorded mapping.
    pub async fn sync_remote_consortium(&self, remote: Consortium) -> Result<()> {
        let Some(local) = self.consortia.get(&remote.id).await? else {
            self.consortia.put(&remote).await?;
            return Ok(());
        };

        if local.active_pipeline_id == remote.active_pipeline_id {
            let mut updated = local;
            updated.name = remote.name;
            updated.active_pipeline_name = remote.active_pipeline_name;
            return self.consortia.put(&updated).await;
        }

        info!(
            "Active pipeline of {} changed, mapping has to be redone",
            remote.name
        );
        self.unmap(&remote.id, false).await?;
        let mut updated = self.consortium(&remote.id).await?;
        updated.name = remote.name;
        updated.active_pipeline_id = remote.active_pipeline_id;
        updated.active_pipeline_name = remote.active_pipeline_name;
        updated.pipeline_steps = remote.pipeline_steps;
        self.consortia.put(&updated).await?;
        self.recheck(&remote.id).await
    }

    /// Applies a pipeline change to every consortium running it
    pub async fn sync_remote_pipeline(&self, pipeline_id: &str, steps: Vec<PipelineStep>) -> Result<()> {
        for consortium in self.consortia.list().await? {
            if consortium.active_pipeline_id.as_deref() != Some(pipeline_id)
                || consortium.pipeline_steps == steps
            {
                continue;
            }

            info!(
                "Pipeline {} of {} changed, mapping has to be redone",
                pipeline_id, consortium.name
            );
            self.unmap(&consortium.id, false).await?;
            let mut updated = self.consortium(&consortium.id).await?;
            updated.active_pipeline_id = Some(pipeline_id.to_string());
            updated.pipeline_steps = steps.clone();
            self.consortia.put(&updated).await?;
            self.recheck(&consortium.id).await?;
        }
        Ok(())
    }

    /// A failed check is expected right after an unmap; only store errors propagate
    async fn recheck(&self, consortium_id: &str) -> Result<()> {
        let consortium = self.consortium(consortium_id).await?;
        let is_mapped = consortium.resolve(None).is_ok();
        if consortium.is_mapped != is_mapped {
            let mut updated = consortium;
            updated.is_mapped = is_mapped;
            self.consortia.put(&updated).await?;
        }
        Ok(())
    }

    async fn update_collection(
        &self,
        collection_id: &str,
        change: impl FnOnce(&mut Collection) -> bool,
    ) -> Result<()> {
        let Some(mut collection) = self.collections.get(collection_id).await? else {
            warn!("Collection {} not found locally", collection_id);
            return Ok(());
        };
        if change(&mut collection) {
            self.collections.put(&collection).await?;
        }
        Ok(())
    }
}
