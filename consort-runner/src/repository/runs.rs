//! Run history repository

use anyhow::Result;
use async_trait::async_trait;
use consort_core::domain::run::Run;

use super::file_store::{FileStore, RUNS};

/// Repository trait for the local run history
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Run>>;

    /// Inserts or replaces a run
    async fn put(&self, run: &Run) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Run>>;
}

#[async_trait]
impl RunRepository for FileStore {
    async fn get(&self, id: &str) -> Result<Option<Run>> {
        self.read_record(RUNS, id).await
    }

    async fn put(&self, run: &Run) -> Result<()> {
        self.write_record(RUNS, &run.id, run).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.remove_record(RUNS, id).await
    }

    async fn list(&self) -> Result<Vec<Run>> {
        self.list_records(RUNS).await
    }
}
