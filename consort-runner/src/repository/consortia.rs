//! Consortia repository

use anyhow::Result;
use async_trait::async_trait;
use consort_core::domain::consortium::Consortium;

use super::file_store::{CONSORTIA, FileStore};

/// Repository trait for the consortia the user joined
#[async_trait]
pub trait ConsortiumRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Consortium>>;

    /// Inserts or replaces a consortium
    async fn put(&self, consortium: &Consortium) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Consortium>>;
}

#[async_trait]
impl ConsortiumRepository for FileStore {
    async fn get(&self, id: &str) -> Result<Option<Consortium>> {
        self.read_record(CONSORTIA, id).await
    }

    async fn put(&self, consortium: &Consortium) -> Result<()> {
        self.write_record(CONSORTIA, &consortium.id, consortium).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.remove_record(CONSORTIA, id).await
    }

    async fn list(&self) -> Result<Vec<Consortium>> {
        self.list_records(CONSORTIA).await
    }
}
