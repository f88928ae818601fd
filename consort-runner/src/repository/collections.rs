//! Collections repository

use anyhow::Result;
use async_trait::async_trait;
use consort_core::domain::collection::Collection;

use super::file_store::{COLLECTIONS, FileStore};

/// Repository trait for the user's local file collections
#[async_trait]
pub trait CollectionRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Collection>>;

    /// Inserts or replaces a collection
    async fn put(&self, collection: &Collection) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Collection>>;
}

#[async_trait]
impl CollectionRepository for FileStore {
    async fn get(&self, id: &str) -> Result<Option<Collection>> {
        self.read_record(COLLECTIONS, id).await
    }

    async fn put(&self, collection: &Collection) -> Result<()> {
        self.write_record(COLLECTIONS, &collection.id, collection).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.remove_record(COLLECTIONS, id).await
    }

    async fn list(&self) -> Result<Vec<Collection>> {
        self.list_records(COLLECTIONS).await
    }
}
