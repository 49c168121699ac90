use crate::domain::value_objects::{CollectionName, Document, EntityId, RecordPayload};
use crate::shared::AppError;
use async_trait::async_trait;

/// Write primitives of the authoritative store. Every call is all-or-nothing
/// and any error is treated as retryable by the caller.
#[async_trait]
pub trait RemoteMutator: Send + Sync {
    /// Returns the stored document, including the id assigned by the store.
    async fn create(
        &self,
        collection: &CollectionName,
        payload: RecordPayload,
    ) -> Result<Document, AppError>;

    async fn update(
        &self,
        collection: &CollectionName,
        id: &EntityId,
        payload: RecordPayload,
    ) -> Result<(), AppError>;

    async fn delete(&self, collection: &CollectionName, id: &EntityId) -> Result<(), AppError>;
}
