use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::CheckpointError;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryCheckpointStore;
pub use redis_store::RedisCheckpointStore;

/// Identifies one consumer group's positions on one destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointScope {
    pub consumer_group: String,
    pub destination: String,
}

impl CheckpointScope {
    pub fn new(consumer_group: &str, destination: &str) -> Self {
        Self {
            consumer_group: consumer_group.to_string(),
            destination: destination.to_string(),
        }
    }
}

/// Durable storage for consumer positions. A stored position is the
/// sequence of the next event to process on that partition.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn container_exists(&self) -> Result<bool, CheckpointError>;

    async fn create_container(&self) -> Result<(), CheckpointError>;

    async fn load_positions(
        &self,
        scope: &CheckpointScope,
    ) -> Result<HashMap<i32, i64>, CheckpointError>;

    /// Stores `position` unless a higher one is already stored, and returns
    /// the position stored after the call. Stored positions never go back.
    async fn commit(
        &self,
        scope: &CheckpointScope,
        partition: i32,
        position: i64,
    ) -> Result<i64, CheckpointError>;
}

pub async fn ensure_container(store: &dyn CheckpointStore) -> Result<(), CheckpointError> {
    if !store.container_exists().await? {
        info!("checkpoint container missing, creating it");
        store.create_container().await?;
    }
    Ok(())
}

/// Builds a store from a url: `memory://` or a redis connection string.
pub async fn connect_checkpoint_store(
    url: &str,
    container: &str,
) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryCheckpointStore::default()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let store = RedisCheckpointStore::new(url, container).await?;
        return Ok(Arc::new(store));
    }
    Err(CheckpointError::UnsupportedUrl(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_container_creates_once() {
        let store = MemoryCheckpointStore::default();
        assert!(!store.container_exists().await.unwrap());

        ensure_container(&store).await.unwrap();
        ensure_container(&store).await.unwrap();

        assert!(store.container_exists().await.unwrap());
        assert_eq!(store.containers_created(), 1);
    }

    #[tokio::test]
    async fn rejects_unknown_store_urls() {
        let result = connect_checkpoint_store("s3://bucket", "checkpoints").await;
        assert!(matches!(result, Err(CheckpointError::UnsupportedUrl(_))));

        assert!(connect_checkpoint_store("memory://", "checkpoints")
            .await
            .is_ok());
    }
}
