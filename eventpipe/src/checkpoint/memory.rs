use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CheckpointScope, CheckpointStore};
use crate::error::CheckpointError;

/// Process-local store, used when no durable backend is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    container: AtomicBool,
    containers_created: AtomicU64,
    commits: AtomicU64,
    positions: DashMap<CheckpointScope, HashMap<i32, i64>>,
}

impl MemoryCheckpointStore {
    pub fn with_positions(scope: CheckpointScope, positions: HashMap<i32, i64>) -> Self {
        let store = Self::default();
        store.container.store(true, Ordering::SeqCst);
        store.positions.insert(scope, positions);
        store
    }

    pub fn containers_created(&self) -> u64 {
        self.containers_created.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn position(&self, scope: &CheckpointScope, partition: i32) -> Option<i64> {
        self.positions
            .get(scope)
            .and_then(|positions| positions.get(&partition).copied())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn container_exists(&self) -> Result<bool, CheckpointError> {
        Ok(self.container.load(Ordering::SeqCst))
    }

    async fn create_container(&self) -> Result<(), CheckpointError> {
        if !self.container.swap(true, Ordering::SeqCst) {
            self.containers_created.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn load_positions(
        &self,
        scope: &CheckpointScope,
    ) -> Result<HashMap<i32, i64>, CheckpointError> {
        Ok(self
            .positions
            .get(scope)
            .map(|positions| positions.clone())
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        scope: &CheckpointScope,
        partition: i32,
        position: i64,
    ) -> Result<i64, CheckpointError> {
        let mut positions = self.positions.entry(scope.clone()).or_default();
        let stored = positions.entry(partition).or_insert(position);
        *stored = (*stored).max(position);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(*stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn positions_are_scoped() {
        let store = MemoryCheckpointStore::default();
        let billing = CheckpointScope::new("billing", "orders");
        let audit = CheckpointScope::new("audit", "orders");

        assert_eq!(store.commit(&billing, 0, 11).await.unwrap(), 11);
        assert_eq!(store.commit(&billing, 0, 15).await.unwrap(), 15);
        assert_eq!(store.commit(&audit, 1, 3).await.unwrap(), 3);

        let positions = store.load_positions(&billing).await.unwrap();
        assert_eq!(positions, HashMap::from([(0, 15)]));
        assert_eq!(store.position(&audit, 1), Some(3));
        assert_eq!(store.commit_count(), 3);
        assert!(store
            .load_positions(&CheckpointScope::new("billing", "refunds"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn commits_never_lower_a_stored_position() {
        let store = MemoryCheckpointStore::default();
        let billing = CheckpointScope::new("billing", "orders");

        store.commit(&billing, 2, 1000).await.unwrap();
        assert_eq!(store.commit(&billing, 2, 7).await.unwrap(), 1000);
        assert_eq!(store.position(&billing, 2), Some(1000));
    }
}
