//! Watermarks next to the dataset in the object store

use super::{StateDocument, StateManager, StateResult, Watermarks};
use crate::storage::store::{self, RetryingStore};
use ::object_store::PutPayload;
use async_trait::async_trait;

/// Keeps `datasets/{dataset_id}/state/watermarks.json`
#[derive(Debug, Clone)]
pub struct ObjectStoreStateManager {
    store: RetryingStore,
}

impl ObjectStoreStateManager {
    pub fn new(store: RetryingStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StateManager for ObjectStoreStateManager {
    fn name(&self) -> &'static str {
        "object_store"
    }

    async fn load(&self, dataset_id: &str) -> StateResult<Watermarks> {
        match self.store.get_bytes(&store::state_path(dataset_id)).await? {
            Some(bytes) => StateDocument::decode(&bytes),
            None => Ok(Watermarks::new()),
        }
    }

    async fn save(&self, dataset_id: &str, watermarks: &Watermarks) -> StateResult<()> {
        let path = store::state_path(dataset_id);
        let body = StateDocument::encode(dataset_id, watermarks)?;
        self.store.put(&path, PutPayload::from(body)).await?;

        tracing::debug!(dataset_id, series = watermarks.len(), path = %path, "Saved state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use crate::storage::RetryPolicy;
    use ::object_store::memory::InMemory;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_roundtrip() {
        let manager = ObjectStoreStateManager::new(RetryingStore::new(
            Arc::new(InMemory::new()),
            RetryPolicy::none(),
        ));
        contract::roundtrip(&manager).await;

        assert!(manager
            .store
            .exists(&store::state_path("d1"))
            .await
            .unwrap());
    }
}
