//! Conditional-write lock backend
//!
//! Leases live at `locks/{key}.json` in the dataset's object store. A new
//! lease is written with `PutMode::Create`; an expired one is replaced with
//! `PutMode::Update` against the e-tag that was read, so of several
//! contenders for the same expired lease only one write succeeds. This is the
//! same compare-and-swap contract a DynamoDB conditional item write gives.
//!
//! Release never deletes: it overwrites the lease with an already-expired
//! copy, conditional on the e-tag it read, so a release racing a takeover
//! cannot remove the new holder's lease.

use super::{LockLease, LockManager, LockResult};
use crate::storage::RetryingStore;
use ::object_store::path::Path as ObjectPath;
use ::object_store::{PutMode, PutPayload, UpdateVersion};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Lock backend on an object store with conditional puts
#[derive(Debug, Clone)]
pub struct ObjectStoreLockManager {
    store: RetryingStore,
}

impl ObjectStoreLockManager {
    pub fn new(store: RetryingStore) -> Self {
        Self { store }
    }

    pub fn lease_path(key: &str) -> ObjectPath {
        ObjectPath::from("locks").child(format!("{}.json", key))
    }

    async fn read(&self, path: &ObjectPath) -> LockResult<Option<(LockLease, UpdateVersion)>> {
        match self.store.get_versioned(path).await? {
            Some((bytes, version)) => Ok(Some((serde_json::from_slice(&bytes)?, version))),
            None => Ok(None),
        }
    }

    /// Expire `current` in place, provided the object is still at `version`.
    /// False when the lease was replaced since it was read.
    async fn retire(
        &self,
        path: &ObjectPath,
        current: LockLease,
        version: UpdateVersion,
    ) -> LockResult<bool> {
        let tombstone = LockLease {
            expires_at: Utc::now().min(current.expires_at),
            ..current
        };
        let body = PutPayload::from(serde_json::to_vec(&tombstone)?);
        match self.store.put_mode(path, body, PutMode::Update(version)).await {
            Ok(_) => Ok(true),
            Err(::object_store::Error::Precondition { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LockManager for ObjectStoreLockManager {
    fn name(&self) -> &'static str {
        "object_store"
    }

    async fn acquire(&self, key: &str, ttl: Duration) -> LockResult<LockLease> {
        let path = Self::lease_path(key);
        let lease = LockLease::new(key, ttl)?;
        let body = PutPayload::from(serde_json::to_vec(&lease)?);

        let mut last_seen = None;
        for _ in 0..3 {
            match self
                .store
                .put_mode(&path, body.clone(), PutMode::Create)
                .await
            {
                Ok(_) => {
                    tracing::debug!(key, owner = %lease.owner_id, "Acquired lock");
                    return Ok(lease);
                }
                Err(::object_store::Error::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            let Some((current, version)) = self.read(&path).await? else {
                // Released between our create and read
                continue;
            };

            // A retried create that actually landed the first time
            if current.same_lease(&lease) {
                return Ok(lease);
            }
            if !current.is_expired() {
                return Err(current.held_error());
            }

            match self
                .store
                .put_mode(&path, body.clone(), PutMode::Update(version))
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        key,
                        owner = %lease.owner_id,
                        previous_owner = %current.owner_id,
                        "Took over expired lock"
                    );
                    return Ok(lease);
                }
                Err(::object_store::Error::Precondition { .. }) => {
                    // Someone else replaced it first
                    last_seen = Some(current);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.read(&path).await? {
            Some((current, _)) if !current.is_expired() => Err(current.held_error()),
            _ => Err(last_seen.unwrap_or(lease).held_error()),
        }
    }

    async fn release(&self, lease: &LockLease) -> LockResult<()> {
        let path = Self::lease_path(&lease.key);
        match self.read(&path).await? {
            Some((current, version)) if current.same_lease(lease) && !current.is_expired() => {
                if self.retire(&path, current, version).await? {
                    tracing::debug!(key = %lease.key, owner = %lease.owner_id, "Released lock");
                    return Ok(());
                }
            }
            _ => {}
        }
        tracing::debug!(key = %lease.key, owner = %lease.owner_id, "Lease no longer held, nothing to release");
        Ok(())
    }

    async fn is_held(&self, key: &str) -> LockResult<bool> {
        Ok(self
            .read(&Self::lease_path(key))
            .await?
            .is_some_and(|(lease, _)| !lease.is_expired()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use crate::storage::RetryPolicy;
    use ::object_store::memory::InMemory;
    use std::sync::Arc;

    fn manager() -> ObjectStoreLockManager {
        ObjectStoreLockManager::new(RetryingStore::new(
            Arc::new(InMemory::new()),
            RetryPolicy::none(),
        ))
    }

    #[tokio::test]
    async fn test_exclusive() {
        contract::exclusive(&manager()).await;
    }

    #[tokio::test]
    async fn test_foreign_release_is_noop() {
        contract::foreign_release_is_noop(&manager()).await;
    }

    #[tokio::test]
    async fn test_expiry_allows_takeover() {
        contract::expiry_allows_takeover(&manager()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire() {
        contract::concurrent_acquire(Arc::new(manager())).await;
    }

    #[tokio::test]
    async fn test_lease_layout() {
        let manager = manager();
        let lease = manager
            .acquire("etl:d1", Duration::from_secs(60))
            .await
            .unwrap();

        let stored = manager
            .store
            .get_bytes(&ObjectStoreLockManager::lease_path("etl:d1"))
            .await
            .unwrap()
            .unwrap();
        let decoded: LockLease = serde_json::from_slice(&stored).unwrap();
        assert_eq!(decoded, lease);
    }

    #[tokio::test]
    async fn test_release_does_not_clobber_takeover() {
        let manager = manager();
        let path = ObjectStoreLockManager::lease_path("etl:d1");

        let ours = manager
            .acquire("etl:d1", Duration::from_secs(60))
            .await
            .unwrap();
        let (current, version) = manager.read(&path).await.unwrap().unwrap();
        assert!(current.same_lease(&ours));

        // Another run replaces the lease after our read
        let theirs = LockLease::new("etl:d1", Duration::from_secs(60)).unwrap();
        manager
            .store
            .put(&path, PutPayload::from(serde_json::to_vec(&theirs).unwrap()))
            .await
            .unwrap();

        assert!(!manager.retire(&path, current, version).await.unwrap());
        let (stored, _) = manager.read(&path).await.unwrap().unwrap();
        assert_eq!(stored, theirs);
        assert!(manager.is_held("etl:d1").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_leaves_expired_lease() {
        let manager = manager();
        let path = ObjectStoreLockManager::lease_path("etl:d1");
        let lease = manager
            .acquire("etl:d1", Duration::from_secs(60))
            .await
            .unwrap();

        manager.release(&lease).await.unwrap();
        let (stored, _) = manager.read(&path).await.unwrap().unwrap();
        assert_eq!(stored.owner_id, lease.owner_id);
        assert!(stored.is_expired());
        assert!(!manager.is_held("etl:d1").await.unwrap());

        let next = manager
            .acquire("etl:d1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(manager.is_held("etl:d1").await.unwrap());
        assert_ne!(next.owner_id, lease.owner_id);
    }
}
