//! Distributed locking
//!
//! A [`LockManager`] grants at most one live [`LockLease`] per key. Leases
//! expire on their own, so a crashed holder blocks others for at most the
//! lease TTL. Acquisition is a single conditional write in every backend:
//! create-if-absent, or replace-if-expired.
//!
//! Backends (selected by `[lock] backend`):
//! - `memory`: one process, one mutex
//! - `file`: exclusive-create lock files in a shared directory
//! - `object_store`: conditional puts on `locks/{key}.json`

mod file;
mod memory;
mod object_store;

pub use self::file::FileLockManager;
pub use self::memory::MemoryLockManager;
pub use self::object_store::ObjectStoreLockManager;

use crate::storage::RetryingStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Lease TTL used when configuration names none
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest lease TTL configuration accepts (7 days)
pub const MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Lock key guarding ETL runs of a dataset
pub fn default_lock_key(dataset_id: &str) -> String {
    format!("etl:{}", dataset_id)
}

/// Lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Another owner holds a live lease on the key
    #[error("Lock {key} is held by {owner} until {expires_at}")]
    Held {
        key: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Lock store error: {0}")]
    Store(#[from] ::object_store::Error),

    #[error("Lock IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock serialization error: {0}")]
    Serialization(String),

    #[error("Lock configuration error: {0}")]
    Config(String),

    #[error("Lock task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        LockError::Serialization(err.to_string())
    }
}

pub type LockResult<T> = Result<T, LockError>;

/// A held lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub key: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    /// A fresh lease for `key` with a new owner id
    pub fn new(key: &str, ttl: Duration) -> LockResult<Self> {
        let acquired_at = Utc::now();
        Ok(Self {
            key: key.to_string(),
            owner_id: uuid::Uuid::new_v4().to_string(),
            acquired_at,
            expires_at: expiry_after(acquired_at, ttl)?,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Same holder and same generation
    pub fn same_lease(&self, other: &LockLease) -> bool {
        self.owner_id == other.owner_id && self.expires_at == other.expires_at
    }

    fn held_error(&self) -> LockError {
        LockError::Held {
            key: self.key.clone(),
            owner: self.owner_id.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// `start + ttl`, or a config error when that is not a representable time
fn expiry_after(start: DateTime<Utc>, ttl: Duration) -> LockResult<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| start.checked_add_signed(ttl))
        .ok_or_else(|| LockError::Config(format!("lock timeout {:?} is out of range", ttl)))
}

/// Cluster-wide mutual exclusion
#[async_trait]
pub trait LockManager: Send + Sync + std::fmt::Debug {
    /// Backend name
    fn name(&self) -> &'static str;

    /// Take the lock, or fail immediately with [`LockError::Held`]
    async fn acquire(&self, key: &str, ttl: Duration) -> LockResult<LockLease>;

    /// Give the lock back; a no-op when the lease expired or was taken over
    async fn release(&self, lease: &LockLease) -> LockResult<()>;

    /// Whether a live lease exists for `key`
    async fn is_held(&self, key: &str) -> LockResult<bool>;
}

/// Backend names accepted by [`create_lock_manager`]
pub const LOCK_BACKENDS: &[&str] = &["memory", "file", "object_store"];

/// Build the configured lock backend
pub fn create_lock_manager(
    backend: &str,
    lock_dir: &Path,
    store: &RetryingStore,
) -> LockResult<Arc<dyn LockManager>> {
    match backend {
        "memory" => Ok(Arc::new(MemoryLockManager::new())),
        "file" => Ok(Arc::new(FileLockManager::new(lock_dir)?)),
        "object_store" => Ok(Arc::new(ObjectStoreLockManager::new(store.clone()))),
        other => Err(LockError::Config(format!(
            "Unknown lock backend: {} (expected one of {})",
            other,
            LOCK_BACKENDS.join(", ")
        ))),
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must show

    use super::*;

    pub async fn exclusive(manager: &dyn LockManager) {
        let lease = manager.acquire("etl:d1", DEFAULT_LOCK_TIMEOUT).await.unwrap();
        assert!(manager.is_held("etl:d1").await.unwrap());

        let err = manager
            .acquire("etl:d1", DEFAULT_LOCK_TIMEOUT)
            .await
            .unwrap_err();
        match err {
            LockError::Held { key, owner, .. } => {
                assert_eq!(key, "etl:d1");
                assert_eq!(owner, lease.owner_id);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Other keys are independent
        let other = manager.acquire("etl:d2", DEFAULT_LOCK_TIMEOUT).await.unwrap();
        manager.release(&other).await.unwrap();

        manager.release(&lease).await.unwrap();
        assert!(!manager.is_held("etl:d1").await.unwrap());
        let again = manager.acquire("etl:d1", DEFAULT_LOCK_TIMEOUT).await.unwrap();
        assert_ne!(again.owner_id, lease.owner_id);
    }

    pub async fn foreign_release_is_noop(manager: &dyn LockManager) {
        let lease = manager.acquire("etl:d1", DEFAULT_LOCK_TIMEOUT).await.unwrap();
        let mut impostor = lease.clone();
        impostor.owner_id = "someone-else".to_string();

        manager.release(&impostor).await.unwrap();
        assert!(manager.is_held("etl:d1").await.unwrap());

        manager.release(&lease).await.unwrap();
        // Releasing twice is fine
        manager.release(&lease).await.unwrap();
        assert!(!manager.is_held("etl:d1").await.unwrap());
    }

    pub async fn expiry_allows_takeover(manager: &dyn LockManager) {
        let short = Duration::from_millis(50);
        let stale = manager.acquire("etl:d1", short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(!manager.is_held("etl:d1").await.unwrap());
        let fresh = manager.acquire("etl:d1", DEFAULT_LOCK_TIMEOUT).await.unwrap();

        // The stale holder can no longer release the new lease
        manager.release(&stale).await.unwrap();
        assert!(manager.is_held("etl:d1").await.unwrap());
        manager.release(&fresh).await.unwrap();
    }

    pub async fn concurrent_acquire(manager: Arc<dyn LockManager>) {
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.acquire("etl:d1", DEFAULT_LOCK_TIMEOUT).await })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(LockError::Held { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
    }
}
