//! Process-local lock backend

use super::{LockLease, LockManager, LockResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Leases in a map guarded by one mutex
///
/// Only excludes runs inside the same process; meant for tests and single
/// node deployments.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    leases: Mutex<HashMap<String, LockLease>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(&self, key: &str, ttl: Duration) -> LockResult<LockLease> {
        let lease = LockLease::new(key, ttl)?;
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(current) = leases.get(key) {
            if !current.is_expired() {
                return Err(current.held_error());
            }
            tracing::info!(key, previous_owner = %current.owner_id, "Taking over expired lock");
        }

        leases.insert(key.to_string(), lease.clone());
        tracing::debug!(key, owner = %lease.owner_id, "Acquired lock");
        Ok(lease)
    }

    async fn release(&self, lease: &LockLease) -> LockResult<()> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(&lease.key) {
            Some(current) if current.same_lease(lease) => {
                leases.remove(&lease.key);
                tracing::debug!(key = %lease.key, owner = %lease.owner_id, "Released lock");
            }
            _ => {
                tracing::debug!(key = %lease.key, owner = %lease.owner_id, "Lease no longer held, nothing to release");
            }
        }
        Ok(())
    }

    async fn is_held(&self, key: &str) -> LockResult<bool> {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        Ok(leases.get(key).is_some_and(|lease| !lease.is_expired()))
    }
}
