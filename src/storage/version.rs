//! Version identifiers and the current-version pointer
//!
//! Per dataset the pointer moves `NoVersion -> Building -> Published`. A
//! version in `Building` is only a set of objects under its own prefix; it
//! becomes visible to readers in one step, when [`VersionManager::set_current_version`]
//! overwrites `index/current_version.txt`. Versions that never get there are
//! orphans and are never referenced.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::retry::is_transient;
use crate::storage::store::{self, RetryingStore};
use chrono::Utc;
use object_store::PutPayload;
use std::sync::Arc;

/// Allocates version ids and owns the per-dataset pointer
#[derive(Debug, Clone)]
pub struct VersionManager {
    store: RetryingStore,
}

impl VersionManager {
    pub fn new(store: RetryingStore) -> Self {
        Self { store }
    }

    /// Allocate a new version id
    ///
    /// Ids sort by creation time (`v{YYYYMMDD_HHMMSS_ffffff}` in UTC) and carry
    /// a random suffix so concurrent allocations never collide. Nothing is
    /// written to the store.
    pub fn create_new_version(&self, dataset_id: &str) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let version_id = format!(
            "v{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S_%6f"),
            &suffix[..8]
        );
        tracing::debug!(dataset_id, version_id = %version_id, "Allocated version id");
        version_id
    }

    /// The published version, if any (an empty pointer counts as none)
    pub async fn get_current_version(&self, dataset_id: &str) -> StorageResult<Option<String>> {
        let body = self
            .store
            .get_bytes(&store::current_version_path(dataset_id))
            .await?;

        Ok(body.and_then(|bytes| {
            let version_id = String::from_utf8_lossy(&bytes).trim().to_string();
            (!version_id.is_empty()).then_some(version_id)
        }))
    }

    /// Publish `version_id` by overwriting the pointer
    ///
    /// A failed write may still have landed, so the pointer is re-read before
    /// each retry. On exhaustion the previous pointer is left in place and
    /// [`StorageError::PublishFailed`] names the orphaned version.
    pub async fn set_current_version(&self, dataset_id: &str, version_id: &str) -> StorageResult<()> {
        let path = store::current_version_path(dataset_id);
        let policy = self.store.retry_policy();
        let max_attempts = policy.max_attempts.max(1);
        let payload = PutPayload::from(version_id.to_string());
        let store = Arc::clone(self.store.inner());

        let mut attempt = 1;
        loop {
            let err = match store.put(&path, payload.clone()).await {
                Ok(_) => {
                    tracing::info!(dataset_id, version_id, "Published current version");
                    return Ok(());
                }
                Err(e) => e,
            };

            let observed = self.get_current_version(dataset_id).await.map_err(|read_err| {
                publish_failed(dataset_id, version_id, format!("{}; re-read failed: {}", err, read_err))
            })?;
            if observed.as_deref() == Some(version_id) {
                tracing::warn!(
                    dataset_id,
                    version_id,
                    error = %err,
                    "Pointer write reported failure but landed"
                );
                return Ok(());
            }

            if attempt >= max_attempts || !is_transient(&err) {
                tracing::error!(
                    dataset_id,
                    version_id,
                    attempt,
                    error = %err,
                    "Failed to publish version"
                );
                return Err(publish_failed(dataset_id, version_id, err.to_string()));
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(
                dataset_id,
                version_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Pointer write failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Version ids that have a manifest, newest first
    pub async fn list_versions(&self, dataset_id: &str) -> StorageResult<Vec<String>> {
        let listing = self
            .store
            .list_with_delimiter(&store::versions_prefix(dataset_id))
            .await?;

        let mut versions = Vec::new();
        for prefix in listing.common_prefixes {
            let Some(version_id) = prefix.filename() else {
                continue;
            };
            if !version_id.starts_with('v') {
                continue;
            }
            if self
                .store
                .exists(&store::manifest_path(dataset_id, version_id))
                .await?
            {
                versions.push(version_id.to_string());
            }
        }

        versions.sort_unstable_by(|a, b| b.cmp(a));
        Ok(versions)
    }
}

fn publish_failed(dataset_id: &str, version_id: &str, reason: String) -> StorageError {
    StorageError::PublishFailed {
        dataset_id: dataset_id.to_string(),
        version_id: version_id.to_string(),
        reason,
    }
}
