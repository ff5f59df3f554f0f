//! Object store backends and the dataset key layout
//!
//! Layout, relative to `datasets/{dataset_id}/`:
//!
//! ```text
//! index/current_version.txt                       -> version id (plain text)
//! versions/{version_id}/data/{partition_path}/... -> parquet files
//! versions/{version_id}/manifest.json
//! state/watermarks.json
//! ```

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::retry::RetryPolicy;
use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    ListResult, ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload, PutResult,
    UpdateVersion,
};
use std::path::Path;
use std::sync::Arc;

/// Loader plugin backed by Amazon S3
pub const PLUGIN_S3: &str = "s3_versioned";
/// Loader plugin backed by a local directory
pub const PLUGIN_LOCAL: &str = "local_versioned";
/// Loader plugin backed by process memory (tests, dry runs)
pub const PLUGIN_MEMORY: &str = "memory_versioned";

/// Build the object store selected by the `load.plugin` name
pub fn build_object_store(
    plugin: &str,
    bucket: Option<&str>,
    aws_region: &str,
    local_root: &Path,
) -> StorageResult<Arc<dyn ObjectStore>> {
    match plugin {
        PLUGIN_S3 => {
            let bucket = bucket.ok_or_else(|| {
                StorageError::Config(format!("load.bucket is required by the {} plugin", plugin))
            })?;
            let store = s3_builder(bucket, aws_region).build()?;
            tracing::info!(bucket, region = aws_region, "Using S3 object store");
            Ok(Arc::new(store))
        }
        PLUGIN_LOCAL => {
            std::fs::create_dir_all(local_root)?;
            let store = LocalFileSystem::new_with_prefix(local_root)?;
            tracing::info!(root = ?local_root, "Using local object store");
            Ok(Arc::new(store))
        }
        PLUGIN_MEMORY => {
            tracing::info!("Using in-memory object store");
            Ok(Arc::new(InMemory::new()))
        }
        other => Err(StorageError::Config(format!(
            "Unknown loader plugin: {} (expected one of {}, {}, {})",
            other, PLUGIN_S3, PLUGIN_LOCAL, PLUGIN_MEMORY
        ))),
    }
}

/// S3 builder with etag-conditional puts, required by lease takeover
/// and create-only writes
pub(crate) fn s3_builder(bucket: &str, region: &str) -> AmazonS3Builder {
    AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(region)
        .with_conditional_put(S3ConditionalPut::ETagMatch)
}

/// Root of everything stored for one dataset
pub fn dataset_root(dataset_id: &str) -> ObjectPath {
    ObjectPath::from("datasets").child(dataset_id)
}

/// Key of the current-version pointer
pub fn current_version_path(dataset_id: &str) -> ObjectPath {
    dataset_root(dataset_id)
        .child("index")
        .child("current_version.txt")
}

/// Prefix under which all versions of a dataset live
pub fn versions_prefix(dataset_id: &str) -> ObjectPath {
    dataset_root(dataset_id).child("versions")
}

/// Root of a single version
pub fn version_root(dataset_id: &str, version_id: &str) -> ObjectPath {
    versions_prefix(dataset_id).child(version_id)
}

/// Base path that partition file paths are relative to
pub fn version_data_root(dataset_id: &str, version_id: &str) -> ObjectPath {
    version_root(dataset_id, version_id).child("data")
}

/// Key of a version's manifest
pub fn manifest_path(dataset_id: &str, version_id: &str) -> ObjectPath {
    version_root(dataset_id, version_id).child("manifest.json")
}

/// Key of the incremental watermark record
pub fn state_path(dataset_id: &str) -> ObjectPath {
    dataset_root(dataset_id).child("state").child("watermarks.json")
}

/// Join a slash-separated relative path onto a base
pub fn join(base: &ObjectPath, relative: &str) -> ObjectPath {
    relative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(base.clone(), |path, segment| path.child(segment))
}

/// Object store handle that retries transient failures
///
/// Every component that touches the store goes through this wrapper, so the
/// retry policy is applied uniformly.
#[derive(Debug, Clone)]
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { inner, retry }
    }

    /// The underlying store, without retries
    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Unconditional whole-object overwrite
    pub async fn put(
        &self,
        path: &ObjectPath,
        payload: PutPayload,
    ) -> Result<PutResult, object_store::Error> {
        self.put_mode(path, payload, PutMode::Overwrite).await
    }

    /// Conditional write: `Create` fails with `AlreadyExists`, `Update` fails
    /// with `Precondition` when the object changed since it was read
    pub async fn put_mode(
        &self,
        path: &ObjectPath,
        payload: PutPayload,
        mode: PutMode,
    ) -> Result<PutResult, object_store::Error> {
        self.retry
            .retry("put", || {
                let store = Arc::clone(&self.inner);
                let path = path.clone();
                let payload = payload.clone();
                let opts = PutOptions::from(mode.clone());
                async move { store.put_opts(&path, payload, opts).await }
            })
            .await
    }

    /// Object body, or `None` when the key does not exist
    pub async fn get_bytes(&self, path: &ObjectPath) -> Result<Option<Bytes>, object_store::Error> {
        Ok(self.get_versioned(path).await?.map(|(bytes, _)| bytes))
    }

    /// Object body together with the version token needed for `PutMode::Update`
    pub async fn get_versioned(
        &self,
        path: &ObjectPath,
    ) -> Result<Option<(Bytes, UpdateVersion)>, object_store::Error> {
        let result = self
            .retry
            .retry("get", || {
                let store = Arc::clone(&self.inner);
                let path = path.clone();
                async move {
                    let result = store.get(&path).await?;
                    let version = UpdateVersion {
                        e_tag: result.meta.e_tag.clone(),
                        version: result.meta.version.clone(),
                    };
                    Ok((result.bytes().await?, version))
                }
            })
            .await;

        match result {
            Ok(found) => Ok(Some(found)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether a key exists
    pub async fn exists(&self, path: &ObjectPath) -> Result<bool, object_store::Error> {
        let result = self
            .retry
            .retry("head", || {
                let store = Arc::clone(&self.inner);
                let path = path.clone();
                async move { store.head(&path).await }
            })
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every object under a prefix
    pub async fn list(&self, prefix: &ObjectPath) -> Result<Vec<ObjectMeta>, object_store::Error> {
        self.retry
            .retry("list", || {
                let store = Arc::clone(&self.inner);
                let prefix = prefix.clone();
                async move { store.list(Some(&prefix)).try_collect::<Vec<_>>().await }
            })
            .await
    }

    /// Immediate children of a prefix
    pub async fn list_with_delimiter(
        &self,
        prefix: &ObjectPath,
    ) -> Result<ListResult, object_store::Error> {
        self.retry
            .retry("list", || {
                let store = Arc::clone(&self.inner);
                let prefix = prefix.clone();
                async move { store.list_with_delimiter(Some(&prefix)).await }
            })
            .await
    }
}
