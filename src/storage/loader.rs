//! Versioned loader
//!
//! The engine's entry point. A load turns one transformed batch into a new
//! version and publishes it:
//!
//! ```text
//! allocate version id
//!   -> read current pointer and its manifest
//!   -> write partition files under versions/{id}/data/
//!   -> write versions/{id}/manifest.json
//!   -> overwrite index/current_version.txt      (the only publish step)
//! ```
//!
//! Nothing before the last step is visible to readers, so a failure anywhere
//! leaves the previous version current and the new one orphaned.

use crate::storage::columnar::{parse_compression, ColumnarWriter, ParquetWriter, WriterOptions};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::manifest::{ManifestInputs, ManifestManager};
use crate::storage::partition::{PartitionStrategy, PartitionStrategyFactory, DEFAULT_PARTITION_STRATEGY};
use crate::storage::retry::RetryPolicy;
use crate::storage::store::{self, RetryingStore};
use crate::storage::types::{DataPoint, Manifest};
use crate::storage::version::VersionManager;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What to do with a batch that has no data points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyBatchPolicy {
    /// Publish an empty version, which becomes current
    #[default]
    Publish,
    /// Allocate nothing and leave the pointer alone
    Skip,
}

/// Configuration for the versioned loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Partition strategy name (`None` selects the default)
    pub partition_strategy: Option<String>,
    /// Parquet codec name
    pub compression: String,
    pub max_rows_per_file: Option<usize>,
    pub write_concurrency: usize,
    pub empty_batch: EmptyBatchPolicy,
    pub retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            partition_strategy: Some(DEFAULT_PARTITION_STRATEGY.to_string()),
            compression: "snappy".to_string(),
            max_rows_per_file: None,
            write_concurrency: 4,
            empty_batch: EmptyBatchPolicy::Publish,
            retry: RetryPolicy::default(),
        }
    }
}

impl LoaderConfig {
    /// Builder method: set partition strategy
    pub fn partition_strategy(mut self, name: impl Into<String>) -> Self {
        self.partition_strategy = Some(name.into());
        self
    }

    /// Builder method: set empty-batch policy
    pub fn empty_batch(mut self, policy: EmptyBatchPolicy) -> Self {
        self.empty_batch = policy;
        self
    }

    /// Builder method: set retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Result of one load
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub dataset_id: String,
    /// The version that became current (`None` when the batch was skipped)
    pub version_id: Option<String>,
    /// The version that was current before this load
    pub previous_version_id: Option<String>,
    pub manifest: Option<Manifest>,
    /// The pointer advanced to a version with at least one data point
    pub has_new_data: bool,
}

impl PublishOutcome {
    pub fn published(&self) -> bool {
        self.version_id.is_some()
    }
}

/// Orchestrates partitioning, file writes, manifests and the publish step
#[derive(Debug, Clone)]
pub struct VersionedLoader {
    store: RetryingStore,
    strategy: Arc<dyn PartitionStrategy>,
    writer: Arc<dyn ColumnarWriter>,
    versions: VersionManager,
    manifests: ManifestManager,
    empty_batch: EmptyBatchPolicy,
}

impl VersionedLoader {
    /// Create a loader; fails on an unknown partition strategy or codec
    pub fn new(object_store: Arc<dyn ObjectStore>, config: LoaderConfig) -> StorageResult<Self> {
        let store = RetryingStore::new(object_store, config.retry);
        let strategy = PartitionStrategyFactory::create(config.partition_strategy.as_deref())?;
        let writer = ParquetWriter::new(
            store.clone(),
            WriterOptions {
                compression: parse_compression(&config.compression)?,
                max_rows_per_file: config.max_rows_per_file,
                write_concurrency: config.write_concurrency,
            },
        );

        tracing::debug!(
            partition_strategy = strategy.name(),
            compression = %config.compression,
            empty_batch = ?config.empty_batch,
            "Created versioned loader"
        );

        Ok(Self {
            versions: VersionManager::new(store.clone()),
            manifests: ManifestManager::new(store.clone()),
            writer: Arc::new(writer),
            store,
            strategy,
            empty_batch: config.empty_batch,
        })
    }

    /// Builder method: replace the columnar writer
    pub fn with_writer(mut self, writer: Arc<dyn ColumnarWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn manifests(&self) -> &ManifestManager {
        &self.manifests
    }

    pub fn writer(&self) -> &Arc<dyn ColumnarWriter> {
        &self.writer
    }

    pub fn strategy(&self) -> &Arc<dyn PartitionStrategy> {
        &self.strategy
    }

    pub fn store(&self) -> &RetryingStore {
        &self.store
    }

    /// Write `points` as a new version of `dataset_id` and publish it
    pub async fn load(&self, dataset_id: &str, points: &[DataPoint]) -> StorageResult<PublishOutcome> {
        if points.is_empty() && self.empty_batch == EmptyBatchPolicy::Skip {
            let previous_version_id = self.versions.get_current_version(dataset_id).await?;
            tracing::info!(dataset_id, "Empty batch, skipping publish");
            return Ok(PublishOutcome {
                dataset_id: dataset_id.to_string(),
                version_id: None,
                previous_version_id,
                manifest: None,
                has_new_data: false,
            });
        }

        let version_id = self.versions.create_new_version(dataset_id);
        let previous_version_id = self.versions.get_current_version(dataset_id).await?;
        let previous = match &previous_version_id {
            Some(previous_id) => self.previous_manifest(dataset_id, previous_id).await?,
            None => None,
        };

        tracing::info!(
            dataset_id,
            version_id = %version_id,
            previous_version = ?previous_version_id,
            points = points.len(),
            partition_strategy = self.strategy.name(),
            "Loading new version"
        );

        let manifest = self
            .write_version(dataset_id, &version_id, points, previous.as_ref())
            .await
            .map_err(|source| {
                tracing::error!(
                    dataset_id,
                    version_id = %version_id,
                    error = %source,
                    "Load failed, version left orphaned"
                );
                StorageError::LoadFailed {
                    dataset_id: dataset_id.to_string(),
                    version_id: version_id.clone(),
                    source: Box::new(source),
                }
            })?;

        self.versions
            .set_current_version(dataset_id, &version_id)
            .await?;

        let has_new_data = manifest.has_data();
        tracing::info!(
            dataset_id,
            version_id = %version_id,
            data_points = manifest.data_points_count,
            files = manifest.parquet_files.len(),
            new_series = manifest.changelog.new_series.len(),
            updated_series = manifest.changelog.updated_series.len(),
            "Published version"
        );

        Ok(PublishOutcome {
            dataset_id: dataset_id.to_string(),
            version_id: Some(version_id),
            previous_version_id,
            manifest: Some(manifest),
            has_new_data,
        })
    }

    async fn write_version(
        &self,
        dataset_id: &str,
        version_id: &str,
        points: &[DataPoint],
        previous: Option<&Manifest>,
    ) -> StorageResult<Manifest> {
        let base = store::version_data_root(dataset_id, version_id);
        let parquet_files = self
            .writer
            .write(points, &base, self.strategy.as_ref())
            .await?;

        let partitions = self
            .strategy
            .get_all_partitions_from_paths(&parquet_files)
            .iter()
            .map(ToString::to_string)
            .collect();

        let manifest = self.manifests.create_manifest(
            version_id,
            dataset_id,
            points,
            ManifestInputs {
                parquet_files,
                partitions,
                partition_strategy: self.strategy.name().to_string(),
            },
            previous,
        );
        self.manifests.save_manifest(&manifest).await?;
        Ok(manifest)
    }

    /// The previous manifest only feeds the changelog, so a missing or
    /// unreadable one degrades to "no previous version"
    async fn previous_manifest(
        &self,
        dataset_id: &str,
        version_id: &str,
    ) -> StorageResult<Option<Manifest>> {
        match self.manifests.load_manifest(dataset_id, version_id).await {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e @ (StorageError::ManifestNotFound { .. } | StorageError::CorruptManifest { .. })) => {
                tracing::warn!(
                    dataset_id,
                    version_id,
                    error = %e,
                    "Previous manifest unavailable, treating all series as new"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Manifest of the current version, if one is published
    pub async fn current_manifest(&self, dataset_id: &str) -> StorageResult<Option<Manifest>> {
        match self.versions.get_current_version(dataset_id).await? {
            Some(version_id) => Ok(Some(
                self.manifests.load_manifest(dataset_id, &version_id).await?,
            )),
            None => Ok(None),
        }
    }

    /// Every data point of a version, in manifest file order
    pub async fn read_version(&self, dataset_id: &str, version_id: &str) -> StorageResult<Vec<DataPoint>> {
        let manifest = self.manifests.load_manifest(dataset_id, version_id).await?;
        let base = store::version_data_root(dataset_id, version_id);

        let mut points = Vec::with_capacity(manifest.data_points_count);
        for file in &manifest.parquet_files {
            points.extend(self.writer.read_file(&store::join(&base, file)).await?);
        }
        Ok(points)
    }
}
