//! Manifest construction, persistence and changelog derivation

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::store::{self, RetryingStore};
use crate::storage::types::{Changelog, DataPoint, DateRange, Manifest};
use chrono::Utc;
use object_store::path::Path as ObjectPath;
use object_store::PutPayload;
use std::collections::BTreeSet;

/// Everything about a version that is known only after its files are written
#[derive(Debug, Clone, Default)]
pub struct ManifestInputs {
    pub parquet_files: Vec<String>,
    pub partitions: Vec<String>,
    pub partition_strategy: String,
}

/// Owns manifest content for every dataset
#[derive(Debug, Clone)]
pub struct ManifestManager {
    store: RetryingStore,
}

impl ManifestManager {
    pub fn new(store: RetryingStore) -> Self {
        Self { store }
    }

    /// Key of a version's manifest
    pub fn manifest_path(&self, dataset_id: &str, version_id: &str) -> ObjectPath {
        store::manifest_path(dataset_id, version_id)
    }

    /// Build the manifest for a batch
    pub fn create_manifest(
        &self,
        version_id: &str,
        dataset_id: &str,
        points: &[DataPoint],
        inputs: ManifestInputs,
        previous: Option<&Manifest>,
    ) -> Manifest {
        let series_codes: BTreeSet<&str> = points
            .iter()
            .map(|p| p.internal_series_code.as_str())
            .collect();

        let date_range = DateRange {
            min_obs_time: points.iter().map(DataPoint::obs_time_utc).min(),
            max_obs_time: points.iter().map(DataPoint::obs_time_utc).max(),
        };

        Manifest {
            version_id: version_id.to_string(),
            dataset_id: dataset_id.to_string(),
            created_at: Utc::now(),
            collection_date: points.first().and_then(|p| p.collection_date),
            data_points_count: points.len(),
            series_count: series_codes.len(),
            series_codes: series_codes.into_iter().map(String::from).collect(),
            date_range,
            changelog: self.compare_with_previous(points, previous),
            parquet_files: inputs.parquet_files,
            partitions: inputs.partitions,
            partition_strategy: inputs.partition_strategy,
            previous_version: previous.map(|m| m.version_id.clone()),
        }
    }

    /// Classify the batch's series against the previous version
    ///
    /// A series is new when the previous manifest does not list it, updated
    /// otherwise. Without a previous manifest everything is new.
    pub fn compare_with_previous(&self, points: &[DataPoint], previous: Option<&Manifest>) -> Changelog {
        let known: BTreeSet<&str> = previous
            .map(|m| m.series_codes.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let mut changelog = Changelog::default();
        for point in points {
            let code = point.internal_series_code.as_str();
            if known.contains(code) {
                changelog.updated_series.insert(code.to_string());
                changelog.data_points_updated += 1;
            } else {
                changelog.new_series.insert(code.to_string());
                changelog.data_points_added += 1;
            }
        }
        changelog
    }

    pub async fn save_manifest(&self, manifest: &Manifest) -> StorageResult<()> {
        let path = self.manifest_path(&manifest.dataset_id, &manifest.version_id);
        let body = serde_json::to_vec_pretty(manifest)?;
        self.store.put(&path, PutPayload::from(body)).await?;

        tracing::debug!(
            dataset_id = %manifest.dataset_id,
            version_id = %manifest.version_id,
            path = %path,
            "Saved manifest"
        );
        Ok(())
    }

    /// Load a manifest; a missing one is [`StorageError::ManifestNotFound`]
    pub async fn load_manifest(&self, dataset_id: &str, version_id: &str) -> StorageResult<Manifest> {
        let path = self.manifest_path(dataset_id, version_id);
        let bytes = self
            .store
            .get_bytes(&path)
            .await?
            .ok_or_else(|| StorageError::ManifestNotFound {
                dataset_id: dataset_id.to_string(),
                version_id: version_id.to_string(),
            })?;

        serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptManifest {
            path: path.to_string(),
            error: e.to_string(),
        })
    }
}
