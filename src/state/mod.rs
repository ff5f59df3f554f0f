//! Incremental state
//!
//! Per dataset, the newest observation time seen for every series. Stages
//! read it to skip already-loaded observations; the runner advances it only
//! after a version was published.

mod file;
mod object_store;

pub use self::file::FileStateManager;
pub use self::object_store::ObjectStoreStateManager;

use crate::storage::{DataPoint, RetryingStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// State errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State store error: {0}")]
    Store(#[from] ::object_store::Error),

    #[error("State IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State serialization error: {0}")]
    Serialization(String),

    #[error("State configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

pub type StateResult<T> = Result<T, StateError>;

/// Newest observation time per series
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermarks(BTreeMap<String, DateTime<Utc>>);

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, series_code: &str) -> Option<DateTime<Utc>> {
        self.0.get(series_code).copied()
    }

    /// Move a series forward; earlier times are ignored
    pub fn observe(&mut self, series_code: &str, obs_time: DateTime<Utc>) {
        self.0
            .entry(series_code.to_string())
            .and_modify(|current| *current = (*current).max(obs_time))
            .or_insert(obs_time);
    }

    /// Merge a batch in, never moving a series backwards
    pub fn advance(&mut self, points: &[DataPoint]) {
        for point in points {
            self.observe(&point.internal_series_code, point.obs_time_utc());
        }
    }

    /// Whether `point` is newer than what was already loaded for its series
    pub fn is_new(&self, point: &DataPoint) -> bool {
        self.get(&point.internal_series_code)
            .map_or(true, |seen| point.obs_time_utc() > seen)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DateTime<Utc>)> {
        self.0.iter().map(|(code, time)| (code.as_str(), *time))
    }
}

/// Persisted form of a dataset's watermarks
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    dataset_id: String,
    updated_at: DateTime<Utc>,
    series: Watermarks,
}

impl StateDocument {
    fn encode(dataset_id: &str, watermarks: &Watermarks) -> StateResult<Vec<u8>> {
        let doc = StateDocument {
            dataset_id: dataset_id.to_string(),
            updated_at: Utc::now(),
            series: watermarks.clone(),
        };
        Ok(serde_json::to_vec_pretty(&doc)?)
    }

    fn decode(bytes: &[u8]) -> StateResult<Watermarks> {
        Ok(serde_json::from_slice::<StateDocument>(bytes)?.series)
    }
}

/// Storage for watermarks
#[async_trait]
pub trait StateManager: Send + Sync + std::fmt::Debug {
    /// Backend name
    fn name(&self) -> &'static str;

    /// Watermarks of a dataset (empty when none were saved)
    async fn load(&self, dataset_id: &str) -> StateResult<Watermarks>;

    /// Replace a dataset's watermarks in one write
    async fn save(&self, dataset_id: &str, watermarks: &Watermarks) -> StateResult<()>;

    async fn get_last_date(
        &self,
        dataset_id: &str,
        series_code: &str,
    ) -> StateResult<Option<DateTime<Utc>>> {
        Ok(self.load(dataset_id).await?.get(series_code))
    }
}

/// Backend names accepted by [`create_state_manager`]
pub const STATE_BACKENDS: &[&str] = &["none", "file", "object_store"];

/// Build the configured state backend; `none` disables incremental state
pub fn create_state_manager(
    backend: &str,
    state_dir: &Path,
    store: &RetryingStore,
) -> StateResult<Option<Arc<dyn StateManager>>> {
    match backend {
        "none" => Ok(None),
        "file" => Ok(Some(Arc::new(FileStateManager::new(state_dir)?))),
        "object_store" => Ok(Some(Arc::new(ObjectStoreStateManager::new(store.clone())))),
        other => Err(StateError::Config(format!(
            "Unknown state backend: {} (expected one of {})",
            other,
            STATE_BACKENDS.join(", ")
        ))),
    }
}

#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use chrono::TimeZone;

    pub async fn roundtrip(manager: &dyn StateManager) {
        assert!(manager.load("d1").await.unwrap().is_empty());

        let mut marks = Watermarks::new();
        marks.observe("S1", Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap());
        marks.observe("S2", Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        manager.save("d1", &marks).await.unwrap();

        assert_eq!(manager.load("d1").await.unwrap(), marks);
        assert_eq!(
            manager.get_last_date("d1", "S2").await.unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );
        assert!(manager.get_last_date("d1", "S9").await.unwrap().is_none());

        // Whole-record overwrite
        let mut next = Watermarks::new();
        next.observe("S3", Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        manager.save("d1", &next).await.unwrap();
        assert_eq!(manager.load("d1").await.unwrap(), next);

        // Datasets are independent
        assert!(manager.load("d2").await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RetryPolicy;
    use ::object_store::memory::InMemory;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn point(series: &str, month: u32) -> DataPoint {
        DataPoint::new(
            series,
            Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap(),
            1.0,
        )
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let mut marks = Watermarks::new();
        marks.advance(&[point("S1", 3), point("S1", 1), point("S2", 2)]);
        assert_eq!(marks.get("S1"), Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));

        marks.advance(&[point("S1", 2)]);
        assert_eq!(marks.get("S1"), Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        assert_eq!(marks.len(), 2);
    }

    #[test]
    fn test_is_new() {
        let mut marks = Watermarks::new();
        marks.advance(&[point("S1", 2)]);

        assert!(!marks.is_new(&point("S1", 1)));
        assert!(!marks.is_new(&point("S1", 2)));
        assert!(marks.is_new(&point("S1", 3)));
        assert!(marks.is_new(&point("S2", 1)));
    }

    #[test]
    fn test_document_shape() {
        let mut marks = Watermarks::new();
        marks.advance(&[point("S1", 2)]);
        let bytes = StateDocument::encode("d1", &marks).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["dataset_id"], "d1");
        assert!(json["series"]["S1"].is_string());
        assert_eq!(StateDocument::decode(&bytes).unwrap(), marks);
    }

    #[test]
    fn test_factory() {
        let dir = tempdir().unwrap();
        let store = RetryingStore::new(Arc::new(InMemory::new()), RetryPolicy::none());

        assert!(create_state_manager("none", dir.path(), &store).unwrap().is_none());
        assert_eq!(
            create_state_manager("file", dir.path(), &store)
                .unwrap()
                .unwrap()
                .name(),
            "file"
        );
        assert_eq!(
            create_state_manager("object_store", dir.path(), &store)
                .unwrap()
                .unwrap()
                .name(),
            "object_store"
        );
        assert!(create_state_manager("redis", dir.path(), &store).is_err());
    }
}
