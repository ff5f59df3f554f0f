//! ETL run orchestration
//!
//! One run of one dataset, as a single sequential task:
//!
//! ```text
//! acquire lock -> load watermarks -> extract -> transform
//!   -> load/publish -> save watermarks -> notify -> release lock
//! ```
//!
//! The lock is released whatever happens after it was taken. Cancellation
//! is observed only between steps, and once a version is published the run
//! finishes regardless.

use crate::config::Config;
use crate::lock::{create_lock_manager, default_lock_key, LockError, LockManager, DEFAULT_LOCK_TIMEOUT};
use crate::notify::{create_notifier, spawn_notification, ProjectionEvent, ProjectionNotifier};
use crate::state::{create_state_manager, StateError, StateManager, Watermarks};
use crate::storage::store::{self, RetryingStore};
use crate::storage::{build_object_store, DataPoint, PublishOutcome, StorageError, VersionedLoader};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors raised by stage implementations
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Stage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Source error: {0}")]
    Source(String),
}

/// Run errors
#[derive(Error, Debug)]
pub enum RunError {
    /// Another run holds the dataset lock
    #[error("Dataset {dataset_id} is busy (locked by {owner} until {expires_at})")]
    Busy {
        dataset_id: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("{step} stage failed: {source}")]
    Stage {
        step: &'static str,
        #[source]
        source: StageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Run cancelled before {step}")]
    Cancelled { step: &'static str },

    #[error("Run setup error: {0}")]
    Setup(String),
}

pub type RunResult<T> = Result<T, RunError>;

/// The dataset-specific part of a run
///
/// `extract` covers extraction, parsing and normalization. Watermarks are
/// handed in so incremental sources can skip what was already loaded.
#[async_trait]
pub trait Stages: Send + Sync {
    async fn extract(
        &self,
        dataset_id: &str,
        watermarks: &Watermarks,
    ) -> Result<Vec<DataPoint>, StageError>;

    async fn transform(&self, points: Vec<DataPoint>) -> Result<Vec<DataPoint>, StageError> {
        Ok(points)
    }
}

/// What a finished run did
#[derive(Debug)]
pub struct RunReport {
    pub dataset_id: String,
    pub points_extracted: usize,
    pub points_loaded: usize,
    pub outcome: PublishOutcome,
    /// The background notification, when one was sent
    pub notification: Option<JoinHandle<()>>,
}

/// Runs stages against a dataset under its lock
#[derive(Debug, Clone)]
pub struct EtlRunner {
    loader: VersionedLoader,
    locks: Arc<dyn LockManager>,
    state: Option<Arc<dyn StateManager>>,
    notifier: Option<Arc<dyn ProjectionNotifier>>,
    lock_key: Option<String>,
    lock_ttl: Duration,
    bucket: String,
}

impl EtlRunner {
    pub fn new(loader: VersionedLoader, locks: Arc<dyn LockManager>) -> Self {
        Self {
            loader,
            locks,
            state: None,
            notifier: None,
            lock_key: None,
            lock_ttl: DEFAULT_LOCK_TIMEOUT,
            bucket: String::new(),
        }
    }

    /// Wire every backend named by `config`
    pub fn from_config(config: &Config) -> RunResult<Self> {
        config
            .validate()
            .map_err(|e| RunError::Setup(e.to_string()))?;

        let object_store = build_object_store(
            &config.load.plugin,
            config.load.bucket.as_deref(),
            &config.load.aws_region,
            &config.load.local_root,
        )?;
        let retry = config.retry.policy();
        let shared = RetryingStore::new(object_store.clone(), retry);

        let loader = VersionedLoader::new(object_store, config.load.loader_config(retry))?;
        let locks = create_lock_manager(&config.lock.backend, &config.lock.dir, &shared)?;
        let state = create_state_manager(&config.state.backend, &config.state.dir, &shared)?;
        let notifier = create_notifier(&config.notification.backend, config.notification.http())
            .map_err(|e| RunError::Setup(e.to_string()))?;

        let mut runner = Self::new(loader, locks)
            .lock_ttl(config.lock.timeout())
            .bucket(config.load.bucket_label());
        runner.state = state;
        runner.notifier = notifier;
        if let Some(key) = &config.lock.key {
            runner = runner.lock_key(key.clone());
        }

        tracing::info!(
            plugin = %config.load.plugin,
            lock_backend = runner.locks.name(),
            state_backend = runner.state.as_ref().map(|s| s.name()).unwrap_or("none"),
            notification_backend = runner.notifier.as_ref().map(|n| n.name()).unwrap_or("none"),
            "ETL runner configured"
        );

        Ok(runner)
    }

    /// Builder method: set state backend
    pub fn with_state(mut self, state: Arc<dyn StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    /// Builder method: set notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn ProjectionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Builder method: use one fixed lock key for every dataset
    pub fn lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = Some(key.into());
        self
    }

    /// Builder method: set lease TTL
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Builder method: set the bucket named in notifications
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn loader(&self) -> &VersionedLoader {
        &self.loader
    }

    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub fn state(&self) -> Option<&Arc<dyn StateManager>> {
        self.state.as_ref()
    }

    fn key_for(&self, dataset_id: &str) -> String {
        self.lock_key
            .clone()
            .unwrap_or_else(|| default_lock_key(dataset_id))
    }

    /// Run `stages` for `dataset_id`
    pub async fn run(
        &self,
        dataset_id: &str,
        stages: &dyn Stages,
        cancel: &CancellationToken,
    ) -> RunResult<RunReport> {
        let key = self.key_for(dataset_id);
        let lease = match self.locks.acquire(&key, self.lock_ttl).await {
            Ok(lease) => lease,
            Err(LockError::Held {
                owner, expires_at, ..
            }) => {
                tracing::warn!(dataset_id, key = %key, owner = %owner, "Dataset busy, aborting run");
                return Err(RunError::Busy {
                    dataset_id: dataset_id.to_string(),
                    owner,
                    expires_at,
                });
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(dataset_id, key = %key, owner = %lease.owner_id, "Lock acquired");

        let result = self.run_locked(dataset_id, stages, cancel).await;

        match self.locks.release(&lease).await {
            Ok(()) => tracing::debug!(dataset_id, key = %key, "Lock released"),
            Err(e) => tracing::warn!(dataset_id, key = %key, error = %e, "Failed to release lock"),
        }

        match &result {
            Ok(report) => tracing::info!(
                dataset_id,
                version_id = ?report.outcome.version_id,
                points = report.points_loaded,
                has_new_data = report.outcome.has_new_data,
                "Run finished"
            ),
            Err(e) => tracing::error!(dataset_id, error = %e, "Run failed"),
        }
        result
    }

    async fn run_locked(
        &self,
        dataset_id: &str,
        stages: &dyn Stages,
        cancel: &CancellationToken,
    ) -> RunResult<RunReport> {
        checkpoint(cancel, "load_state")?;
        let watermarks = match &self.state {
            Some(state) => state.load(dataset_id).await?,
            None => Watermarks::new(),
        };

        checkpoint(cancel, "extract")?;
        let extracted = stages
            .extract(dataset_id, &watermarks)
            .await
            .map_err(|source| RunError::Stage {
                step: "extract",
                source,
            })?;
        let points_extracted = extracted.len();

        checkpoint(cancel, "transform")?;
        let points = stages
            .transform(extracted)
            .await
            .map_err(|source| RunError::Stage {
                step: "transform",
                source,
            })?;

        checkpoint(cancel, "load")?;
        let outcome = self.loader.load(dataset_id, &points).await?;

        // Published: cancellation no longer applies
        let saved = match (&self.state, outcome.published()) {
            (Some(state), true) => {
                let mut next = watermarks;
                next.advance(&points);
                state.save(dataset_id, &next).await
            }
            _ => Ok(()),
        };

        let notification = match (&self.notifier, &outcome.version_id) {
            (Some(notifier), Some(version_id)) if outcome.has_new_data => {
                let event = ProjectionEvent::projection_update(
                    dataset_id,
                    &self.bucket,
                    store::manifest_path(dataset_id, version_id).as_ref(),
                );
                Some(spawn_notification(notifier.clone(), event))
            }
            _ => None,
        };

        if let Err(e) = saved {
            tracing::error!(
                dataset_id,
                version_id = ?outcome.version_id,
                error = %e,
                "Version published but state was not saved"
            );
            return Err(e.into());
        }

        Ok(RunReport {
            dataset_id: dataset_id.to_string(),
            points_extracted,
            points_loaded: points.len(),
            outcome,
            notification,
        })
    }
}

fn checkpoint(cancel: &CancellationToken, step: &'static str) -> RunResult<()> {
    if cancel.is_cancelled() {
        tracing::warn!(step, "Run cancelled");
        return Err(RunError::Cancelled { step });
    }
    Ok(())
}
