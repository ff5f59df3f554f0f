//! Chronoshelf versioned storage engine
//!
//! Turns a batch of data points into a durable, partitioned, atomically
//! published version on an object store:
//!
//! - **types**: Core data structures (DataPoint, Manifest, Changelog, Version)
//! - **partition**: Partition strategies and the strategy factory
//! - **columnar**: Parquet partition files with a fixed schema
//! - **version**: Version ids and the current-version pointer
//! - **manifest**: Per-version metadata and changelog derivation
//! - **loader**: The publish protocol tying the above together
//! - **store**: Object store backends, key layout and retries
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   DataPoints → Partition → Parquet files → Manifest → Pointer overwrite
//!
//! Read Path:
//!   Pointer → Manifest → Parquet files
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use chronoshelf::storage::{build_object_store, DataPoint, LoaderConfig, VersionedLoader};
//! use chrono::{TimeZone, Utc};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = build_object_store("local_versioned", None, "us-east-1", Path::new("./data"))?;
//!     let loader = VersionedLoader::new(store, LoaderConfig::default())?;
//!
//!     let points = vec![DataPoint::new(
//!         "IPC_GENERAL",
//!         Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
//!         112.4,
//!     )];
//!     let outcome = loader.load("ipc", &points).await?;
//!     println!("current version: {:?}", outcome.version_id);
//!
//!     Ok(())
//! }
//! ```

pub mod columnar;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod partition;
pub mod retry;
pub mod store;
pub mod types;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use columnar::{parse_compression, ColumnarWriter, ParquetWriter, WriterOptions};
pub use error::{StorageError, StorageResult};
pub use loader::{EmptyBatchPolicy, LoaderConfig, PublishOutcome, VersionedLoader};
pub use manifest::{ManifestInputs, ManifestManager};
pub use partition::{
    PartitionKey, PartitionStrategy, PartitionStrategyFactory, SeriesYearMonthStrategy,
    SeriesYearStrategy, DEFAULT_PARTITION_STRATEGY,
};
pub use retry::RetryPolicy;
pub use store::{build_object_store, RetryingStore};
pub use types::{parse_timestamp, Changelog, DataPoint, DateRange, Manifest, Version};
pub use version::VersionManager;
