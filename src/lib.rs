//! # Chronoshelf
//!
//! Versioned time-series snapshots on object storage. Every pipeline run
//! writes an immutable, partitioned Parquet version of a dataset and then
//! publishes it by overwriting a single pointer.
//!
//! ## Features
//!
//! - **Atomic publish**: readers see the previous version or the new one, never a mix
//! - **Partition-aware layout**: `{series}/year=YYYY/month=MM/` by default
//! - **Changelogs**: each manifest records new and updated series against its predecessor
//! - **Safe concurrency**: per-dataset lease locks on memory, files or the object store
//! - **Incremental runs**: per-series watermarks bound what the next run extracts
//!
//! ## Modules
//!
//! - [`storage`]: Versioned storage engine and publish protocol
//! - [`lock`]: Distributed lock managers
//! - [`state`]: Watermark persistence
//! - [`notify`]: Projection update notifications
//! - [`pipeline`]: Run orchestration
//! - [`source`]: CSV stages
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chronoshelf::config::Config;
//! use chronoshelf::pipeline::EtlRunner;
//! use chronoshelf::source::CsvSource;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runner = EtlRunner::from_config(&Config::load_default())?;
//!
//!     let report = runner
//!         .run("ipc", &CsvSource::new("ipc.csv"), &CancellationToken::new())
//!         .await?;
//!
//!     println!("current version: {:?}", report.outcome.version_id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod lock;
pub mod notify;
pub mod pipeline;
pub mod source;
pub mod state;
pub mod storage;

// Re-export main types
pub use config::Config;
pub use lock::{LockLease, LockManager};
pub use pipeline::{EtlRunner, RunError, RunReport, Stages};
pub use source::CsvSource;
pub use state::{StateManager, Watermarks};
pub use storage::{DataPoint, Manifest, StorageError, StorageResult, VersionedLoader};
