//! Storage engine error types
//!
//! Defines all errors that can occur in the versioned storage layer.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store operation failed (after retries, if the error was transient)
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Parquet encoding or decoding failed
    #[error("Parquet error: {0}")]
    Parquet(String),

    /// A partition path was not produced by the active strategy
    #[error("Malformed partition path: {0}")]
    MalformedPartition(String),

    /// The configured partition strategy name is not registered
    #[error("Unknown partition strategy: {0}")]
    UnknownPartitionStrategy(String),

    /// Data does not fit the fixed columnar schema
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// No manifest exists for the requested version
    #[error("Manifest not found for dataset {dataset_id}, version {version_id}")]
    ManifestNotFound {
        dataset_id: String,
        version_id: String,
    },

    /// A manifest exists but cannot be decoded
    #[error("Corrupt manifest at {path}: {error}")]
    CorruptManifest { path: String, error: String },

    /// The current-version pointer could not be advanced
    #[error("Failed to publish version {version_id} for dataset {dataset_id}: {reason}")]
    PublishFailed {
        dataset_id: String,
        version_id: String,
        reason: String,
    },

    /// Writing partitions or the manifest failed; the version is orphaned
    #[error("Load failed for dataset {dataset_id}, version {version_id}: {source}")]
    LoadFailed {
        dataset_id: String,
        version_id: String,
        #[source]
        source: Box<StorageError>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for StorageError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        StorageError::Parquet(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for StorageError {
    fn from(err: arrow::error::ArrowError) -> Self {
        StorageError::SchemaViolation(err.to_string())
    }
}

impl StorageError {
    /// The version left behind by a failed run, if any
    pub fn orphaned_version(&self) -> Option<&str> {
        match self {
            StorageError::PublishFailed { version_id, .. }
            | StorageError::LoadFailed { version_id, .. } => Some(version_id),
            _ => None,
        }
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::UnknownPartitionStrategy("by_week".to_string());
        assert_eq!(err.to_string(), "Unknown partition strategy: by_week");

        let err = StorageError::ManifestNotFound {
            dataset_id: "d1".to_string(),
            version_id: "v1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Manifest not found for dataset d1, version v1"
        );
    }

    #[test]
    fn test_orphaned_version() {
        let err = StorageError::LoadFailed {
            dataset_id: "d1".to_string(),
            version_id: "v20240101_000000_000000_abcd1234".to_string(),
            source: Box::new(StorageError::Parquet("boom".to_string())),
        };
        assert_eq!(
            err.orphaned_version(),
            Some("v20240101_000000_000000_abcd1234")
        );
        assert!(err.to_string().contains("boom"));

        let err = StorageError::Config("x".to_string());
        assert!(err.orphaned_version().is_none());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }
}
