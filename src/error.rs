//! Error types for blob storage and the lakehouse layers

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Blob already exists: {0}")]
    AlreadyExists(String),

    #[error("Connection to storage backend failed: {0}")]
    Connection(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Backend '{name}' not found in configuration. Available backends: {available}")]
    BackendNotFound { name: String, available: String },

    #[error("Data quality check failed: {0}")]
    DataQuality(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Backend(format!("I/O error: {err}"))
    }
}

impl From<arrow::error::ArrowError> for StorageError {
    fn from(err: arrow::error::ArrowError) -> Self {
        StorageError::Backend(format!("Arrow error: {err}"))
    }
}

impl From<parquet::errors::ParquetError> for StorageError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        StorageError::Backend(format!("Parquet error: {err}"))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(format!("JSON error: {err}"))
    }
}
