//! Blob storage backends
//! S3-like byte-addressable stores behind a single object-safe trait

pub mod filesystem;
pub mod prefixed;
pub mod s3;

pub use filesystem::FilesystemBackend;
pub use prefixed::PrefixedBackend;
pub use s3::S3Backend;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use crate::error::Result;

/// Metadata for a stored blob
#[derive(Debug, Clone)]
pub struct BlobMetadata {
    /// Object key (path)
    pub key: String,

    /// Size in bytes
    pub size: u64,

    /// MIME type, if recorded
    pub content_type: Option<String>,

    /// Last modification timestamp (UTC)
    pub last_modified: DateTime<Utc>,

    /// ETag or version identifier (None for backends without one)
    pub etag: Option<String>,

    /// Custom metadata key-value pairs
    pub custom_metadata: HashMap<String, String>,
}

/// Result from listing blobs
#[derive(Debug, Clone, Default)]
pub struct BlobListResult {
    /// Blobs in this page
    pub blobs: Vec<BlobMetadata>,

    /// Common prefixes (directories) when a delimiter was given
    pub prefixes: Vec<String>,

    /// Whether more results are available
    pub is_truncated: bool,

    /// Continuation token for the next page
    pub next_marker: Option<String>,
}

/// Options for storing a blob
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// MIME type of the content
    pub content_type: Option<String>,

    /// Custom metadata key-value pairs
    pub metadata: HashMap<String, String>,
}

impl PutOptions {
    /// Options carrying just a content type
    pub fn with_content_type(content_type: &str) -> Self {
        Self {
            content_type: Some(content_type.to_string()),
            metadata: HashMap::new(),
        }
    }
}

/// Options for listing blobs
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Only list blobs with this key prefix
    pub prefix: Option<String>,

    /// Delimiter for grouping (e.g. "/" for directory-style listing)
    pub delimiter: Option<String>,

    /// Maximum number of blobs per page
    pub max_results: usize,

    /// Continuation token from a previous truncated result
    pub marker: Option<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            delimiter: None,
            max_results: 1000,
            marker: None,
        }
    }
}

impl ListOptions {
    /// Options listing everything under a key prefix
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: Some(prefix.to_string()),
            ..Self::default()
        }
    }
}

/// HTTP method a presigned URL authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignMethod {
    Get,
    Put,
}

/// Byte-addressable object store contract.
///
/// Keys are POSIX-style forward-slash paths, case-sensitive, never starting
/// with `/`. All operations are synchronous; blocking I/O happens inline.
pub trait BlobBackend: Send + Sync + std::fmt::Debug {
    /// Store a blob, overwriting silently. Returns an ETag or version id.
    fn put(&self, key: &str, data: &[u8], opts: &PutOptions) -> Result<String>;

    /// Store a blob from a reader of unknown length.
    ///
    /// Backends that need the length up front (S3) buffer the stream before
    /// committing; the filesystem backend streams chunk by chunk.
    fn put_stream(&self, key: &str, data: &mut dyn Read, opts: &PutOptions) -> Result<String>;

    /// Retrieve a blob. Fails with `NotFound` when absent.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Retrieve a blob as a reader. Fails with `NotFound` when absent.
    fn get_stream(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Delete a blob. Fails with `NotFound` when absent.
    fn delete(&self, key: &str) -> Result<()>;

    /// Delete multiple blobs, best-effort. Never fails for a partial
    /// failure; the per-key flag conveys the outcome.
    fn delete_many(&self, keys: &[String]) -> HashMap<String, bool>;

    /// Check whether a blob exists. Absence is not an error.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Get metadata without downloading. Fails with `NotFound` when absent.
    fn get_metadata(&self, key: &str) -> Result<BlobMetadata>;

    /// Get the size of a blob in bytes. Fails with `NotFound` when absent.
    fn get_size(&self, key: &str) -> Result<u64>;

    /// List blobs. A non-existent prefix yields an empty result. With a
    /// delimiter, non-leaf paths collapse into `prefixes`.
    fn list(&self, opts: &ListOptions) -> Result<BlobListResult>;

    /// Copy a blob. Fails with `NotFound` when the source is absent;
    /// overwrites the destination.
    fn copy(&self, source_key: &str, dest_key: &str) -> Result<()>;

    /// Generate a presigned URL for temporary access.
    fn generate_presigned_url(
        &self,
        key: &str,
        expiration: Duration,
        method: PresignMethod,
    ) -> Result<String>;
}
