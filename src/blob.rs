//! High-level blob storage facade over a pluggable backend

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    BlobBackend, BlobListResult, BlobMetadata, ListOptions, PresignMethod, PutOptions,
};
use crate::error::{Result, StorageError};
use crate::registry::BackendRegistry;

/// Ergonomic interface over a [`BlobBackend`].
///
/// Adds `Path`-based puts and downloads and auto-paginating listing on top
/// of the raw backend contract.
#[derive(Clone)]
pub struct BlobStorage {
    backend: Arc<dyn BlobBackend>,
    name: String,
}

impl BlobStorage {
    /// Wrap an existing backend instance.
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self {
            backend,
            name: String::new(),
        }
    }

    /// Resolve a named backend through the registry.
    pub fn from_name(registry: &BackendRegistry, name: &str) -> Result<Self> {
        let backend = registry.get_backend(name)?;
        Ok(Self {
            backend,
            name: name.to_string(),
        })
    }

    /// Backend name this storage was resolved from, if any.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store a blob from bytes.
    pub fn put(&self, key: &str, data: &[u8], opts: &PutOptions) -> Result<String> {
        self.backend.put(key, data, opts)
    }

    /// Store a blob from a reader.
    pub fn put_stream(&self, key: &str, data: &mut dyn Read, opts: &PutOptions) -> Result<String> {
        self.backend.put_stream(key, data, opts)
    }

    /// Store a blob from a local file.
    pub fn put_file(&self, key: &str, path: &Path, opts: &PutOptions) -> Result<String> {
        let mut file = File::open(path)
            .map_err(|e| StorageError::Backend(format!("Failed to open {path:?}: {e}")))?;
        self.backend.put_stream(key, &mut file, opts)
    }

    /// Retrieve a blob as bytes.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.backend.get(key)
    }

    /// Retrieve a blob as a reader.
    pub fn get_stream(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        self.backend.get_stream(key)
    }

    /// Download a blob to a local file.
    pub fn download_to_file(&self, key: &str, path: &Path) -> Result<()> {
        let mut stream = self.backend.get_stream(key)?;
        let mut file = File::create(path)
            .map_err(|e| StorageError::Backend(format!("Failed to create {path:?}: {e}")))?;
        let mut chunk = [0u8; 8192];
        loop {
            let n = stream
                .read(&mut chunk)
                .map_err(|e| StorageError::Backend(format!("Failed to read blob {key}: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&chunk[..n])
                .map_err(|e| StorageError::Backend(format!("Failed to write {path:?}: {e}")))?;
        }
        Ok(())
    }

    /// Delete a blob.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key)
    }

    /// Delete multiple blobs, best-effort.
    pub fn delete_many(&self, keys: &[String]) -> HashMap<String, bool> {
        self.backend.delete_many(keys)
    }

    /// Check whether a blob exists.
    pub fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(key)
    }

    /// Get metadata for a blob.
    pub fn get_metadata(&self, key: &str) -> Result<BlobMetadata> {
        self.backend.get_metadata(key)
    }

    /// Get the size of a blob in bytes.
    pub fn get_size(&self, key: &str) -> Result<u64> {
        self.backend.get_size(key)
    }

    /// List all blobs under a prefix, following pagination to the end.
    pub fn list(&self, prefix: Option<&str>) -> Result<Vec<BlobMetadata>> {
        let mut blobs = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let opts = ListOptions {
                prefix: prefix.map(str::to_string),
                marker: marker.take(),
                ..ListOptions::default()
            };
            let page = self.backend.list(&opts)?;
            blobs.extend(page.blobs);

            if !page.is_truncated {
                break;
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                // Truncated page without a continuation token; stop rather than loop
                None => break,
            }
        }

        Ok(blobs)
    }

    /// List a single page with full control over the options.
    pub fn list_page(&self, opts: &ListOptions) -> Result<BlobListResult> {
        self.backend.list(opts)
    }

    /// List common prefixes (directories) under a prefix.
    pub fn list_prefixes(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let opts = ListOptions {
            prefix: prefix.map(str::to_string),
            delimiter: Some("/".to_string()),
            ..ListOptions::default()
        };
        Ok(self.backend.list(&opts)?.prefixes)
    }

    /// Copy a blob to a new key.
    pub fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        self.backend.copy(source_key, dest_key)
    }

    /// Generate a presigned URL for temporary access.
    pub fn generate_presigned_url(
        &self,
        key: &str,
        expiration: Duration,
        method: PresignMethod,
    ) -> Result<String> {
        self.backend.generate_presigned_url(key, expiration, method)
    }
}
