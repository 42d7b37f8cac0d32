//! Namespace decorator that prepends a key prefix to a delegate backend
//! Used by the registry to back dotted backend names

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    BlobBackend, BlobListResult, BlobMetadata, ListOptions, PresignMethod, PutOptions,
};
use crate::error::Result;

/// Wrapper that rewrites every inbound key to `prefix + key` and strips the
/// prefix from every outbound key, metadata entry, and marker.
///
/// An empty prefix is the identity decorator. Composing two wrappers
/// concatenates their prefixes.
#[derive(Debug)]
pub struct PrefixedBackend {
    backend: Arc<dyn BlobBackend>,
    prefix: String,
}

impl PrefixedBackend {
    /// Wrap `backend` under `prefix`. The prefix is normalized to end with
    /// `/` unless empty; no leading `/` is ever inserted.
    pub fn new(backend: Arc<dyn BlobBackend>, prefix: &str) -> Self {
        let trimmed = prefix.trim_end_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self { backend, prefix }
    }

    /// The normalized prefix (empty, or ending with `/`).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn add_prefix(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn strip_prefix(&self, key: &str) -> String {
        match key.strip_prefix(&self.prefix) {
            Some(stripped) if !self.prefix.is_empty() => stripped.to_string(),
            _ => key.to_string(),
        }
    }
}

impl BlobBackend for PrefixedBackend {
    fn put(&self, key: &str, data: &[u8], opts: &PutOptions) -> Result<String> {
        self.backend.put(&self.add_prefix(key), data, opts)
    }

    fn put_stream(&self, key: &str, data: &mut dyn Read, opts: &PutOptions) -> Result<String> {
        self.backend.put_stream(&self.add_prefix(key), data, opts)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.backend.get(&self.add_prefix(key))
    }

    fn get_stream(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        self.backend.get_stream(&self.add_prefix(key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(&self.add_prefix(key))
    }

    fn delete_many(&self, keys: &[String]) -> HashMap<String, bool> {
        let prefixed: Vec<String> = keys.iter().map(|k| self.add_prefix(k)).collect();
        self.backend
            .delete_many(&prefixed)
            .into_iter()
            .map(|(k, v)| (self.strip_prefix(&k), v))
            .collect()
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(&self.add_prefix(key))
    }

    fn get_metadata(&self, key: &str) -> Result<BlobMetadata> {
        let mut metadata = self.backend.get_metadata(&self.add_prefix(key))?;
        metadata.key = self.strip_prefix(&metadata.key);
        Ok(metadata)
    }

    fn get_size(&self, key: &str) -> Result<u64> {
        self.backend.get_size(&self.add_prefix(key))
    }

    fn list(&self, opts: &ListOptions) -> Result<BlobListResult> {
        // Concatenate our prefix with the caller's, and translate the
        // marker on the way down and the next_marker on the way up
        let full_prefix = match &opts.prefix {
            Some(p) => Some(self.add_prefix(p)),
            None if self.prefix.is_empty() => None,
            None => Some(self.prefix.clone()),
        };

        let delegate_opts = ListOptions {
            prefix: full_prefix,
            delimiter: opts.delimiter.clone(),
            max_results: opts.max_results,
            marker: opts.marker.as_ref().map(|m| self.add_prefix(m)),
        };

        let result = self.backend.list(&delegate_opts)?;

        let blobs = result
            .blobs
            .into_iter()
            .map(|mut blob| {
                blob.key = self.strip_prefix(&blob.key);
                blob
            })
            .collect();
        let prefixes = result
            .prefixes
            .into_iter()
            .map(|p| self.strip_prefix(&p))
            .collect();

        Ok(BlobListResult {
            blobs,
            prefixes,
            is_truncated: result.is_truncated,
            next_marker: result.next_marker.map(|m| self.strip_prefix(&m)),
        })
    }

    fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        self.backend
            .copy(&self.add_prefix(source_key), &self.add_prefix(dest_key))
    }

    fn generate_presigned_url(
        &self,
        key: &str,
        expiration: Duration,
        method: PresignMethod,
    ) -> Result<String> {
        self.backend
            .generate_presigned_url(&self.add_prefix(key), expiration, method)
    }
}
