//! S3-compatible implementation of the blob backend over rust-s3
//! Works against AWS S3 and MinIO with path-style addressing

use chrono::{DateTime, Utc};
use s3::bucket::Bucket;
use s3::bucket_ops::BucketConfiguration;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{
    BlobBackend, BlobListResult, BlobMetadata, ListOptions, PresignMethod, PutOptions,
};
use crate::error::{Result, StorageError};

/// Blob backend over an S3-compatible object store.
///
/// The optional `prefix` is applied at bucket-mount time and is invisible
/// to callers; it is distinct from the registry's `PrefixedBackend`
/// decorator. Streaming puts buffer the stream first because S3 requires a
/// known content length.
#[derive(Debug)]
pub struct S3Backend {
    bucket: Bucket,
    prefix: String,
}

/// Build the endpoint URL rust-s3 expects, honoring `secure`.
fn endpoint_url(endpoint: &str, secure: bool) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if secure {
        format!("https://{endpoint}")
    } else {
        format!("http://{endpoint}")
    }
}

/// Join the mount prefix to a caller key.
fn join_prefix(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

/// Map a rust-s3 error for an operation on `key` into the storage taxonomy.
fn translate_err(key: &str, err: S3Error) -> StorageError {
    match err {
        S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(key.to_string()),
        S3Error::HttpFailWithBody(code, body) => {
            StorageError::Backend(format!("S3 request for {key} failed with status {code}: {body}"))
        }
        other => StorageError::Backend(format!("S3 request for {key} failed: {other}")),
    }
}

impl S3Backend {
    /// Connect to an S3-compatible endpoint, creating the bucket if it does
    /// not exist yet.
    pub fn new(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        bucket_name: &str,
        secure: bool,
        region: Option<&str>,
        prefix: Option<&str>,
    ) -> Result<Self> {
        let region = Region::Custom {
            region: region.unwrap_or("us-east-1").to_string(),
            endpoint: endpoint_url(endpoint, secure),
        };
        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Connection(format!("Invalid S3 credentials: {e}")))?;

        let bucket = Bucket::new(bucket_name, region.clone(), credentials.clone())
            .map_err(|e| StorageError::Connection(format!("Failed to open bucket {bucket_name}: {e}")))?
            .with_path_style();

        match bucket.exists() {
            Ok(true) => debug!("Using existing bucket: {bucket_name}"),
            Ok(false) => {
                Bucket::create_with_path_style(
                    bucket_name,
                    region,
                    credentials,
                    BucketConfiguration::default(),
                )
                .map_err(|e| {
                    StorageError::Connection(format!("Failed to create bucket {bucket_name}: {e}"))
                })?;
                info!("Created bucket: {bucket_name}");
            }
            Err(e) => {
                return Err(StorageError::Connection(format!(
                    "Failed to reach bucket {bucket_name}: {e}"
                )))
            }
        }

        let prefix = match prefix {
            Some(p) if !p.trim_end_matches('/').is_empty() => {
                format!("{}/", p.trim_end_matches('/'))
            }
            _ => String::new(),
        };

        Ok(Self { bucket, prefix })
    }

    fn full_key(&self, key: &str) -> String {
        join_prefix(&self.prefix, key)
    }

    fn strip_mount(&self, full_key: &str) -> String {
        match full_key.strip_prefix(&self.prefix) {
            Some(stripped) if !self.prefix.is_empty() => stripped.to_string(),
            _ => full_key.to_string(),
        }
    }

    fn head(&self, key: &str) -> Result<s3::serde_types::HeadObjectResult> {
        let full_key = self.full_key(key);
        match self.bucket.head_object(&full_key) {
            Ok((head, code)) if code == 200 => Ok(head),
            Ok((_, 404)) => Err(StorageError::NotFound(key.to_string())),
            Ok((_, code)) => Err(StorageError::Backend(format!(
                "S3 HEAD for {key} returned status {code}"
            ))),
            Err(e) => Err(translate_err(key, e)),
        }
    }
}

fn parse_http_date(value: Option<&str>) -> DateTime<Utc> {
    let Some(value) = value else {
        return DateTime::UNIX_EPOCH;
    };
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

impl BlobBackend for S3Backend {
    fn put(&self, key: &str, data: &[u8], opts: &PutOptions) -> Result<String> {
        let full_key = self.full_key(key);
        let content_type = opts
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        // Custom metadata rides as x-amz-meta-* headers on a bucket clone
        let mut bucket = self.bucket.clone();
        for (name, value) in &opts.metadata {
            bucket.add_header(&format!("x-amz-meta-{name}"), value);
        }

        let response = bucket
            .put_object_with_content_type(&full_key, data, content_type)
            .map_err(|e| translate_err(key, e))?;

        let etag = response
            .headers()
            .get("etag")
            .map(|e| e.trim_matches('"').to_string())
            .unwrap_or_default();
        debug!("Stored blob: {key} ({} bytes)", data.len());
        Ok(etag)
    }

    fn put_stream(&self, key: &str, data: &mut dyn Read, opts: &PutOptions) -> Result<String> {
        // S3 needs the content length up front, so buffer the stream
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer)
            .map_err(|e| StorageError::Backend(format!("Failed to buffer stream for {key}: {e}")))?;
        self.put(key, &buffer, opts)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let full_key = self.full_key(key);
        let response = self
            .bucket
            .get_object(&full_key)
            .map_err(|e| translate_err(key, e))?;
        Ok(response.bytes().to_vec())
    }

    fn get_stream(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let data = self.get(key)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        // S3 DELETE is a no-op for absent keys; probe first so absence surfaces
        self.head(key)?;
        let full_key = self.full_key(key);
        self.bucket
            .delete_object(&full_key)
            .map_err(|e| translate_err(key, e))?;
        debug!("Deleted blob: {key}");
        Ok(())
    }

    fn delete_many(&self, keys: &[String]) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for key in keys {
            match self.delete(key) {
                Ok(()) => {
                    results.insert(key.clone(), true);
                }
                Err(e) => {
                    warn!("Failed to delete {key}: {e}");
                    results.insert(key.clone(), false);
                }
            }
        }
        results
    }

    fn exists(&self, key: &str) -> Result<bool> {
        match self.head(key) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_metadata(&self, key: &str) -> Result<BlobMetadata> {
        let head = self.head(key)?;
        Ok(BlobMetadata {
            key: key.to_string(),
            size: head.content_length.unwrap_or(0).max(0) as u64,
            content_type: head.content_type.clone(),
            last_modified: parse_http_date(head.last_modified.as_deref()),
            etag: head.e_tag.as_ref().map(|e| e.trim_matches('"').to_string()),
            custom_metadata: head.metadata.clone().unwrap_or_default(),
        })
    }

    fn get_size(&self, key: &str) -> Result<u64> {
        let head = self.head(key)?;
        Ok(head.content_length.unwrap_or(0).max(0) as u64)
    }

    fn list(&self, opts: &ListOptions) -> Result<BlobListResult> {
        let full_prefix = match &opts.prefix {
            Some(p) => self.full_key(p),
            None => self.prefix.clone(),
        };

        let (page, _code) = self
            .bucket
            .list_page(
                full_prefix,
                opts.delimiter.clone(),
                opts.marker.clone(),
                None,
                Some(opts.max_results),
            )
            .map_err(|e| translate_err(opts.prefix.as_deref().unwrap_or(""), e))?;

        let blobs = page
            .contents
            .iter()
            .map(|obj| BlobMetadata {
                key: self.strip_mount(&obj.key),
                size: obj.size,
                content_type: None,
                last_modified: DateTime::parse_from_rfc3339(&obj.last_modified)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(DateTime::UNIX_EPOCH),
                etag: obj.e_tag.as_ref().map(|e| e.trim_matches('"').to_string()),
                custom_metadata: HashMap::new(),
            })
            .collect();

        let prefixes = page
            .common_prefixes
            .unwrap_or_default()
            .into_iter()
            .map(|p| self.strip_mount(&p.prefix))
            .collect();

        Ok(BlobListResult {
            blobs,
            prefixes,
            is_truncated: page.is_truncated,
            // Continuation tokens are opaque; passed through untranslated
            next_marker: page.next_continuation_token,
        })
    }

    fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let full_source = self.full_key(source_key);
        let full_dest = self.full_key(dest_key);
        self.bucket
            .copy_object_internal(&full_source, &full_dest)
            .map_err(|e| translate_err(source_key, e))?;
        debug!("Copied blob: {source_key} -> {dest_key}");
        Ok(())
    }

    fn generate_presigned_url(
        &self,
        key: &str,
        expiration: Duration,
        method: PresignMethod,
    ) -> Result<String> {
        let full_key = self.full_key(key);
        let expiry_secs = expiration.as_secs().min(u32::MAX as u64) as u32;
        let url = match method {
            PresignMethod::Get => self.bucket.presign_get(&full_key, expiry_secs, None),
            PresignMethod::Put => self.bucket.presign_put(&full_key, expiry_secs, None),
        }
        .map_err(|e| translate_err(key, e))?;
        Ok(url)
    }
}
