//! Filesystem implementation of the blob backend
//! Blobs live at `{base_path}/{key}` with a JSON sidecar at `{key}.meta`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{
    BlobBackend, BlobListResult, BlobMetadata, ListOptions, PresignMethod, PutOptions,
};
use crate::error::{Result, StorageError};

/// Reserved suffix for metadata sidecar files; never listed as blobs.
const META_SUFFIX: &str = ".meta";

/// Reserved suffix for in-flight writes; never listed as blobs.
const PART_SUFFIX: &str = ".part";

/// Sidecar metadata document stored next to each blob
#[derive(Debug, Serialize, Deserialize)]
struct SidecarMetadata {
    key: String,
    size: u64,
    content_type: Option<String>,
    last_modified: String,
    #[serde(default)]
    custom_metadata: HashMap<String, String>,
}

/// Blob backend over the local filesystem.
///
/// Each `put` writes to a temp file in the destination directory and
/// renames it into place, so readers observe either the old or the new
/// bytes of a key, never a partial write.
#[derive(Debug)]
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Create a backend rooted at `base_path`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)
            .map_err(|e| StorageError::Backend(format!("Failed to create {base_path:?}: {e}")))?;
        debug!("Initialized filesystem backend at {:?}", base_path);
        Ok(Self { base_path })
    }

    /// Root directory this backend stores blobs under.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("Key must not be empty".into()));
        }
        if key.starts_with('/') {
            return Err(StorageError::InvalidArgument(format!(
                "Key must not start with '/': {key}"
            )));
        }
        if key.split('/').any(|part| part == "..") {
            return Err(StorageError::InvalidArgument(format!(
                "Key must not contain '..': {key}"
            )));
        }
        Ok(())
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.base_path.join(key))
    }

    fn meta_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.blob_path(key)?.into_os_string();
        path.push(META_SUFFIX);
        Ok(PathBuf::from(path))
    }

    fn save_sidecar(
        &self,
        key: &str,
        size: u64,
        content_type: Option<&str>,
        custom_metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let sidecar = SidecarMetadata {
            key: key.to_string(),
            size,
            content_type: Some(
                content_type
                    .unwrap_or("application/octet-stream")
                    .to_string(),
            ),
            last_modified: Utc::now().to_rfc3339(),
            custom_metadata: custom_metadata.clone(),
        };

        let meta_path = self.meta_path(key)?;
        let json = serde_json::to_vec_pretty(&sidecar)?;
        fs::write(&meta_path, json)
            .map_err(|e| StorageError::Backend(format!("Failed to write sidecar for {key}: {e}")))?;
        Ok(())
    }

    fn load_sidecar(&self, key: &str) -> Result<BlobMetadata> {
        let meta_path = self.meta_path(key)?;
        let blob_path = self.blob_path(key)?;

        if !meta_path.exists() {
            // Synthesize from stat when the sidecar is absent
            if !blob_path.exists() {
                return Err(StorageError::NotFound(key.to_string()));
            }
            let stat = fs::metadata(&blob_path)?;
            return Ok(BlobMetadata {
                key: key.to_string(),
                size: stat.len(),
                content_type: Some("application/octet-stream".to_string()),
                last_modified: stat
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
                etag: None,
                custom_metadata: HashMap::new(),
            });
        }

        let raw = fs::read(&meta_path)?;
        match serde_json::from_slice::<SidecarMetadata>(&raw) {
            Ok(sidecar) => Ok(BlobMetadata {
                key: sidecar.key,
                size: sidecar.size,
                content_type: sidecar.content_type,
                last_modified: DateTime::parse_from_rfc3339(&sidecar.last_modified)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                etag: None,
                custom_metadata: sidecar.custom_metadata,
            }),
            Err(e) => {
                warn!("Unreadable sidecar for {key}: {e}");
                if !blob_path.exists() {
                    return Err(StorageError::NotFound(key.to_string()));
                }
                let stat = fs::metadata(&blob_path)?;
                Ok(BlobMetadata {
                    key: key.to_string(),
                    size: stat.len(),
                    content_type: None,
                    last_modified: stat
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                    etag: None,
                    custom_metadata: HashMap::new(),
                })
            }
        }
    }

    /// Stream `data` into a temp file next to the destination, hashing as it
    /// goes, then rename into place. Returns (size, etag).
    fn write_blob(&self, key: &str, data: &mut dyn Read) -> Result<(u64, String)> {
        let blob_path = self.blob_path(key)?;
        let parent = blob_path
            .parent()
            .ok_or_else(|| StorageError::Backend(format!("Key has no parent directory: {key}")))?;
        fs::create_dir_all(parent)
            .map_err(|e| StorageError::Backend(format!("Failed to create {parent:?}: {e}")))?;

        let mut part_path = blob_path.clone().into_os_string();
        part_path.push(PART_SUFFIX);
        let part_path = PathBuf::from(part_path);

        let mut file = File::create(&part_path)
            .map_err(|e| StorageError::Backend(format!("Failed to create temp for {key}: {e}")))?;

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut chunk = [0u8; 8192];
        loop {
            let n = data
                .read(&mut chunk)
                .map_err(|e| StorageError::Backend(format!("Failed to read data for {key}: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&chunk[..n])
                .map_err(|e| StorageError::Backend(format!("Failed to write {key}: {e}")))?;
            hasher.update(&chunk[..n]);
            size += n as u64;
        }
        drop(file);

        fs::rename(&part_path, &blob_path)
            .map_err(|e| StorageError::Backend(format!("Failed to finalize {key}: {e}")))?;

        let digest = hasher.finalize();
        let etag = format!("{digest:x}");
        Ok((size, etag[..32].to_string()))
    }

    fn cleanup_empty_dirs(&self, mut path: PathBuf) {
        // Best effort; errors are swallowed
        while path != self.base_path {
            match fs::read_dir(&path) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                    if fs::remove_dir(&path).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
            match path.parent() {
                Some(parent) => path = parent.to_path_buf(),
                None => break,
            }
        }
    }

    fn is_reserved(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "meta" || e == "part")
            .unwrap_or(false)
    }

    fn relative_key(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.base_path).ok()?;
        let parts: Vec<&str> = rel.iter().filter_map(|c| c.to_str()).collect();
        Some(parts.join("/"))
    }

    fn collect_files(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_files(&path, out)?;
            } else if !Self::is_reserved(&path) {
                out.push(path);
            }
        }
        Ok(())
    }

    fn stat_metadata(&self, key: String, path: &Path) -> Result<BlobMetadata> {
        let stat = fs::metadata(path)?;
        Ok(BlobMetadata {
            key,
            size: stat.len(),
            content_type: None,
            last_modified: stat
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            etag: None,
            custom_metadata: HashMap::new(),
        })
    }
}

impl BlobBackend for FilesystemBackend {
    fn put(&self, key: &str, data: &[u8], opts: &PutOptions) -> Result<String> {
        let mut cursor = data;
        self.put_stream(key, &mut cursor, opts)
    }

    fn put_stream(&self, key: &str, data: &mut dyn Read, opts: &PutOptions) -> Result<String> {
        let (size, etag) = self.write_blob(key, data)?;
        self.save_sidecar(key, size, opts.content_type.as_deref(), &opts.metadata)?;
        debug!("Stored blob: {key} ({size} bytes)");
        Ok(etag)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let blob_path = self.blob_path(key)?;
        if !blob_path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        fs::read(&blob_path)
            .map_err(|e| StorageError::Backend(format!("Failed to read blob {key}: {e}")))
    }

    fn get_stream(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let blob_path = self.blob_path(key)?;
        if !blob_path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let file = File::open(&blob_path)
            .map_err(|e| StorageError::Backend(format!("Failed to open blob {key}: {e}")))?;
        Ok(Box::new(file))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let blob_path = self.blob_path(key)?;
        let meta_path = self.meta_path(key)?;

        if !blob_path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        fs::remove_file(&blob_path)
            .map_err(|e| StorageError::Backend(format!("Failed to delete blob {key}: {e}")))?;
        if meta_path.exists() {
            let _ = fs::remove_file(&meta_path);
        }

        if let Some(parent) = blob_path.parent() {
            self.cleanup_empty_dirs(parent.to_path_buf());
        }

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
        Ok(self.blob_path(key)?.exists())
    }

    fn get_metadata(&self, key: &str) -> Result<BlobMetadata> {
        let blob_path = self.blob_path(key)?;
        if !blob_path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        self.load_sidecar(key)
    }

    fn get_size(&self, key: &str) -> Result<u64> {
        let blob_path = self.blob_path(key)?;
        if !blob_path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let stat = fs::metadata(&blob_path)?;
        Ok(stat.len())
    }

    fn list(&self, opts: &ListOptions) -> Result<BlobListResult> {
        let prefix = opts.prefix.as_deref().unwrap_or("");
        let search_path = if prefix.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(prefix.trim_end_matches('/'))
        };

        if !search_path.exists() {
            return Ok(BlobListResult::default());
        }

        let mut files: Vec<PathBuf> = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();

        if opts.delimiter.is_some() {
            // One level deep: files become blobs, directories become prefixes
            for entry in fs::read_dir(&search_path)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    if let Some(rel) = self.relative_key(&path) {
                        prefixes.push(format!("{rel}/"));
                    }
                } else if !Self::is_reserved(&path) {
                    files.push(path);
                }
            }
        } else {
            self.collect_files(&search_path, &mut files)?;
        }

        let mut keys: Vec<(String, PathBuf)> = files
            .into_iter()
            .filter_map(|p| self.relative_key(&p).map(|k| (k, p)))
            .collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        prefixes.sort();

        // Keys at or before the marker have already been returned
        if let Some(marker) = &opts.marker {
            keys.retain(|(k, _)| k.as_str() > marker.as_str());
        }

        let is_truncated = keys.len() > opts.max_results;
        keys.truncate(opts.max_results);

        let mut blobs = Vec::with_capacity(keys.len());
        for (key, path) in keys {
            blobs.push(self.stat_metadata(key, &path)?);
        }

        let next_marker = if is_truncated {
            blobs.last().map(|b| b.key.clone())
        } else {
            None
        };

        Ok(BlobListResult {
            blobs,
            prefixes,
            is_truncated,
            next_marker,
        })
    }

    fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let source_path = self.blob_path(source_key)?;
        if !source_path.exists() {
            return Err(StorageError::NotFound(source_key.to_string()));
        }

        let dest_path = self.blob_path(dest_key)?;
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::Backend(format!("Failed to create {parent:?}: {e}")))?;
        }
        fs::copy(&source_path, &dest_path).map_err(|e| {
            StorageError::Backend(format!("Failed to copy {source_key} -> {dest_key}: {e}"))
        })?;

        // Carry the sidecar over with the destination key and a fresh timestamp
        let source_meta = self.meta_path(source_key)?;
        if source_meta.exists() {
            let raw = fs::read(&source_meta)?;
            if let Ok(mut sidecar) = serde_json::from_slice::<SidecarMetadata>(&raw) {
                sidecar.key = dest_key.to_string();
                sidecar.last_modified = Utc::now().to_rfc3339();
                let dest_meta = self.meta_path(dest_key)?;
                fs::write(&dest_meta, serde_json::to_vec_pretty(&sidecar)?)?;
            }
        }

        debug!("Copied blob: {source_key} -> {dest_key}");
        Ok(())
    }

    fn generate_presigned_url(
        &self,
        key: &str,
        _expiration: Duration,
        _method: PresignMethod,
    ) -> Result<String> {
        // file:// URL for API uniformity; no signing on a local filesystem
        let blob_path = self.blob_path(key)?;
        if !blob_path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let absolute = blob_path
            .canonicalize()
            .map_err(|e| StorageError::Backend(format!("Failed to resolve path for {key}: {e}")))?;
        Ok(format!("file://{}", absolute.display()))
    }
}
