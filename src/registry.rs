//! Named backend registry with configuration inheritance
//! Resolves dotted names like "demo.bronze" to prefix-wrapped backends

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::backend::{BlobBackend, FilesystemBackend, PrefixedBackend, S3Backend};
use crate::config::{self, BackendConfig};
use crate::error::{Result, StorageError};

/// Key marking a config entry as inheriting from another entry.
pub const INHERITS_KEY: &str = "__inherits__";

/// Resolve inheritance relationships in a raw configuration table.
///
/// Entries may name a parent via `__inherits__`; the resolved entry is the
/// parent's resolved fields overridden by the child's own, with the marker
/// dropped. Cycles and missing parents are configuration errors.
pub fn resolve_inheritance(
    configs: &BTreeMap<String, BackendConfig>,
) -> Result<BTreeMap<String, BackendConfig>> {
    let mut resolved: BTreeMap<String, BackendConfig> = BTreeMap::new();

    fn resolve_single(
        name: &str,
        configs: &BTreeMap<String, BackendConfig>,
        resolved: &mut BTreeMap<String, BackendConfig>,
        visited: &mut HashSet<String>,
    ) -> Result<BackendConfig> {
        if visited.contains(name) {
            let mut chain: Vec<&str> = visited.iter().map(|s| s.as_str()).collect();
            chain.sort();
            return Err(StorageError::Config(format!(
                "Circular inheritance detected at '{name}' (involving: {})",
                chain.join(", ")
            )));
        }
        if let Some(existing) = resolved.get(name) {
            return Ok(existing.clone());
        }

        let config = configs.get(name).ok_or_else(|| {
            StorageError::Config(format!("Configuration entry '{name}' not found"))
        })?;

        let entry = match config.get(INHERITS_KEY) {
            None => config.clone(),
            Some(parent_value) => {
                let parent_name = parent_value.as_str().ok_or_else(|| {
                    StorageError::Config(format!(
                        "'{name}': {INHERITS_KEY} must be a string, got: {parent_value}"
                    ))
                })?;
                if !configs.contains_key(parent_name) {
                    return Err(StorageError::Config(format!(
                        "Configuration '{name}' inherits from '{parent_name}', \
                         but '{parent_name}' not found"
                    )));
                }

                visited.insert(name.to_string());
                let parent = resolve_single(parent_name, configs, resolved, visited)?;
                visited.remove(name);

                // Start from the parent's resolved fields; child keys override
                let mut merged = parent;
                for (key, value) in config {
                    if key != INHERITS_KEY {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                merged
            }
        };

        resolved.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    for name in configs.keys() {
        if !resolved.contains_key(name) {
            let mut visited = HashSet::new();
            resolve_single(name, configs, &mut resolved, &mut visited)?;
        }
    }

    Ok(resolved)
}

fn required_str<'a>(config: &'a BackendConfig, field: &str) -> Option<&'a str> {
    config.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Registry for named blob storage backends.
///
/// Names use dot notation for hierarchical namespacing: `"dev"` is the base
/// backend, `"dev.images.thumbnails"` is the same backend wrapped under the
/// `images/thumbnails/` prefix. Instances are cached per full name.
#[derive(Debug)]
pub struct BackendRegistry {
    config: BTreeMap<String, BackendConfig>,
    cache: Mutex<HashMap<String, Arc<dyn BlobBackend>>>,
}

impl BackendRegistry {
    /// Create a registry from a raw configuration table, resolving
    /// inheritance up front.
    pub fn new(configuration: BTreeMap<String, BackendConfig>) -> Result<Self> {
        let config = resolve_inheritance(&configuration)?;
        Ok(Self {
            config,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Create a registry from a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::new(config::load_backend_config(path)?)
    }

    /// Create a registry from `JQLAKE_CONFIG` (or the default config path).
    pub fn from_env() -> Result<Self> {
        Self::from_file(&config::default_config_path())
    }

    /// Split a backend name into `(base, prefix)`, where the prefix uses
    /// `/` separators: `"dev.images.thumb"` -> `("dev", "images/thumb")`.
    pub fn parse_name(name: &str) -> (&str, String) {
        match name.split_once('.') {
            Some((base, rest)) => (base, rest.replace('.', "/")),
            None => (name, String::new()),
        }
    }

    /// Instantiate a backend from a resolved configuration entry.
    pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn BlobBackend>> {
        let backend_type = required_str(config, "type").ok_or_else(|| {
            StorageError::Config("Backend configuration must specify 'type'".to_string())
        })?;

        match backend_type {
            "filesystem" => {
                let base_path = required_str(config, "base_path").ok_or_else(|| {
                    StorageError::Config("Filesystem backend requires 'base_path'".to_string())
                })?;
                Ok(Arc::new(FilesystemBackend::new(base_path)?))
            }
            "s3" | "minio" => {
                let required = ["endpoint", "access_key", "secret_key", "bucket"];
                let missing: Vec<&str> = required
                    .iter()
                    .filter(|f| required_str(config, f).is_none())
                    .copied()
                    .collect();
                if !missing.is_empty() {
                    return Err(StorageError::Config(format!(
                        "S3 backend missing required fields: {}",
                        missing.join(", ")
                    )));
                }

                let secure = config.get("secure").and_then(Value::as_bool).unwrap_or(true);
                Ok(Arc::new(S3Backend::new(
                    required_str(config, "endpoint").unwrap_or_default(),
                    required_str(config, "access_key").unwrap_or_default(),
                    required_str(config, "secret_key").unwrap_or_default(),
                    required_str(config, "bucket").unwrap_or_default(),
                    secure,
                    required_str(config, "region"),
                    required_str(config, "prefix"),
                )?))
            }
            other => Err(StorageError::Config(format!("Unknown backend type: {other}"))),
        }
    }

    /// Get a backend instance by name, creating and caching it on first use.
    pub fn get_backend(&self, name: &str) -> Result<Arc<dyn BlobBackend>> {
        let mut cache = self.cache.lock().expect("backend cache poisoned");

        if let Some(backend) = cache.get(name) {
            return Ok(backend.clone());
        }

        let (base_name, prefix) = Self::parse_name(name);

        let Some(base_config) = self.config.get(base_name) else {
            let available = self
                .config
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StorageError::BackendNotFound {
                name: base_name.to_string(),
                available: if available.is_empty() {
                    "none".to_string()
                } else {
                    available
                },
            });
        };

        let base_backend = match cache.get(base_name) {
            Some(backend) => backend.clone(),
            None => {
                let backend = Self::create_backend(base_config)?;
                cache.insert(base_name.to_string(), backend.clone());
                backend
            }
        };

        let backend: Arc<dyn BlobBackend> = if prefix.is_empty() {
            base_backend
        } else {
            Arc::new(PrefixedBackend::new(base_backend, &prefix))
        };

        cache.insert(name.to_string(), backend.clone());
        info!(
            "Created backend for '{name}' (base: {base_name}, prefix: {})",
            if prefix.is_empty() { "none" } else { &prefix }
        );
        Ok(backend)
    }

    /// List all configured backend names.
    pub fn list_backends(&self) -> Vec<String> {
        self.config.keys().cloned().collect()
    }

    /// Register a new backend configuration, resolving any `__inherits__`
    /// marker against the already-resolved table. Cached instances whose
    /// name starts with `name` are invalidated.
    pub fn register(&mut self, name: &str, config: BackendConfig) -> Result<()> {
        let entry = if !config.contains_key(INHERITS_KEY) {
            config
        } else {
            let parent_name = config
                .get(INHERITS_KEY)
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    StorageError::Config(format!("'{name}': {INHERITS_KEY} must be a string"))
                })?
                .to_string();
            let parent = self.config.get(&parent_name).ok_or_else(|| {
                StorageError::Config(format!(
                    "Configuration '{name}' inherits from '{parent_name}', \
                     but '{parent_name}' not found"
                ))
            })?;
            let mut merged = parent.clone();
            for (key, value) in &config {
                if key != INHERITS_KEY {
                    merged.insert(key.clone(), value.clone());
                }
            }
            merged
        };

        self.config.insert(name.to_string(), entry);

        let mut cache = self.cache.lock().expect("backend cache poisoned");
        cache.retain(|cached, _| !cached.starts_with(name));
        debug!("Registered backend configuration '{name}'");
        Ok(())
    }

    /// Drop all cached backend instances.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("backend cache poisoned").clear();
    }
}
