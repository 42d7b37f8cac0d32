//! Backend configuration loading
//! TOML tables of named backend entries, with `${VAR}` expansion applied
//! before inheritance resolution

use figment::providers::{Format, Toml};
use figment::Figment;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, StorageError};

/// Raw (unresolved) configuration for a single named backend.
pub type BackendConfig = serde_json::Map<String, Value>;

/// Environment variable naming the backend configuration file.
pub const CONFIG_PATH_ENV: &str = "JQLAKE_CONFIG";

/// Default configuration file location relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "configs/blob_backends.toml";

/// Resolve the configuration file path from `JQLAKE_CONFIG` or the default.
pub fn default_config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load the named-backend table from a TOML file.
///
/// Every top-level table is one backend entry. String values may reference
/// environment variables as `${VAR}`; unset variables are left verbatim.
pub fn load_backend_config(path: &Path) -> Result<BTreeMap<String, BackendConfig>> {
    let raw: BTreeMap<String, Value> = Figment::new()
        .merge(Toml::file(path))
        .extract()
        .map_err(|e| StorageError::Config(format!("Failed to load {path:?}: {e}")))?;

    let mut configs = BTreeMap::new();
    for (name, value) in raw {
        let mut value = value;
        expand_env_vars(&mut value);
        match value {
            Value::Object(map) => {
                configs.insert(name, map);
            }
            other => {
                return Err(StorageError::Config(format!(
                    "Backend entry '{name}' must be a table, got: {other}"
                )))
            }
        }
    }

    debug!("Loaded {} backend entries from {:?}", configs.len(), path);
    Ok(configs)
}

/// Replace `${VAR}` references in every string value, recursively.
pub fn expand_env_vars(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = expand_str(s);
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_env_vars(item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                expand_env_vars(item);
            }
        }
        _ => {}
    }
}

fn expand_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                match std::env::var(var) {
                    Ok(val) => out.push_str(&val),
                    // Unset variables are left verbatim for the caller to notice
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(var);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expands_known_variables() {
        std::env::set_var("JQLAKE_TEST_VALUE", "expanded");
        let mut value = json!({"a": "${JQLAKE_TEST_VALUE}/suffix", "b": 5});
        expand_env_vars(&mut value);
        assert_eq!(value["a"], "expanded/suffix");
        assert_eq!(value["b"], 5);
    }

    #[test]
    fn leaves_unknown_variables_verbatim() {
        let mut value = json!("${JQLAKE_DEFINITELY_UNSET_VAR}");
        expand_env_vars(&mut value);
        assert_eq!(value, "${JQLAKE_DEFINITELY_UNSET_VAR}");
    }

    #[test]
    fn handles_unterminated_reference() {
        assert_eq!(expand_str("abc${unterminated"), "abc${unterminated");
    }
}
