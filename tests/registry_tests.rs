//! Registry resolution, inheritance, caching, and config loading

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use jqlake::registry::{resolve_inheritance, INHERITS_KEY};
use jqlake::{BackendRegistry, BlobStorage, PutOptions, StorageError};
use tempfile::TempDir;

type ConfigTable = BTreeMap<String, serde_json::Map<String, serde_json::Value>>;

fn fs_config(dir: &TempDir) -> ConfigTable {
    let mut configs = BTreeMap::new();
    configs.insert(
        "dev".to_string(),
        json!({
            "type": "filesystem",
            "base_path": dir.path().join("dev").to_string_lossy(),
        })
        .as_object()
        .unwrap()
        .clone(),
    );
    configs
}

#[test]
fn inheritance_merges_parent_fields() {
    let mut configs: ConfigTable = BTreeMap::new();
    configs.insert(
        "parent".to_string(),
        json!({"type": "s3", "endpoint": "e", "bucket": "b", "opt1": "v1", "opt2": "v2"})
            .as_object()
            .unwrap()
            .clone(),
    );
    configs.insert(
        "child".to_string(),
        json!({"__inherits__": "parent", "opt2": "over"})
            .as_object()
            .unwrap()
            .clone(),
    );

    let resolved = resolve_inheritance(&configs).unwrap();
    let child = &resolved["child"];
    assert_eq!(child["type"], "s3");
    assert_eq!(child["endpoint"], "e");
    assert_eq!(child["bucket"], "b");
    assert_eq!(child["opt1"], "v1");
    assert_eq!(child["opt2"], "over");
    assert!(!child.contains_key(INHERITS_KEY));

    // Parent is untouched
    assert_eq!(resolved["parent"]["opt2"], "v2");
}

#[test]
fn inheritance_chains_resolve_transitively() {
    let mut configs: ConfigTable = BTreeMap::new();
    configs.insert(
        "base".to_string(),
        json!({"type": "filesystem", "base_path": "/tmp/x", "extra": "base"})
            .as_object()
            .unwrap()
            .clone(),
    );
    configs.insert(
        "mid".to_string(),
        json!({"__inherits__": "base", "extra": "mid"})
            .as_object()
            .unwrap()
            .clone(),
    );
    configs.insert(
        "leaf".to_string(),
        json!({"__inherits__": "mid"}).as_object().unwrap().clone(),
    );

    let resolved = resolve_inheritance(&configs).unwrap();
    assert_eq!(resolved["leaf"]["extra"], "mid");
    assert_eq!(resolved["leaf"]["type"], "filesystem");
}

#[test]
fn registry_rejects_cycles_at_construction() {
    let mut configs: ConfigTable = BTreeMap::new();
    configs.insert(
        "a".to_string(),
        json!({"__inherits__": "b"}).as_object().unwrap().clone(),
    );
    configs.insert(
        "b".to_string(),
        json!({"__inherits__": "a"}).as_object().unwrap().clone(),
    );

    let err = BackendRegistry::new(configs).unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));
}

#[test]
fn unknown_backend_lists_available_names() {
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::new(fs_config(&dir)).unwrap();

    let err = registry.get_backend("prod").unwrap_err();
    match err {
        StorageError::BackendNotFound { name, available } => {
            assert_eq!(name, "prod");
            assert!(available.contains("dev"));
        }
        other => panic!("Expected BackendNotFound, got: {other}"),
    }
}

#[test]
fn dotted_names_wrap_with_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::new(fs_config(&dir)).unwrap();

    let namespaced = registry.get_backend("dev.images.thumbnails").unwrap();
    namespaced.put("pic.png", b"img", &PutOptions::default()).unwrap();

    let base = registry.get_backend("dev").unwrap();
    assert_eq!(base.get("images/thumbnails/pic.png").unwrap(), b"img");
}

#[test]
fn instances_are_cached_per_name() {
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::new(fs_config(&dir)).unwrap();

    let first = registry.get_backend("dev").unwrap();
    let second = registry.get_backend("dev").unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    registry.clear_cache();
    let third = registry.get_backend("dev").unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
}

#[test]
fn register_adds_and_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new(fs_config(&dir)).unwrap();

    let stale = registry.get_backend("dev").unwrap();

    registry
        .register(
            "dev",
            json!({
                "type": "filesystem",
                "base_path": dir.path().join("dev2").to_string_lossy(),
            })
            .as_object()
            .unwrap()
            .clone(),
        )
        .unwrap();

    let fresh = registry.get_backend("dev").unwrap();
    assert!(!Arc::ptr_eq(&stale, &fresh));

    fresh.put("probe.txt", b"x", &PutOptions::default()).unwrap();
    assert!(dir.path().join("dev2/probe.txt").exists());
}

#[test]
fn register_resolves_inheritance_against_existing_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new(fs_config(&dir)).unwrap();

    registry
        .register(
            "scratch",
            json!({"__inherits__": "dev"}).as_object().unwrap().clone(),
        )
        .unwrap();

    // Inherited base_path resolves to the same directory as "dev"
    let scratch = registry.get_backend("scratch").unwrap();
    scratch.put("s.txt", b"x", &PutOptions::default()).unwrap();
    let dev = registry.get_backend("dev").unwrap();
    assert_eq!(dev.get("s.txt").unwrap(), b"x");

    let err = registry
        .register(
            "broken",
            json!({"__inherits__": "ghost"}).as_object().unwrap().clone(),
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));
}

#[test]
fn list_backends_returns_configured_names() {
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::new(fs_config(&dir)).unwrap();
    assert_eq!(registry.list_backends(), vec!["dev".to_string()]);
}

#[test]
fn config_file_loads_with_env_expansion() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("JQLAKE_TEST_BASE", dir.path().to_string_lossy().to_string());

    let config_path = dir.path().join("backends.toml");
    std::fs::write(
        &config_path,
        r#"
[local]
type = "filesystem"
base_path = "${JQLAKE_TEST_BASE}/blobs"

[scratch]
__inherits__ = "local"
"#,
    )
    .unwrap();

    let registry = BackendRegistry::from_file(&config_path).unwrap();
    let storage = BlobStorage::from_name(&registry, "local").unwrap();
    storage.put("conf.txt", b"ok", &PutOptions::default()).unwrap();

    assert!(dir.path().join("blobs/conf.txt").exists());

    // The inheriting entry points at the same base path
    let scratch = BlobStorage::from_name(&registry, "scratch").unwrap();
    assert_eq!(scratch.get("conf.txt").unwrap(), b"ok");
}

#[test]
fn create_backend_validates_type_and_fields() {
    let err = BackendRegistry::create_backend(
        json!({"base_path": "/tmp/x"}).as_object().unwrap(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("type"));

    let err = BackendRegistry::create_backend(json!({"type": "filesystem"}).as_object().unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("base_path"));
}
