//! Blob backend and facade behavior over the filesystem implementation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jqlake::{
    BlobBackend, BlobStorage, FilesystemBackend, ListOptions, PresignMethod, PrefixedBackend,
    PutOptions, StorageError,
};
use tempfile::TempDir;

fn backend() -> (TempDir, Arc<FilesystemBackend>) {
    let dir = tempfile::tempdir().unwrap();
    let backend = FilesystemBackend::new(dir.path()).unwrap();
    (dir, Arc::new(backend))
}

#[test]
fn put_get_round_trip() {
    let (_dir, backend) = backend();

    backend.put("a/b/c.txt", b"hello", &PutOptions::default()).unwrap();
    assert_eq!(backend.get("a/b/c.txt").unwrap(), b"hello");
}

#[test]
fn empty_blobs_round_trip() {
    let (_dir, backend) = backend();

    backend.put("empty.bin", b"", &PutOptions::default()).unwrap();
    assert_eq!(backend.get("empty.bin").unwrap(), Vec::<u8>::new());
    assert_eq!(backend.get_size("empty.bin").unwrap(), 0);
}

#[test]
fn keys_with_spaces_and_dots_round_trip() {
    let (_dir, backend) = backend();

    let key = "dir with spaces/file.name.with.dots.txt";
    backend.put(key, b"data", &PutOptions::default()).unwrap();
    assert_eq!(backend.get(key).unwrap(), b"data");
    assert!(backend.exists(key).unwrap());
}

#[test]
fn exists_and_not_found_duality() {
    let (_dir, backend) = backend();

    assert!(!backend.exists("k").unwrap());
    backend.put("k", b"v", &PutOptions::default()).unwrap();
    assert!(backend.exists("k").unwrap());

    backend.delete("k").unwrap();
    assert!(!backend.exists("k").unwrap());
    assert!(matches!(backend.get("k").unwrap_err(), StorageError::NotFound(_)));
    assert!(matches!(backend.delete("k").unwrap_err(), StorageError::NotFound(_)));
    assert!(matches!(
        backend.get_metadata("k").unwrap_err(),
        StorageError::NotFound(_)
    ));
    assert!(matches!(
        backend.get_size("k").unwrap_err(),
        StorageError::NotFound(_)
    ));
}

#[test]
fn put_overwrites_silently() {
    let (_dir, backend) = backend();

    backend.put("k", b"first", &PutOptions::default()).unwrap();
    backend.put("k", b"second", &PutOptions::default()).unwrap();
    assert_eq!(backend.get("k").unwrap(), b"second");
}

#[test]
fn metadata_is_persisted_in_sidecar() {
    let (dir, backend) = backend();

    let mut metadata = HashMap::new();
    metadata.insert("source".to_string(), "test".to_string());
    let opts = PutOptions {
        content_type: Some("text/plain".to_string()),
        metadata,
    };
    backend.put("docs/readme.txt", b"content", &opts).unwrap();

    assert!(dir.path().join("docs/readme.txt.meta").exists());

    let meta = backend.get_metadata("docs/readme.txt").unwrap();
    assert_eq!(meta.key, "docs/readme.txt");
    assert_eq!(meta.size, 7);
    assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
    assert_eq!(meta.custom_metadata.get("source").map(String::as_str), Some("test"));
}

#[test]
fn metadata_synthesized_without_sidecar() {
    let (dir, backend) = backend();

    // A blob dropped in out-of-band has no sidecar
    std::fs::create_dir_all(dir.path().join("raw")).unwrap();
    std::fs::write(dir.path().join("raw/blob.bin"), b"xyz").unwrap();

    let meta = backend.get_metadata("raw/blob.bin").unwrap();
    assert_eq!(meta.size, 3);
    assert_eq!(meta.key, "raw/blob.bin");
}

#[test]
fn meta_sidecars_never_listed() {
    let (_dir, backend) = backend();

    backend.put("x/data.parquet", b"d", &PutOptions::default()).unwrap();
    let result = backend.list(&ListOptions::default()).unwrap();
    let keys: Vec<&str> = result.blobs.iter().map(|b| b.key.as_str()).collect();
    assert_eq!(keys, vec!["x/data.parquet"]);
}

#[test]
fn list_recursive_and_delimited() {
    let (_dir, backend) = backend();

    backend.put("a/1.txt", b"1", &PutOptions::default()).unwrap();
    backend.put("a/b/2.txt", b"2", &PutOptions::default()).unwrap();
    backend.put("top.txt", b"t", &PutOptions::default()).unwrap();

    let recursive = backend.list(&ListOptions::default()).unwrap();
    let keys: Vec<&str> = recursive.blobs.iter().map(|b| b.key.as_str()).collect();
    assert_eq!(keys, vec!["a/1.txt", "a/b/2.txt", "top.txt"]);

    let delimited = backend
        .list(&ListOptions {
            delimiter: Some("/".to_string()),
            ..ListOptions::default()
        })
        .unwrap();
    let keys: Vec<&str> = delimited.blobs.iter().map(|b| b.key.as_str()).collect();
    assert_eq!(keys, vec!["top.txt"]);
    assert_eq!(delimited.prefixes, vec!["a/"]);
}

#[test]
fn list_missing_prefix_is_empty() {
    let (_dir, backend) = backend();

    let result = backend.list(&ListOptions::with_prefix("nope/")).unwrap();
    assert!(result.blobs.is_empty());
    assert!(result.prefixes.is_empty());
    assert!(!result.is_truncated);
}

#[test]
fn list_paginates_with_markers() {
    let (_dir, backend) = backend();

    for i in 0..5 {
        backend
            .put(&format!("page/{i}.txt"), b"x", &PutOptions::default())
            .unwrap();
    }

    let mut collected = Vec::new();
    let mut marker = None;
    loop {
        let result = backend
            .list(&ListOptions {
                prefix: Some("page/".to_string()),
                max_results: 2,
                marker: marker.take(),
                ..ListOptions::default()
            })
            .unwrap();
        collected.extend(result.blobs.iter().map(|b| b.key.clone()));
        if !result.is_truncated {
            break;
        }
        marker = result.next_marker;
    }

    assert_eq!(
        collected,
        vec![
            "page/0.txt",
            "page/1.txt",
            "page/2.txt",
            "page/3.txt",
            "page/4.txt"
        ]
    );
}

#[test]
fn delete_cleans_up_empty_parents() {
    let (dir, backend) = backend();

    backend.put("deep/nested/dir/file.txt", b"x", &PutOptions::default()).unwrap();
    backend.delete("deep/nested/dir/file.txt").unwrap();

    assert!(!dir.path().join("deep").exists());
    assert!(dir.path().exists());
}

#[test]
fn delete_many_reports_per_key_outcome() {
    let (_dir, backend) = backend();

    backend.put("ok.txt", b"x", &PutOptions::default()).unwrap();
    let results = backend.delete_many(&["ok.txt".to_string(), "missing.txt".to_string()]);

    assert_eq!(results.get("ok.txt"), Some(&true));
    assert_eq!(results.get("missing.txt"), Some(&false));
}

#[test]
fn copy_duplicates_blob_and_metadata() {
    let (_dir, backend) = backend();

    let opts = PutOptions::with_content_type("application/parquet");
    backend.put("src.bin", b"payload", &opts).unwrap();
    backend.copy("src.bin", "dst/copy.bin").unwrap();

    assert_eq!(backend.get("dst/copy.bin").unwrap(), b"payload");
    let meta = backend.get_metadata("dst/copy.bin").unwrap();
    assert_eq!(meta.key, "dst/copy.bin");
    assert_eq!(meta.content_type.as_deref(), Some("application/parquet"));

    assert!(matches!(
        backend.copy("nope.bin", "x.bin").unwrap_err(),
        StorageError::NotFound(_)
    ));
}

#[test]
fn presigned_url_is_file_scheme() {
    let (_dir, backend) = backend();

    backend.put("signed.txt", b"x", &PutOptions::default()).unwrap();
    let url = backend
        .generate_presigned_url("signed.txt", Duration::from_secs(3600), PresignMethod::Get)
        .unwrap();
    assert!(url.starts_with("file://"));
    assert!(url.ends_with("signed.txt"));

    assert!(matches!(
        backend
            .generate_presigned_url("missing.txt", Duration::from_secs(60), PresignMethod::Get)
            .unwrap_err(),
        StorageError::NotFound(_)
    ));
}

// Prefix decorator ----------------------------------------------------------

#[test]
fn prefix_transparency() {
    let (_dir, backend) = backend();
    let wrapped = PrefixedBackend::new(backend.clone(), "prefix");

    backend.put("prefix/k.txt", b"direct", &PutOptions::default()).unwrap();
    assert_eq!(wrapped.get("k.txt").unwrap(), b"direct");

    wrapped.put("other.txt", b"via wrapper", &PutOptions::default()).unwrap();
    assert_eq!(backend.get("prefix/other.txt").unwrap(), b"via wrapper");
}

#[test]
fn empty_prefix_behaves_like_delegate() {
    let (_dir, backend) = backend();
    let wrapped = PrefixedBackend::new(backend.clone(), "");

    wrapped.put("k.txt", b"x", &PutOptions::default()).unwrap();
    assert_eq!(backend.get("k.txt").unwrap(), b"x");

    let wrapper_list = wrapped.list(&ListOptions::default()).unwrap();
    let delegate_list = backend.list(&ListOptions::default()).unwrap();
    assert_eq!(
        wrapper_list.blobs.iter().map(|b| &b.key).collect::<Vec<_>>(),
        delegate_list.blobs.iter().map(|b| &b.key).collect::<Vec<_>>()
    );
}

#[test]
fn prefixed_listing_strips_namespace() {
    let (_dir, backend) = backend();

    backend.put("prefix/path/docs/a.txt", b"1", &PutOptions::default()).unwrap();
    backend.put("prefix/path/docs/b.txt", b"2", &PutOptions::default()).unwrap();
    backend.put("other/c.txt", b"3", &PutOptions::default()).unwrap();

    let wrapped = PrefixedBackend::new(backend, "prefix/path");
    let result = wrapped.list(&ListOptions::default()).unwrap();
    let mut keys: Vec<&str> = result.blobs.iter().map(|b| b.key.as_str()).collect();
    keys.sort();
    assert_eq!(keys, vec!["docs/a.txt", "docs/b.txt"]);
    assert!(keys.iter().all(|k| !k.starts_with("prefix")));
}

#[test]
fn prefixed_listing_with_additional_prefix() {
    let (_dir, backend) = backend();

    backend.put("ns/docs/a.txt", b"1", &PutOptions::default()).unwrap();
    backend.put("ns/images/b.png", b"2", &PutOptions::default()).unwrap();

    let wrapped = PrefixedBackend::new(backend, "ns");
    let result = wrapped.list(&ListOptions::with_prefix("docs/")).unwrap();
    let keys: Vec<&str> = result.blobs.iter().map(|b| b.key.as_str()).collect();
    assert_eq!(keys, vec!["docs/a.txt"]);
}

#[test]
fn prefixed_metadata_and_delete_many_strip_keys() {
    let (_dir, backend) = backend();
    let wrapped = PrefixedBackend::new(backend, "ns");

    wrapped.put("f1.txt", b"1", &PutOptions::default()).unwrap();
    wrapped.put("f2.txt", b"2", &PutOptions::default()).unwrap();

    let meta = wrapped.get_metadata("f1.txt").unwrap();
    assert_eq!(meta.key, "f1.txt");

    let results = wrapped.delete_many(&["f1.txt".to_string(), "f2.txt".to_string()]);
    assert_eq!(results.get("f1.txt"), Some(&true));
    assert_eq!(results.get("f2.txt"), Some(&true));
}

#[test]
fn prefixed_pagination_translates_markers() {
    let (_dir, backend) = backend();
    let wrapped = PrefixedBackend::new(backend, "deep/ns");

    for i in 0..4 {
        wrapped
            .put(&format!("{i}.txt"), b"x", &PutOptions::default())
            .unwrap();
    }

    let first = wrapped
        .list(&ListOptions {
            max_results: 2,
            ..ListOptions::default()
        })
        .unwrap();
    assert!(first.is_truncated);
    let marker = first.next_marker.clone().unwrap();
    assert!(!marker.starts_with("deep/ns"));

    let second = wrapped
        .list(&ListOptions {
            max_results: 10,
            marker: Some(marker),
            ..ListOptions::default()
        })
        .unwrap();
    let keys: Vec<&str> = second.blobs.iter().map(|b| b.key.as_str()).collect();
    assert_eq!(keys, vec!["2.txt", "3.txt"]);
}

// Facade --------------------------------------------------------------------

#[test]
fn facade_file_round_trip() {
    let (_dir, backend) = backend();
    let storage = BlobStorage::new(backend);

    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("upload.bin");
    std::fs::write(&src, b"file body").unwrap();

    storage
        .put_file("uploads/upload.bin", &src, &PutOptions::default())
        .unwrap();
    assert_eq!(storage.get("uploads/upload.bin").unwrap(), b"file body");

    let dst = src_dir.path().join("download.bin");
    storage.download_to_file("uploads/upload.bin", &dst).unwrap();
    assert_eq!(std::fs::read(&dst).unwrap(), b"file body");
}

#[test]
fn facade_list_follows_pagination() {
    let (_dir, backend) = backend();
    let storage = BlobStorage::new(backend);

    for i in 0..7 {
        storage
            .put(&format!("many/{i}.txt"), b"x", &PutOptions::default())
            .unwrap();
    }

    let blobs = storage.list(Some("many/")).unwrap();
    assert_eq!(blobs.len(), 7);
}

#[test]
fn facade_lists_prefixes() {
    let (_dir, backend) = backend();
    let storage = BlobStorage::new(backend);

    storage.put("a/1.txt", b"x", &PutOptions::default()).unwrap();
    storage.put("b/2.txt", b"x", &PutOptions::default()).unwrap();

    let mut prefixes = storage.list_prefixes(None).unwrap();
    prefixes.sort();
    assert_eq!(prefixes, vec!["a/", "b/"]);
}
