//! Filesystem-level checks against the real `LocalFileStorage` backend, as opposed to the
//! in-process `FakeStorage` double used by the unit tests in `src/lib.rs`.

use std::num::NonZeroUsize;
use std::sync::Arc;

use assert_fs::prelude::*;
use rr_cache::ArtifactCache;
use rr_storage::LocalFileStorage;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn fetched_object_lands_in_the_backing_directory() {
    let upstream = assert_fs::TempDir::new().unwrap();
    upstream.child("pkg-1.0.0.whl").write_str("wheel-bytes").unwrap();

    let backing = assert_fs::TempDir::new().unwrap();
    let storage = Arc::new(LocalFileStorage::new(upstream.path()));
    let cache = ArtifactCache::new(storage, Some(backing.path().to_path_buf()), NonZeroUsize::new(8).unwrap());

    let output = assert_fs::TempDir::new().unwrap();
    let output_path = output.child("pkg-1.0.0.whl");
    cache
        .fetch("pkg-1.0.0.whl", false, output_path.path(), None, &CancellationToken::new())
        .await
        .unwrap();

    output_path.assert(predicates::path::is_file());
    backing.child(".partial/pkg-1.0.0.whl").assert(predicates::path::missing());
}

#[tokio::test]
async fn fetch_with_max_bytes_truncates_both_the_output_and_the_cached_copy() {
    let upstream = assert_fs::TempDir::new().unwrap();
    upstream.child("pkg-1.0.0.whl").write_str("0123456789").unwrap();

    let backing = assert_fs::TempDir::new().unwrap();
    let storage = Arc::new(LocalFileStorage::new(upstream.path()));
    let cache = ArtifactCache::new(storage, Some(backing.path().to_path_buf()), NonZeroUsize::new(8).unwrap());

    let output = assert_fs::TempDir::new().unwrap();
    let output_path = output.child("pkg-1.0.0.whl");
    let (size, warnings) = cache
        .fetch("pkg-1.0.0.whl", false, output_path.path(), Some(4), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(size, 4);
    assert!(warnings.is_empty());
    output_path.assert("0123");
}

#[tokio::test]
async fn clear_object_store_leaves_no_cached_files_behind() {
    let upstream = assert_fs::TempDir::new().unwrap();
    upstream.child("pkg.whl").write_str("bytes").unwrap();

    let backing = assert_fs::TempDir::new().unwrap();
    let storage = Arc::new(LocalFileStorage::new(upstream.path()));
    let cache = ArtifactCache::new(storage, Some(backing.path().to_path_buf()), NonZeroUsize::new(8).unwrap());

    let output = assert_fs::TempDir::new().unwrap();
    cache
        .fetch("pkg.whl", false, &output.path().join("copy"), None, &CancellationToken::new())
        .await
        .unwrap();

    cache.clear_object_store().await.unwrap();

    let cached_files = fs_err::read_dir(backing.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().unwrap().is_file())
        .count();
    assert_eq!(cached_files, 0);
}
