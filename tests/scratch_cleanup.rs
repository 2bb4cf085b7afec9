use std::fs;
use std::time::{Duration, SystemTime};

use tempfile::tempdir;

use roadscan::storage::{self, DEFAULT_RETENTION};

#[test]
fn removes_only_files_past_retention() {
    let dir = tempdir().unwrap();
    let uploads = dir.path().join("uploads");
    let outputs = dir.path().join("outputs");
    fs::create_dir_all(&uploads).unwrap();
    fs::create_dir_all(&outputs).unwrap();
    fs::write(uploads.join("a.jpg"), b"a").unwrap();
    fs::write(outputs.join("a_detected.jpg"), b"b").unwrap();

    let dirs = [uploads.as_path(), outputs.as_path()];

    // Nothing is older than an hour yet.
    assert_eq!(storage::cleanup(&dirs, DEFAULT_RETENTION).unwrap(), 0);
    assert!(uploads.join("a.jpg").exists());

    // Two hours from now both files are stale.
    let later = SystemTime::now() + Duration::from_secs(2 * 3600);
    assert_eq!(storage::cleanup_at(&dirs, DEFAULT_RETENTION, later).unwrap(), 2);
    assert!(!uploads.join("a.jpg").exists());
    assert!(!outputs.join("a_detected.jpg").exists());
}

#[test]
fn age_is_measured_against_supplied_clock() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.mp4"), b"a").unwrap();
    fs::write(dir.path().join("b.mp4"), b"b").unwrap();

    let retention = Duration::from_secs(60);
    assert_eq!(storage::cleanup_at(&[dir.path()], retention, SystemTime::now()).unwrap(), 0);
    assert!(dir.path().join("a.mp4").exists());

    let later = SystemTime::now() + Duration::from_secs(90);
    assert_eq!(storage::cleanup_at(&[dir.path()], retention, later).unwrap(), 2);
}

#[test]
fn empty_and_missing_dirs_are_zero() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("never-created");
    assert_eq!(storage::cleanup(&[dir.path()], DEFAULT_RETENTION).unwrap(), 0);
    assert_eq!(storage::cleanup(&[missing.as_path()], DEFAULT_RETENTION).unwrap(), 0);
    // Idempotent.
    assert_eq!(storage::cleanup(&[dir.path()], DEFAULT_RETENTION).unwrap(), 0);
}

#[test]
fn subdirectories_are_left_alone() {
    let dir = tempdir().unwrap();
    fs::create_dir(dir.path().join("nested")).unwrap();
    let later = SystemTime::now() + Duration::from_secs(10 * 3600);
    assert_eq!(storage::cleanup_at(&[dir.path()], DEFAULT_RETENTION, later).unwrap(), 0);
    assert!(dir.path().join("nested").is_dir());
}
