#![allow(dead_code)]

use issue_timeline::storage::SqliteStorage;
use std::path::PathBuf;
use std::sync::Once;
use tempfile::TempDir;

pub mod fixtures;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        issue_timeline::logging::init_test_logging();
    });
}

pub fn test_db() -> SqliteStorage {
    init_test_logging();
    SqliteStorage::open_memory().expect("Failed to create test database")
}

pub fn test_db_with_dir() -> (SqliteStorage, TempDir) {
    init_test_logging();
    let (db_path, dir) = test_db_path();
    let storage = SqliteStorage::open(&db_path).expect("Failed to create test database");
    (storage, dir)
}

/// Path to a not-yet-created database file inside a fresh temp dir.
pub fn test_db_path() -> (PathBuf, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("timeline").join("timeline.db");
    std::fs::create_dir_all(db_path.parent().unwrap()).unwrap();
    (db_path, dir)
}
