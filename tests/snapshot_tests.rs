//! Tests for snapshots and restore
//!
//! These tests verify:
//! - Snapshot/restore round trips through the database registry
//! - Snapshot independence from later writes to the source
//! - Concurrent snapshot rejection
//! - Index rebuild by data-file replay when side files are missing
//! - Table copies through the builder

use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use virtakv::{
    Config, DataSource, DataSourceBuilder, Database, DigestType, Hash, HashRecord, LeafRecord,
    TableConfig, VirtaError,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config() -> Config {
    Config::builder()
        .leaf_record_cache_size(64)
        .index_chunk_size(256)
        .build()
}

fn table_config() -> TableConfig {
    TableConfig::new(1, DigestType::Sha384)
        .max_number_of_keys(10_000)
        .unwrap()
        .hashes_ram_to_disk_threshold(0)
        .unwrap()
}

fn setup() -> (TempDir, Arc<Database>, DataSource) {
    let temp_dir = TempDir::new().unwrap();
    let database = Database::open(temp_dir.path(), test_config()).unwrap();
    let source = database
        .create_data_source("testtable", table_config(), false)
        .unwrap();
    (temp_dir, database, source)
}

fn test_hash(fill: u8) -> Hash {
    Hash::new(DigestType::Sha384, Bytes::from(vec![fill; 48])).unwrap()
}

fn key_hash(key: &str) -> i32 {
    key.bytes()
        .fold(17i32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as i32))
}

fn leaf(path: i64, key: &str, value: &str) -> LeafRecord {
    LeafRecord::new(
        path,
        Bytes::copy_from_slice(key.as_bytes()),
        key_hash(key),
        Some(Bytes::copy_from_slice(value.as_bytes())),
    )
}

fn populate(source: &DataSource, first: i64, last: i64) {
    let hashes: Vec<HashRecord> = (0..=last)
        .map(|p| HashRecord::new(p, test_hash((p % 251) as u8)))
        .collect();
    let leaves: Vec<LeafRecord> = (first..=last)
        .map(|p| leaf(p, &format!("key-{}", p), &format!("value-{}", p)))
        .collect();
    source
        .save_records(first, last, hashes, leaves, vec![], false)
        .unwrap();
}

fn assert_same_content(a: &DataSource, b: &DataSource, first: i64, last: i64) {
    assert_eq!(a.first_leaf_path(), b.first_leaf_path());
    assert_eq!(a.last_leaf_path(), b.last_leaf_path());
    for path in 0..=last {
        assert_eq!(a.load_hash(path).unwrap(), b.load_hash(path).unwrap());
    }
    for path in first..=last {
        assert_eq!(
            a.load_leaf_record(path).unwrap(),
            b.load_leaf_record(path).unwrap()
        );
        let key = Bytes::from(format!("key-{}", path));
        let hash_code = key_hash(&format!("key-{}", path));
        assert_eq!(
            a.load_leaf_record_by_key(&key, hash_code).unwrap(),
            b.load_leaf_record_by_key(&key, hash_code).unwrap()
        );
    }
}

// =============================================================================
// Snapshot/Restore Tests
// =============================================================================

#[test]
fn test_snapshot_restore_round_trip() {
    let (_temp, database, source) = setup();
    populate(&source, 7, 14);

    let snap_dir = TempDir::new().unwrap();
    let snap_path = snap_dir.path().join("snap");
    database.snapshot(&snap_path, &source).unwrap();

    let restored = database.restore("restored", &snap_path, false).unwrap();
    assert_same_content(&source, &restored, 7, 14);

    restored.close(false).unwrap();
    source.close(false).unwrap();
}

#[test]
fn test_snapshot_is_independent_of_later_writes() {
    let (_temp, database, source) = setup();
    populate(&source, 3, 6);

    let snap_dir = TempDir::new().unwrap();
    let snap_path = snap_dir.path().join("snap");
    database.snapshot(&snap_path, &source).unwrap();

    // Overwrite and shrink the source after the snapshot was taken
    source
        .save_records(3, 4, vec![], vec![leaf(3, "key-3", "changed")], vec![], false)
        .unwrap();

    let restored = database.restore("restored", &snap_path, false).unwrap();
    assert_eq!(restored.last_leaf_path(), 6);
    assert_eq!(
        restored.load_leaf_record(3).unwrap().unwrap(),
        leaf(3, "key-3", "value-3")
    );
    assert_eq!(
        restored.load_leaf_record(6).unwrap().unwrap(),
        leaf(6, "key-6", "value-6")
    );

    restored.close(false).unwrap();
    source.close(false).unwrap();
}

#[test]
fn test_concurrent_snapshots_do_not_interleave() {
    let (_temp, database, source) = setup();
    populate(&source, 50, 200);

    let snap_dir = TempDir::new().unwrap();
    let results = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let database = &database;
                let source = &source;
                let target = snap_dir.path().join(format!("snap-{}", i));
                scope.spawn(move |_| database.snapshot(&target, source))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    // Snapshots may serialize or be rejected, never fail any other way
    assert!(results.iter().any(|r| r.is_ok()));
    for result in &results {
        match result {
            Ok(()) | Err(VirtaError::SnapshotInProgress) => {}
            Err(e) => panic!("unexpected snapshot error: {}", e),
        }
    }

    // Every snapshot that succeeded restores to the same content
    for (i, result) in results.iter().enumerate() {
        if result.is_ok() {
            let restored = database
                .restore(
                    &format!("restored-{}", i),
                    &snap_dir.path().join(format!("snap-{}", i)),
                    false,
                )
                .unwrap();
            assert_same_content(&source, &restored, 50, 200);
            restored.close(false).unwrap();
        }
    }

    source.close(false).unwrap();
}

// =============================================================================
// Index Rebuild Tests
// =============================================================================

/// Deleting the location index side files from a snapshot forces the
/// restored table to rebuild them by replaying the data files
#[test]
fn test_restore_rebuilds_missing_indices_by_replay() {
    let (_temp, database, source) = setup();
    populate(&source, 7, 14);

    let snap_dir = TempDir::new().unwrap();
    let snap_path = snap_dir.path().join("snap");
    database.snapshot(&snap_path, &source).unwrap();

    let table_dir = snap_path.join("tables").join("testtable");
    fs::remove_file(table_dir.join("pathToDiskLocationInternalNodes")).unwrap();
    fs::remove_file(table_dir.join("pathToDiskLocationLeafNodes")).unwrap();

    let restored = database.restore("restored", &snap_path, false).unwrap();
    assert_same_content(&source, &restored, 7, 14);

    restored.close(false).unwrap();
    source.close(false).unwrap();
}

// =============================================================================
// Copy Tests
// =============================================================================

#[test]
fn test_builder_copy_is_independent() {
    let temp_dir = TempDir::new().unwrap();
    let database = Database::open(temp_dir.path(), test_config()).unwrap();
    let builder = DataSourceBuilder::new(Arc::clone(&database)).table_config(table_config());

    let source = builder.build("testtable", false).unwrap();
    populate(&source, 3, 6);

    let copy = builder.copy(&source, false, true).unwrap();
    assert_same_content(&source, &copy, 3, 6);

    // Emptying the original must not reach the copy
    source
        .save_records(-1, -1, vec![], vec![], vec![], false)
        .unwrap();
    assert!(source.load_leaf_record(4).unwrap().is_none());
    assert_eq!(
        copy.load_leaf_record(4).unwrap().unwrap(),
        leaf(4, "key-4", "value-4")
    );

    copy.close(false).unwrap();
    source.close(false).unwrap();
}

#[test]
fn test_builder_copy_make_active_takes_over_the_name() {
    let temp_dir = TempDir::new().unwrap();
    let database = Database::open(temp_dir.path(), test_config()).unwrap();
    let builder = DataSourceBuilder::new(Arc::clone(&database)).table_config(table_config());

    let source = builder.build("testtable", false).unwrap();
    populate(&source, 1, 2);

    let copy = builder.copy(&source, true, true).unwrap();
    copy.close(true).unwrap();
    source.close(true).unwrap();

    // Reopening by the original name must yield the copy's directory
    let reopened = database.get_data_source("testtable", false).unwrap();
    assert_eq!(
        reopened.load_leaf_record(1).unwrap().unwrap(),
        leaf(1, "key-1", "value-1")
    );
    reopened.close(true).unwrap();
}
