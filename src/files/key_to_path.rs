//! Key-to-path store
//!
//! A disk-resident hash map from an opaque key (bytes + precomputed hash
//! code) to a path. Keys are hashed into a fixed, power-of-two number of
//! buckets; each bucket is one item in an append-only data file collection,
//! located through a long index keyed by bucket id. Writes are buffered per
//! session and applied bucket-by-bucket at `end_writing`, so every session
//! rewrites each touched bucket exactly once.
//!
//! ## Bucket item format (little-endian)
//! ```text
//! ┌───────────────┬───────────┬───────────────────────────────────────────┐
//! │ bucket id (4) │ count (4) │ entries: keyHash (4) path (8) len (4) key │
//! └───────────────┴───────────┴───────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use parking_lot::Mutex;

use crate::collections::{DiskLongIndex, LongIndex, MemLongIndex};
use crate::error::{Result, VirtaError};
use crate::files::DataFileCollection;

/// Target average number of entries per bucket
const AVERAGE_BUCKET_ENTRY_COUNT: i64 = 32;

const MIN_BUCKETS: u32 = 64;
const MAX_BUCKETS: u32 = 1 << 24;

/// Store metadata format version
const METADATA_VERSION: u32 = 1;

const METADATA_SUFFIX: &str = "_metadata.hdhm";
const BUCKET_INDEX_SUFFIX: &str = "_bucket_index.ll";
const BUCKET_INDEX_WORK_SUFFIX: &str = "_bucket_index.work";

/// Read retries when a bucket's file was compacted away mid-lookup
const READ_RETRIES: usize = 5;

// =============================================================================
// Buckets
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct BucketEntry {
    key_hash: i32,
    path: i64,
    key: Bytes,
}

fn serialize_bucket(bucket_id: u32, entries: &[BucketEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u32_le(bucket_id);
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_i32_le(entry.key_hash);
        buf.put_i64_le(entry.path);
        buf.put_u32_le(entry.key.len() as u32);
        buf.put_slice(&entry.key);
    }
    buf
}

fn parse_bucket(mut data: &[u8]) -> Result<(u32, Vec<BucketEntry>)> {
    if data.len() < 8 {
        return Err(VirtaError::Corruption(
            "Bucket shorter than its header".to_string(),
        ));
    }
    let bucket_id = data.get_u32_le();
    let count = data.get_u32_le() as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < 16 {
            return Err(VirtaError::Corruption("Bucket truncated".to_string()));
        }
        let key_hash = data.get_i32_le();
        let path = data.get_i64_le();
        let key_len = data.get_u32_le() as usize;
        if data.len() < key_len {
            return Err(VirtaError::Corruption("Bucket truncated in key".to_string()));
        }
        let key = Bytes::copy_from_slice(&data[..key_len]);
        data.advance(key_len);
        entries.push(BucketEntry {
            key_hash,
            path,
            key,
        });
    }
    Ok((bucket_id, entries))
}

/// Extract just the bucket id from a serialized bucket, for index rebuilds
/// and compaction
pub(crate) fn bucket_id_of(data: &[u8]) -> Result<i64> {
    if data.len() < 4 {
        return Err(VirtaError::Corruption(
            "Bucket shorter than its id field".to_string(),
        ));
    }
    Ok((&data[..4]).get_u32_le() as i64)
}

// =============================================================================
// Write session buffer
// =============================================================================

enum BucketOp {
    Put { key: Bytes, key_hash: i32, path: i64 },
    Delete { key: Bytes, key_hash: i32 },
    DeleteIfEqual { key: Bytes, key_hash: i32, expected_path: i64 },
}

// =============================================================================
// KeyToPathStore
// =============================================================================

pub struct KeyToPathStore {
    name: String,
    num_buckets: u32,
    bucket_mask: u32,
    bucket_index: Arc<dyn LongIndex>,
    files: Arc<DataFileCollection>,
    /// Buffered ops of the open writing session, keyed by bucket id
    pending: Mutex<Option<HashMap<u32, Vec<BucketOp>>>>,
    metadata_path: PathBuf,
    bucket_index_side_path: PathBuf,
}

impl KeyToPathStore {
    /// Open or create a store in `dir`.
    ///
    /// The bucket count is derived from `max_number_of_keys` at creation and
    /// persisted in the store metadata; an existing store keeps its count.
    /// A missing bucket index side-file is rebuilt by replaying the bucket
    /// data files.
    pub fn open(
        dir: &Path,
        name: &str,
        max_number_of_keys: i64,
        prefer_disk_indices: bool,
        index_chunk_size: usize,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let metadata_path = dir.join(format!("{}{}", name, METADATA_SUFFIX));
        let num_buckets = match Self::read_metadata(&metadata_path)? {
            Some(buckets) => buckets,
            None => {
                let buckets = Self::bucket_count_for(max_number_of_keys);
                Self::write_metadata(&metadata_path, buckets)?;
                buckets
            }
        };

        let side_path = dir.join(format!("{}{}", name, BUCKET_INDEX_SUFFIX));
        let work_path = dir.join(format!("{}{}", name, BUCKET_INDEX_WORK_SUFFIX));
        let have_side_file = side_path.exists();
        let bucket_index: Arc<dyn LongIndex> = if have_side_file {
            if prefer_disk_indices {
                Arc::new(DiskLongIndex::from_file(&side_path, &work_path)?)
            } else {
                Arc::new(MemLongIndex::from_file(&side_path, index_chunk_size)?)
            }
        } else if prefer_disk_indices {
            Arc::new(DiskLongIndex::create(&work_path)?)
        } else {
            Arc::new(MemLongIndex::new(index_chunk_size))
        };
        if bucket_index.max_valid_index() < 0 {
            bucket_index.update_valid_range(0, num_buckets as i64 - 1)?;
        }

        let (files, loaded_from_existing) = DataFileCollection::open(dir, name)?;
        if loaded_from_existing && !have_side_file {
            // No side file: rebuild bucket id -> location by replay. A side
            // file, even an empty one, is authoritative: replay cannot tell
            // an emptied bucket from one whose latest copy is the live one.
            files.for_each_item(|location, data| {
                bucket_index.put(bucket_id_of(data)?, location)
            })?;
        }

        Ok(Self {
            name: name.to_string(),
            num_buckets,
            bucket_mask: num_buckets - 1,
            bucket_index,
            files: Arc::new(files),
            pending: Mutex::new(None),
            metadata_path,
            bucket_index_side_path: side_path,
        })
    }

    fn bucket_count_for(max_number_of_keys: i64) -> u32 {
        let target = (max_number_of_keys / AVERAGE_BUCKET_ENTRY_COUNT).max(1) as u64;
        let buckets = target.next_power_of_two().min(MAX_BUCKETS as u64) as u32;
        buckets.max(MIN_BUCKETS)
    }

    fn read_metadata(path: &Path) -> Result<Option<u32>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(path)?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf)?;
        let version = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if version != METADATA_VERSION {
            return Err(VirtaError::Corruption(format!(
                "Unknown key-to-path metadata version: {}",
                version
            )));
        }
        Ok(Some(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]])))
    }

    fn write_metadata(path: &Path, num_buckets: u32) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&METADATA_VERSION.to_le_bytes())?;
        file.write_all(&num_buckets.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn bucket_of(&self, key_hash_code: i32) -> u32 {
        (key_hash_code as u32) & self.bucket_mask
    }

    fn read_bucket(&self, bucket_id: u32) -> Result<Vec<BucketEntry>> {
        for _ in 0..READ_RETRIES {
            let Some(location) = self.bucket_index.get(bucket_id as i64) else {
                return Ok(Vec::new());
            };
            match self.files.read_data_item(location) {
                Ok(data) => {
                    let (stored_id, entries) = parse_bucket(&data)?;
                    if stored_id != bucket_id {
                        return Err(VirtaError::Corruption(format!(
                            "Bucket {} resolved to stored bucket {}",
                            bucket_id, stored_id
                        )));
                    }
                    return Ok(entries);
                }
                Err(VirtaError::Storage { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(VirtaError::storage(
            &self.name,
            format!("gave up reading bucket {} after {} retries", bucket_id, READ_RETRIES),
        ))
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Look a key up, returning `not_found_value` when absent
    pub fn get(&self, key_bytes: &Bytes, key_hash_code: i32, not_found_value: i64) -> Result<i64> {
        let entries = self.read_bucket(self.bucket_of(key_hash_code))?;
        for entry in &entries {
            if entry.key_hash == key_hash_code && entry.key == *key_bytes {
                return Ok(entry.path);
            }
        }
        Ok(not_found_value)
    }

    // -------------------------------------------------------------------------
    // Writes (buffered per session)
    // -------------------------------------------------------------------------

    /// Begin a writing session
    pub fn start_writing(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return Err(VirtaError::InvalidState(format!(
                "{}: writing session already open",
                self.name
            )));
        }
        *pending = Some(HashMap::new());
        Ok(())
    }

    fn push_op(&self, key_hash_code: i32, op: BucketOp) -> Result<()> {
        let bucket_id = self.bucket_of(key_hash_code);
        let mut pending = self.pending.lock();
        let buffer = pending.as_mut().ok_or_else(|| {
            VirtaError::InvalidState(format!("{}: no writing session open", self.name))
        })?;
        buffer.entry(bucket_id).or_default().push(op);
        Ok(())
    }

    /// Map `key` to `path`
    pub fn put(&self, key_bytes: Bytes, key_hash_code: i32, path: i64) -> Result<()> {
        self.push_op(
            key_hash_code,
            BucketOp::Put {
                key: key_bytes,
                key_hash: key_hash_code,
                path,
            },
        )
    }

    /// Remove the mapping for `key` unconditionally
    pub fn delete(&self, key_bytes: Bytes, key_hash_code: i32) -> Result<()> {
        self.push_op(
            key_hash_code,
            BucketOp::Delete {
                key: key_bytes,
                key_hash: key_hash_code,
            },
        )
    }

    /// Remove the mapping for `key` only if it still points at
    /// `expected_path`. During reconnect a key may already have been
    /// relocated to a new path by the time its old delete record is applied;
    /// an unconditional delete would drop the relocated mapping.
    pub fn delete_if_equal(
        &self,
        key_bytes: Bytes,
        key_hash_code: i32,
        expected_path: i64,
    ) -> Result<()> {
        self.push_op(
            key_hash_code,
            BucketOp::DeleteIfEqual {
                key: key_bytes,
                key_hash: key_hash_code,
                expected_path,
            },
        )
    }

    /// Apply the buffered session: rewrite every touched bucket once, in a
    /// fresh data file, and point the bucket index at the new copies
    pub fn end_writing(&self) -> Result<()> {
        let buffer = self.pending.lock().take().ok_or_else(|| {
            VirtaError::InvalidState(format!("{}: no writing session open", self.name))
        })?;
        if buffer.is_empty() {
            return Ok(());
        }

        let mut bucket_ids: Vec<u32> = buffer.keys().copied().collect();
        bucket_ids.sort_unstable();

        self.files.start_writing()?;
        for bucket_id in bucket_ids {
            let mut entries = self.read_bucket(bucket_id)?;
            for op in &buffer[&bucket_id] {
                Self::apply_op(&mut entries, op);
            }
            if entries.is_empty() {
                self.bucket_index.remove(bucket_id as i64);
            } else {
                let data = serialize_bucket(bucket_id, &entries);
                let location = self.files.store_data_item(&data)?;
                self.bucket_index.put(bucket_id as i64, location)?;
            }
        }
        self.files.end_writing()?;
        Ok(())
    }

    fn apply_op(entries: &mut Vec<BucketEntry>, op: &BucketOp) {
        match op {
            BucketOp::Put {
                key,
                key_hash,
                path,
            } => {
                for entry in entries.iter_mut() {
                    if entry.key_hash == *key_hash && entry.key == *key {
                        entry.path = *path;
                        return;
                    }
                }
                entries.push(BucketEntry {
                    key_hash: *key_hash,
                    path: *path,
                    key: key.clone(),
                });
            }
            BucketOp::Delete { key, key_hash } => {
                entries.retain(|e| !(e.key_hash == *key_hash && e.key == *key));
            }
            BucketOp::DeleteIfEqual {
                key,
                key_hash,
                expected_path,
            } => {
                entries.retain(|e| {
                    !(e.key_hash == *key_hash && e.key == *key && e.path == *expected_path)
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Copy the store's durable state into `target_dir`: data files, store
    /// metadata, and the bucket index side-file
    pub fn snapshot(&self, target_dir: &Path) -> Result<()> {
        self.files.snapshot(target_dir)?;
        let metadata_name = self.metadata_path.file_name().ok_or_else(|| {
            VirtaError::storage(&self.name, "metadata file without a name")
        })?;
        fs::copy(&self.metadata_path, target_dir.join(metadata_name))?;
        let side_name = self.bucket_index_side_path.file_name().ok_or_else(|| {
            VirtaError::storage(&self.name, "bucket index side file without a name")
        })?;
        self.bucket_index
            .write_to_file(&target_dir.join(side_name))?;
        Ok(())
    }

    /// Write the bucket index side-file in place. Must run on a clean close:
    /// a reopen that rebuilds the index by replay would re-point emptied
    /// buckets at their last non-empty copy, resurrecting deleted keys.
    pub fn persist_index(&self) -> Result<()> {
        self.bucket_index.write_to_file(&self.bucket_index_side_path)
    }

    pub fn close(&self) -> Result<()> {
        Ok(())
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    pub fn bucket_index(&self) -> &Arc<dyn LongIndex> {
        &self.bucket_index
    }

    pub fn file_collection(&self) -> &Arc<DataFileCollection> {
        &self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::INVALID_PATH;
    use tempfile::TempDir;

    fn open_store(dir: &Path) -> KeyToPathStore {
        KeyToPathStore::open(dir, "objectkeytopath", 10_000, false, 1024).unwrap()
    }

    fn key(text: &str) -> (Bytes, i32) {
        let bytes = Bytes::copy_from_slice(text.as_bytes());
        // Cheap deterministic hash for tests
        let hash = text.bytes().fold(17i32, |acc, b| {
            acc.wrapping_mul(31).wrapping_add(b as i32)
        });
        (bytes, hash)
    }

    #[test]
    fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        let (k, h) = key("hello");

        assert_eq!(store.get(&k, h, INVALID_PATH).unwrap(), INVALID_PATH);

        store.start_writing().unwrap();
        store.put(k.clone(), h, 42).unwrap();
        store.end_writing().unwrap();
        assert_eq!(store.get(&k, h, INVALID_PATH).unwrap(), 42);

        store.start_writing().unwrap();
        store.delete(k.clone(), h).unwrap();
        store.end_writing().unwrap();
        assert_eq!(store.get(&k, h, INVALID_PATH).unwrap(), INVALID_PATH);
    }

    #[test]
    fn delete_if_equal_respects_relocation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        let (k, h) = key("moved");

        store.start_writing().unwrap();
        store.put(k.clone(), h, 10).unwrap();
        store.end_writing().unwrap();

        // Key has moved to path 20; a stale delete for path 10 must not win
        store.start_writing().unwrap();
        store.put(k.clone(), h, 20).unwrap();
        store.delete_if_equal(k.clone(), h, 10).unwrap();
        store.end_writing().unwrap();
        assert_eq!(store.get(&k, h, INVALID_PATH).unwrap(), 20);

        // A delete matching the current path does win
        store.start_writing().unwrap();
        store.delete_if_equal(k.clone(), h, 20).unwrap();
        store.end_writing().unwrap();
        assert_eq!(store.get(&k, h, INVALID_PATH).unwrap(), INVALID_PATH);
    }

    #[test]
    fn colliding_hash_codes_resolved_by_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        let a = Bytes::from_static(b"key-a");
        let b = Bytes::from_static(b"key-b");

        store.start_writing().unwrap();
        store.put(a.clone(), 7, 1).unwrap();
        store.put(b.clone(), 7, 2).unwrap();
        store.end_writing().unwrap();

        assert_eq!(store.get(&a, 7, INVALID_PATH).unwrap(), 1);
        assert_eq!(store.get(&b, 7, INVALID_PATH).unwrap(), 2);
    }

    #[test]
    fn reopen_without_side_file_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let (k, h) = key("durable");
        {
            let store = open_store(dir.path());
            store.start_writing().unwrap();
            store.put(k.clone(), h, 5).unwrap();
            store.end_writing().unwrap();
        }
        // No bucket index side file was ever written in the live dir; the
        // reopened store replays its data files instead
        let store = open_store(dir.path());
        assert_eq!(store.get(&k, h, INVALID_PATH).unwrap(), 5);
    }

    #[test]
    fn deleted_key_stays_deleted_after_index_persist() {
        let dir = TempDir::new().unwrap();
        let (k, h) = key("gone");
        {
            let store = open_store(dir.path());
            store.start_writing().unwrap();
            store.put(k.clone(), h, 1).unwrap();
            store.end_writing().unwrap();

            // Emptying the bucket leaves its old non-empty copy in the data
            // files; the persisted index must not point back at it
            store.start_writing().unwrap();
            store.delete(k.clone(), h).unwrap();
            store.end_writing().unwrap();
            assert_eq!(store.get(&k, h, INVALID_PATH).unwrap(), INVALID_PATH);
            store.persist_index().unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.get(&k, h, INVALID_PATH).unwrap(), INVALID_PATH);
    }

    #[test]
    fn snapshot_and_reopen() {
        let dir = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let (k, h) = key("snap");

        let store = open_store(dir.path());
        store.start_writing().unwrap();
        store.put(k.clone(), h, 9).unwrap();
        store.end_writing().unwrap();
        store.snapshot(target.path()).unwrap();

        let restored = open_store(target.path());
        assert_eq!(restored.get(&k, h, INVALID_PATH).unwrap(), 9);
        assert_eq!(restored.num_buckets(), store.num_buckets());
    }

    #[test]
    fn bucket_count_is_a_power_of_two() {
        assert_eq!(KeyToPathStore::bucket_count_for(1), MIN_BUCKETS);
        let buckets = KeyToPathStore::bucket_count_for(1_000_000);
        assert!(buckets.is_power_of_two());
        assert!(buckets >= 1_000_000 as u32 / 64);
    }
}
