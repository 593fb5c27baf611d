//! Data source façade
//!
//! Owns every store of one table and exposes the read/write/snapshot/close
//! contract.
//!
//! ## Responsibilities
//! - Swap the valid key range atomically before any write-batch mutation
//! - Fan a write batch out to the hash and leaf flush workers and block on
//!   both
//! - Serve key and path lookups through the leaf read cache, the key-to-path
//!   store and the path-to-leaf store
//! - Route hash reads and writes between the RAM and disk tiers by path
//!   threshold
//! - Take self-contained point-in-time snapshots, pausing compaction around
//!   the parallel copy
//! - Close idempotently, stopping compaction and draining the flush workers
//!   before any file is closed
//!
//! ```text
//!                       ┌────────────────────────────┐
//!        save_records ─▶│         DataSource         │◀─ load_leaf_record
//!                       │  valid range (atomic swap) │   find_key / load_hash
//!                       └─────┬────────────────┬─────┘
//!                    hash worker          leaf worker
//!                  ┌──────┴──────┐     ┌──────┴───────────┐
//!                  ▼             ▼     ▼                  ▼
//!            HashList   IndexedStore  IndexedStore   KeyToPathStore
//!            (RAM tier) (disk tier)   (path→leaf)    (key→path)
//! ```

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::collections::{DiskLongIndex, LongIndex, MemLongIndex};
use crate::compaction::CompactionCoordinator;
use crate::config::Config;
use crate::error::{Result, VirtaError};
use crate::files::{bucket_id_of, IndexedStore, KeyToPathStore, PauseGate, StoreCompactor};
use crate::hashes::HashList;
use crate::range::{KeyRange, INVALID_KEY_RANGE, INVALID_PATH};
use crate::records::{Hash, HashRecord, LeafRecord};
use crate::table::{
    decode_table_metadata, encode_table_metadata, read_blob, write_blob, TableConfig, TablePaths,
};
use crate::worker::Worker;

/// Hashes per chunk in the RAM hash list
const HASH_LIST_CHUNK_SIZE: usize = 4096;

/// Process-wide count of live data sources, for diagnostics
static OPEN_DATA_SOURCES: AtomicUsize = AtomicUsize::new(0);

// =============================================================================
// Leaf read cache
// =============================================================================

/// Fixed-size direct-mapped cache of resolved leaf records. Slots are
/// replaced atomically; a stale hit is always re-validated against the
/// stored key and the current range before being trusted.
struct LeafCache {
    slots: Vec<RwLock<Option<Arc<LeafRecord>>>>,
}

impl LeafCache {
    fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| RwLock::new(None)).collect(),
        }
    }

    fn slot_of(&self, key_hash_code: i32) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        Some((key_hash_code as i64).unsigned_abs() as usize % self.slots.len())
    }

    fn get(&self, key_hash_code: i32) -> Option<Arc<LeafRecord>> {
        let slot = self.slot_of(key_hash_code)?;
        self.slots[slot].read().clone()
    }

    fn store(&self, record: Arc<LeafRecord>) {
        if let Some(slot) = self.slot_of(record.key_hash_code) {
            *self.slots[slot].write() = Some(record);
        }
    }

    /// Clear the slot if it currently holds this key
    fn invalidate(&self, key_bytes: &Bytes, key_hash_code: i32) {
        let Some(slot) = self.slot_of(key_hash_code) else {
            return;
        };
        let mut guard = self.slots[slot].write();
        if let Some(record) = guard.as_ref() {
            if record.key_bytes == *key_bytes {
                *guard = None;
            }
        }
    }
}

// =============================================================================
// DataSource
// =============================================================================

/// The store components, shared with the flush workers
struct Stores {
    hash_threshold: i64,
    hash_list: HashList,
    hash_store_disk: IndexedStore,
    internal_index: Arc<dyn LongIndex>,
    leaf_index: Arc<dyn LongIndex>,
    path_to_leaf: IndexedStore,
    key_to_path: KeyToPathStore,
    cache: LeafCache,
}

pub struct DataSource {
    label: String,
    paths: TablePaths,
    table_config: TableConfig,
    config: Config,

    stores: Arc<Stores>,
    valid_range: RwLock<KeyRange>,

    hash_worker: Mutex<Option<Worker>>,
    leaf_worker: Mutex<Option<Worker>>,

    coordinator: Mutex<CompactionCoordinator>,
    hash_compactor: Arc<StoreCompactor>,
    key_to_path_compactor: Arc<StoreCompactor>,
    path_to_leaf_compactor: Arc<StoreCompactor>,
    pause_gate: Arc<PauseGate>,

    snapshot_in_progress: AtomicBool,
    closed: AtomicBool,
}

impl DataSource {
    /// Open or create a table at `dir`. Missing index side-files are rebuilt
    /// by replaying the store data files.
    pub(crate) fn open(
        dir: &Path,
        label: &str,
        table_config: TableConfig,
        config: &Config,
        enable_compaction: bool,
    ) -> Result<Self> {
        let paths = TablePaths::new(dir);
        paths.create_dirs()?;

        let valid_range = if paths.metadata_file().exists() {
            decode_table_metadata(&read_blob(&paths.metadata_file())?)?
        } else {
            write_blob(
                &paths.metadata_file(),
                &encode_table_metadata(&INVALID_KEY_RANGE),
            )?;
            INVALID_KEY_RANGE
        };
        if !paths.config_file().exists() {
            write_blob(&paths.config_file(), &table_config.to_bytes())?;
        }

        let internal_rebuild = !paths.internal_nodes_index_file().exists();
        let internal_index = Self::open_index(
            config,
            &paths.internal_nodes_index_file(),
            &paths.internal_nodes_index_work_file(),
        )?;
        let leaf_rebuild = !paths.leaf_nodes_index_file().exists();
        let leaf_index = Self::open_index(
            config,
            &paths.leaf_nodes_index_file(),
            &paths.leaf_nodes_index_work_file(),
        )?;
        if valid_range.max_valid_key() >= 0 {
            if internal_rebuild {
                internal_index.update_valid_range(0, valid_range.max_valid_key())?;
            }
            if leaf_rebuild {
                leaf_index
                    .update_valid_range(valid_range.min_valid_key(), valid_range.max_valid_key())?;
            }
        }

        let hash_list = if paths.hash_list_file().exists() {
            HashList::from_file(&paths.hash_list_file(), HASH_LIST_CHUNK_SIZE)?
        } else {
            HashList::new(table_config.digest_type(), HASH_LIST_CHUNK_SIZE)
        };

        let replay_index = internal_index.clone();
        let mut internal_replay = move |location: u64, data: &[u8]| {
            let path = HashRecord::path_of(data)?;
            if path >= replay_index.min_valid_index() && path <= replay_index.max_valid_index() {
                replay_index.put(path, location)?;
            }
            Ok(())
        };
        let internal_replay_cb: Option<&mut dyn FnMut(u64, &[u8]) -> Result<()>> =
            if internal_rebuild {
                Some(&mut internal_replay)
            } else {
                None
            };
        let hash_store_disk = IndexedStore::open(
            &paths.hash_store_disk_dir(),
            "internalHashStoreDisk",
            internal_index.clone(),
            internal_replay_cb,
        )?;

        let replay_index = leaf_index.clone();
        let mut leaf_replay = move |location: u64, data: &[u8]| {
            let path = LeafRecord::path_of(data)?;
            if path >= replay_index.min_valid_index() && path <= replay_index.max_valid_index() {
                replay_index.put(path, location)?;
            }
            Ok(())
        };
        let leaf_replay_cb: Option<&mut dyn FnMut(u64, &[u8]) -> Result<()>> = if leaf_rebuild {
            Some(&mut leaf_replay)
        } else {
            None
        };
        let path_to_leaf = IndexedStore::open(
            &paths.path_to_leaf_dir(),
            "pathToHashKeyValue",
            leaf_index.clone(),
            leaf_replay_cb,
        )?;

        let key_to_path = KeyToPathStore::open(
            &paths.key_to_path_dir(),
            "objectKeyToPath",
            table_config.get_max_number_of_keys(),
            config.prefer_disk_indices,
            config.index_chunk_size,
        )?;

        let pause_gate = Arc::new(PauseGate::new());
        let hash_compactor = Arc::new(StoreCompactor::new(
            "internalHashStoreDisk",
            hash_store_disk.file_collection().clone(),
            internal_index.clone(),
            Box::new(HashRecord::path_of),
            config.min_files_to_compact,
            pause_gate.clone(),
        ));
        let path_to_leaf_compactor = Arc::new(StoreCompactor::new(
            "pathToHashKeyValue",
            path_to_leaf.file_collection().clone(),
            leaf_index.clone(),
            Box::new(LeafRecord::path_of),
            config.min_files_to_compact,
            pause_gate.clone(),
        ));
        let key_to_path_compactor = Arc::new(StoreCompactor::new(
            "objectKeyToPath",
            key_to_path.file_collection().clone(),
            key_to_path.bucket_index().clone(),
            Box::new(bucket_id_of),
            config.min_files_to_compact,
            pause_gate.clone(),
        ));

        let coordinator = CompactionCoordinator::new(config.compaction_threads)?;
        if enable_compaction {
            coordinator.enable();
        }

        let stores = Arc::new(Stores {
            hash_threshold: table_config.get_hashes_ram_to_disk_threshold(),
            hash_list,
            hash_store_disk,
            internal_index,
            leaf_index,
            path_to_leaf,
            key_to_path,
            cache: LeafCache::new(config.leaf_record_cache_size),
        });

        let hash_worker = Worker::spawn(&format!("{}-hash-writer", label))?;
        let leaf_worker = Worker::spawn(&format!("{}-leaf-writer", label))?;

        OPEN_DATA_SOURCES.fetch_add(1, Ordering::SeqCst);
        info!(table = %label, dir = %dir.display(), "data source opened");

        Ok(Self {
            label: label.to_string(),
            paths,
            table_config,
            config: config.clone(),
            stores,
            valid_range: RwLock::new(valid_range),
            hash_worker: Mutex::new(Some(hash_worker)),
            leaf_worker: Mutex::new(Some(leaf_worker)),
            coordinator: Mutex::new(coordinator),
            hash_compactor,
            key_to_path_compactor,
            path_to_leaf_compactor,
            pause_gate,
            snapshot_in_progress: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn open_index(config: &Config, side: &Path, work: &Path) -> Result<Arc<dyn LongIndex>> {
        Ok(if side.exists() {
            if config.prefer_disk_indices {
                Arc::new(DiskLongIndex::from_file(side, work)?)
            } else {
                Arc::new(MemLongIndex::from_file(side, config.index_chunk_size)?)
            }
        } else if config.prefer_disk_indices {
            Arc::new(DiskLongIndex::create(work)?)
        } else {
            Arc::new(MemLongIndex::new(config.index_chunk_size))
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VirtaError::Closed);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Apply one write batch: swap the valid range, then write all hash
    /// records and all leaf upserts/deletes, blocking until both flushes are
    /// durable. Triggers background compaction for the written stores.
    ///
    /// With `is_reconnect`, leaf deletes only remove a key-to-path mapping
    /// that still points at the deleted record's path, so a relocation that
    /// was applied earlier in the stream survives.
    pub fn save_records(
        &self,
        first_leaf_path: i64,
        last_leaf_path: i64,
        hash_records: Vec<HashRecord>,
        leaves_to_upsert: Vec<LeafRecord>,
        leaves_to_delete: Vec<LeafRecord>,
        is_reconnect: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let range = if last_leaf_path < 0 {
            INVALID_KEY_RANGE
        } else {
            KeyRange::new(first_leaf_path, last_leaf_path)?
        };

        // Readers must see the new range before any store mutation. Index
        // ranges follow the normalized range, never the raw arguments: any
        // negative last path means "empty table".
        *self.valid_range.write() = range;
        let last = range.max_valid_key();
        self.stores
            .internal_index
            .update_valid_range(if last < 0 { -1 } else { 0 }, last)?;
        self.stores
            .leaf_index
            .update_valid_range(range.min_valid_key(), range.max_valid_key())?;

        let (hash_tx, hash_rx) = channel::bounded(1);
        let stores = self.stores.clone();
        self.hash_worker
            .lock()
            .as_ref()
            .ok_or(VirtaError::Closed)?
            .execute(move || {
                let _ = hash_tx.send(write_hashes(&stores, hash_records));
            })?;

        let (leaf_tx, leaf_rx) = channel::bounded(1);
        let stores = self.stores.clone();
        self.leaf_worker
            .lock()
            .as_ref()
            .ok_or(VirtaError::Closed)?
            .execute(move || {
                let _ = leaf_tx.send(write_leaves(
                    &stores,
                    leaves_to_upsert,
                    leaves_to_delete,
                    is_reconnect,
                ));
            })?;

        let hash_result = hash_rx
            .recv()
            .map_err(|_| VirtaError::InvalidState("hash writer gone".to_string()))?;
        let leaf_result = leaf_rx
            .recv()
            .map_err(|_| VirtaError::InvalidState("leaf writer gone".to_string()))?;
        hash_result?;
        leaf_result?;

        let coordinator = self.coordinator.lock();
        for compactor in [
            &self.hash_compactor,
            &self.key_to_path_compactor,
            &self.path_to_leaf_compactor,
        ] {
            if let Err(e) = coordinator.compact_if_not_running(compactor) {
                warn!(table = %self.label, store = compactor.name(), error = %e,
                    "could not schedule compaction");
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Load the leaf record stored for a key, if any
    pub fn load_leaf_record_by_key(
        &self,
        key_bytes: &Bytes,
        key_hash_code: i32,
    ) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        let range = *self.valid_range.read();

        if let Some(cached) = self.stores.cache.get(key_hash_code) {
            if cached.key_bytes == *key_bytes {
                if cached.path == INVALID_PATH {
                    return Ok(None);
                }
                if range.within_range(cached.path) {
                    if cached.value_bytes.is_some() {
                        return Ok(Some((*cached).clone()));
                    }
                    // Resolved path, value not yet fetched
                    if let Some(record) = self.load_leaf_at_path(cached.path)? {
                        if record.key_bytes == *key_bytes {
                            let record = Arc::new(record);
                            self.stores.cache.store(record.clone());
                            return Ok(Some((*record).clone()));
                        }
                    }
                }
                // Out of range or superseded: resolve from the stores
            }
        }

        let path = self
            .stores
            .key_to_path
            .get(key_bytes, key_hash_code, INVALID_PATH)?;
        if path == INVALID_PATH {
            self.stores.cache.store(Arc::new(LeafRecord::new(
                INVALID_PATH,
                key_bytes.clone(),
                key_hash_code,
                None,
            )));
            return Ok(None);
        }
        if !range.within_range(path) {
            // Possibly a stale mapping from a partial batch; do not cache
            return Ok(None);
        }
        let Some(record) = self.load_leaf_at_path(path)? else {
            return Ok(None);
        };
        if record.key_bytes != *key_bytes {
            return Err(VirtaError::Corruption(format!(
                "Leaf record at path {} does not hold the resolved key",
                path
            )));
        }
        let record = Arc::new(record);
        self.stores.cache.store(record.clone());
        Ok(Some((*record).clone()))
    }

    /// Load the leaf record at a path, if the path is currently valid
    pub fn load_leaf_record(&self, path: i64) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        if path < 0 {
            return Err(VirtaError::InvalidArgument(format!(
                "Path must be non-negative, got {}",
                path
            )));
        }
        if !self.valid_range.read().within_range(path) {
            return Ok(None);
        }
        self.load_leaf_at_path(path)
    }

    fn load_leaf_at_path(&self, path: i64) -> Result<Option<LeafRecord>> {
        let Some(bytes) = self.stores.path_to_leaf.get(path)? else {
            return Ok(None);
        };
        let record = LeafRecord::parse(&bytes)?;
        if record.path != path {
            return Err(VirtaError::Corruption(format!(
                "Leaf record at path {} claims path {}",
                path, record.path
            )));
        }
        Ok(Some(record))
    }

    /// Resolve a key to its path, or `INVALID_PATH` when absent
    pub fn find_key(&self, key_bytes: &Bytes, key_hash_code: i32) -> Result<i64> {
        self.ensure_open()?;
        let range = *self.valid_range.read();

        if let Some(cached) = self.stores.cache.get(key_hash_code) {
            if cached.key_bytes == *key_bytes {
                if cached.path == INVALID_PATH {
                    return Ok(INVALID_PATH);
                }
                if range.within_range(cached.path) {
                    return Ok(cached.path);
                }
            }
        }

        let path = self
            .stores
            .key_to_path
            .get(key_bytes, key_hash_code, INVALID_PATH)?;
        if path == INVALID_PATH {
            self.stores.cache.store(Arc::new(LeafRecord::new(
                INVALID_PATH,
                key_bytes.clone(),
                key_hash_code,
                None,
            )));
            return Ok(INVALID_PATH);
        }
        if !range.within_range(path) {
            return Ok(INVALID_PATH);
        }
        self.stores.cache.store(Arc::new(LeafRecord::new(
            path,
            key_bytes.clone(),
            key_hash_code,
            None,
        )));
        Ok(path)
    }

    /// Load the hash stored for a path, from whichever tier holds it
    pub fn load_hash(&self, path: i64) -> Result<Option<Hash>> {
        self.ensure_open()?;
        if path < 0 {
            return Err(VirtaError::InvalidArgument(format!(
                "Path must be non-negative, got {}",
                path
            )));
        }
        let max_valid = self.valid_range.read().max_valid_key();
        if max_valid < 0 || path > max_valid {
            return Ok(None);
        }
        if path < self.stores.hash_threshold {
            return Ok(self.stores.hash_list.get(path));
        }
        let Some(bytes) = self.stores.hash_store_disk.get(path)? else {
            return Ok(None);
        };
        let record = HashRecord::parse(&bytes, self.table_config.digest_type())?;
        if record.path != path {
            return Err(VirtaError::Corruption(format!(
                "Hash record at path {} claims path {}",
                path, record.path
            )));
        }
        Ok(Some(record.hash))
    }

    /// Write the hash for a path into `sink` in the fixed interchange layout
    /// (digest id + length + digest bytes), regardless of the serving tier.
    /// Returns false when the path has no hash yet.
    pub fn load_and_write_hash(&self, path: i64, sink: &mut impl Write) -> Result<bool> {
        match self.load_hash(path)? {
            Some(hash) => {
                hash.write_to(sink)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Write a self-contained point-in-time copy of this table into
    /// `target_dir`. At most one snapshot may run at a time; a concurrent
    /// call fails immediately with `SnapshotInProgress`.
    pub fn snapshot(&self, target_dir: &Path) -> Result<()> {
        self.ensure_open()?;
        if self
            .snapshot_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VirtaError::SnapshotInProgress);
        }
        let result = self.run_snapshot(target_dir);
        self.snapshot_in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn run_snapshot(&self, target_dir: &Path) -> Result<()> {
        // Hold compaction off its index switch-over and file removal so the
        // copied file sets and indices agree
        self.pause_gate.pause();
        let result = self.copy_state_to(target_dir);
        self.pause_gate.resume();
        match &result {
            Ok(()) => info!(table = %self.label, dir = %target_dir.display(), "snapshot written"),
            Err(e) => error!(table = %self.label, error = %e, "snapshot failed"),
        }
        result
    }

    fn copy_state_to(&self, target_dir: &Path) -> Result<()> {
        let target = TablePaths::new(target_dir);
        target.create_dirs()?;
        let stores = &self.stores;

        let task_results: Vec<(&str, Result<()>)> = crossbeam::thread::scope(|s| {
            let handles = vec![
                (
                    "pathToDiskLocationInternalNodes",
                    s.spawn(|_| {
                        stores
                            .internal_index
                            .write_to_file(&target.internal_nodes_index_file())
                    }),
                ),
                (
                    "pathToDiskLocationLeafNodes",
                    s.spawn(|_| {
                        stores
                            .leaf_index
                            .write_to_file(&target.leaf_nodes_index_file())
                    }),
                ),
                (
                    "internalHashStoreRam",
                    s.spawn(|_| stores.hash_list.write_to_file(&target.hash_list_file())),
                ),
                (
                    "internalHashStoreDisk",
                    s.spawn(|_| stores.hash_store_disk.snapshot(&target.hash_store_disk_dir())),
                ),
                (
                    "objectKeyToPath",
                    s.spawn(|_| stores.key_to_path.snapshot(&target.key_to_path_dir())),
                ),
                (
                    "pathToHashKeyValue",
                    s.spawn(|_| stores.path_to_leaf.snapshot(&target.path_to_leaf_dir())),
                ),
            ];
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(VirtaError::InvalidState(format!(
                            "snapshot task {} panicked",
                            name
                        )))
                    });
                    (name, result)
                })
                .collect()
        })
        .map_err(|_| VirtaError::InvalidState("snapshot fan-out panicked".to_string()))?;

        // Every task runs to completion; the first failure wins after all
        // have been logged
        let mut first_error = None;
        for (name, result) in task_results {
            if let Err(e) = result {
                error!(table = %self.label, task = name, error = %e, "snapshot task failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // Metadata goes last: a snapshot directory with metadata present is
        // complete
        write_blob(&target.config_file(), &self.table_config.to_bytes())?;
        write_blob(
            &target.metadata_file(),
            &encode_table_metadata(&self.valid_range.read()),
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close the data source. Idempotent; all operations fail afterwards.
    /// With `keep_data` the directory stays reopenable (indices, the RAM
    /// hash list and the metadata are persisted); without it the table
    /// directory is deleted.
    pub fn close(&self, keep_data: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Compaction first; an overdue stop is logged but never blocks close
        if let Err(e) = self
            .coordinator
            .lock()
            .stop(self.config.compaction_stop_timeout)
        {
            error!(table = %self.label, error = %e, "background compaction did not stop in time");
        }

        // Flush workers must drain before any file is closed; a timeout here
        // is a hard failure
        let workers = [
            self.hash_worker.lock().take(),
            self.leaf_worker.lock().take(),
        ];
        for mut worker in workers.into_iter().flatten() {
            worker.shutdown(self.config.worker_shutdown_timeout)?;
        }

        if keep_data {
            self.persist_durable_state()?;
        }

        for (name, result) in [
            ("internalHashStoreDisk", self.stores.hash_store_disk.close()),
            ("objectKeyToPath", self.stores.key_to_path.close()),
            ("pathToHashKeyValue", self.stores.path_to_leaf.close()),
        ] {
            if let Err(e) = result {
                warn!(table = %self.label, store = name, error = %e, "error closing store");
            }
        }

        OPEN_DATA_SOURCES.fetch_sub(1, Ordering::SeqCst);
        if !keep_data {
            if let Err(e) = std::fs::remove_dir_all(self.paths.dir()) {
                warn!(table = %self.label, error = %e, "could not delete table directory");
            }
        }
        info!(table = %self.label, keep_data, "data source closed");
        Ok(())
    }

    /// Make the live directory reopenable: index side-files, the RAM hash
    /// list and the metadata blob
    fn persist_durable_state(&self) -> Result<()> {
        self.stores
            .internal_index
            .write_to_file(&self.paths.internal_nodes_index_file())?;
        self.stores
            .leaf_index
            .write_to_file(&self.paths.leaf_nodes_index_file())?;
        self.stores.key_to_path.persist_index()?;
        self.stores
            .hash_list
            .write_to_file(&self.paths.hash_list_file())?;
        write_blob(&self.paths.config_file(), &self.table_config.to_bytes())?;
        write_blob(
            &self.paths.metadata_file(),
            &encode_table_metadata(&self.valid_range.read()),
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn table_config(&self) -> &TableConfig {
        &self.table_config
    }

    /// First valid leaf path, or -1 for an empty table
    pub fn first_leaf_path(&self) -> i64 {
        self.valid_range.read().min_valid_key()
    }

    /// Last valid leaf path, or -1 for an empty table
    pub fn last_leaf_path(&self) -> i64 {
        self.valid_range.read().max_valid_key()
    }

    /// Process-wide number of open data sources
    pub fn count_of_open_databases() -> usize {
        OPEN_DATA_SOURCES.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Flush tasks
// =============================================================================

fn write_hashes(stores: &Stores, records: Vec<HashRecord>) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let any_disk = records.iter().any(|r| r.path >= stores.hash_threshold);
    if any_disk {
        stores.hash_store_disk.start_writing()?;
    }
    for record in records {
        if record.path < stores.hash_threshold {
            stores.hash_list.put(record.path, record.hash)?;
        } else {
            let bytes = record.to_bytes();
            stores.hash_store_disk.put(record.path, &bytes)?;
        }
    }
    if any_disk {
        stores.hash_store_disk.end_writing()?;
    }
    Ok(())
}

fn write_leaves(
    stores: &Stores,
    mut upserts: Vec<LeafRecord>,
    deletes: Vec<LeafRecord>,
    is_reconnect: bool,
) -> Result<()> {
    if upserts.is_empty() && deletes.is_empty() {
        return Ok(());
    }
    upserts.sort_by_key(|record| record.path);

    let writing_leaves = !upserts.is_empty();
    if writing_leaves {
        stores.path_to_leaf.start_writing()?;
    }
    stores.key_to_path.start_writing()?;

    for record in &upserts {
        stores.path_to_leaf.put(record.path, &record.to_bytes())?;
        stores
            .key_to_path
            .put(record.key_bytes.clone(), record.key_hash_code, record.path)?;
    }
    for record in &deletes {
        if is_reconnect {
            stores.key_to_path.delete_if_equal(
                record.key_bytes.clone(),
                record.key_hash_code,
                record.path,
            )?;
        } else {
            stores
                .key_to_path
                .delete(record.key_bytes.clone(), record.key_hash_code)?;
        }
    }

    stores.key_to_path.end_writing()?;
    if writing_leaves {
        stores.path_to_leaf.end_writing()?;
    }

    // Invalidate after the writes are applied, so no stale entry outlives
    // the batch that touched its key
    for record in upserts.iter().chain(deletes.iter()) {
        stores.cache.invalidate(&record.key_bytes, record.key_hash_code);
    }
    Ok(())
}
