//! Long index implementations
//!
//! A `LongIndex` is a growable array of 64-bit locations addressed by path.
//! Slot value 0 means "empty"; callers must store non-zero locations (data
//! file locations always carry a non-zero file id, so this holds by
//! construction).
//!
//! ## Side-file format (little-endian)
//! ```text
//! ┌───────────┬─────────┬─────────┬──────────────────────────────┐
//! │ magic (4) │ min (8) │ max (8) │ slots for min..=max (8 each) │
//! └───────────┴─────────┴─────────┴──────────────────────────────┘
//! ```
//! Both backings read and write the same format, so a table can switch
//! strategies between restarts.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, VirtaError};

/// Slot value meaning "no entry"
const EMPTY: u64 = 0;

/// Side-file magic: "VKLI"
const SIDE_FILE_MAGIC: u32 = 0x564b_4c49;

/// Disk Location Index contract
///
/// All methods take `&self`; implementations are safe for concurrent readers
/// and writers. `put_if_equal` is the compare-and-set used by compaction to
/// move an entry without clobbering a concurrent flush.
pub trait LongIndex: Send + Sync {
    /// Get the location stored for `index`, if any
    fn get(&self, index: i64) -> Option<u64>;

    /// Store a non-zero location for `index`. Fails outside the valid range.
    fn put(&self, index: i64, value: u64) -> Result<()>;

    /// Replace the location for `index` only if it still equals `old`
    fn put_if_equal(&self, index: i64, old: u64, new: u64) -> bool;

    /// Clear the entry for `index`
    fn remove(&self, index: i64);

    /// Number of occupied slots
    fn size(&self) -> u64;

    fn min_valid_index(&self) -> i64;

    fn max_valid_index(&self) -> i64;

    /// Truncate or extend the valid range. Entries outside the new range are
    /// discarded; entries inside it are untouched.
    fn update_valid_range(&self, min: i64, max: i64) -> Result<()>;

    /// Write the full content (valid range + in-range slots) to a side file
    fn write_to_file(&self, path: &Path) -> Result<()>;
}

fn check_range(min: i64, max: i64) -> Result<()> {
    let invalid_sentinel = min == -1 && max == -1;
    if !invalid_sentinel && (min < 0 || max < min) {
        return Err(VirtaError::InvalidArgument(format!(
            "Invalid range {} - {}",
            min, max
        )));
    }
    Ok(())
}

fn check_put(index: i64, value: u64, min: i64, max: i64) -> Result<()> {
    if value == EMPTY {
        return Err(VirtaError::InvalidArgument(
            "Location 0 is reserved for empty slots".to_string(),
        ));
    }
    if index < min || index > max {
        return Err(VirtaError::InvalidArgument(format!(
            "Index {} is outside the valid range {} - {}",
            index, min, max
        )));
    }
    Ok(())
}

// =============================================================================
// Side-file I/O (shared by both backings)
// =============================================================================

struct SideFile {
    min: i64,
    max: i64,
    slots: Vec<u64>,
}

fn read_side_file(path: &Path) -> Result<SideFile> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut word = [0u8; 8];
    let mut magic_bytes = [0u8; 4];

    reader.read_exact(&mut magic_bytes)?;
    let magic = u32::from_le_bytes(magic_bytes);
    if magic != SIDE_FILE_MAGIC {
        return Err(VirtaError::Corruption(format!(
            "Bad index side-file magic: {:#x}",
            magic
        )));
    }
    reader.read_exact(&mut word)?;
    let min = i64::from_le_bytes(word);
    reader.read_exact(&mut word)?;
    let max = i64::from_le_bytes(word);
    check_range(min, max)?;

    let count = if min >= 0 { (max - min + 1) as usize } else { 0 };
    let mut slots = Vec::with_capacity(count);
    for _ in 0..count {
        reader.read_exact(&mut word)?;
        slots.push(u64::from_le_bytes(word));
    }
    Ok(SideFile { min, max, slots })
}

fn write_side_file(
    path: &Path,
    min: i64,
    max: i64,
    mut slot_at: impl FnMut(i64) -> u64,
) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&SIDE_FILE_MAGIC.to_le_bytes())?;
    writer.write_all(&min.to_le_bytes())?;
    writer.write_all(&max.to_le_bytes())?;
    if min >= 0 {
        for index in min..=max {
            writer.write_all(&slot_at(index).to_le_bytes())?;
        }
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

// =============================================================================
// In-memory backing
// =============================================================================

type Chunk = Arc<Vec<AtomicU64>>;

/// In-memory long index: chunks of atomics, allocated on demand
///
/// Reads are lock-free once a chunk exists; the chunk list lock is only
/// taken for growth and truncation.
pub struct MemLongIndex {
    chunk_size: usize,
    chunks: RwLock<Vec<Option<Chunk>>>,
    size: AtomicU64,
    min_valid: AtomicI64,
    max_valid: AtomicI64,
}

impl MemLongIndex {
    /// Create an empty index with the invalid range
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunks: RwLock::new(Vec::new()),
            size: AtomicU64::new(0),
            min_valid: AtomicI64::new(-1),
            max_valid: AtomicI64::new(-1),
        }
    }

    /// Load an index from its side file, replacing any previous state
    pub fn from_file(path: &Path, chunk_size: usize) -> Result<Self> {
        let side = read_side_file(path)?;
        let index = Self::new(chunk_size);
        index.min_valid.store(side.min, Ordering::Release);
        index.max_valid.store(side.max, Ordering::Release);
        if side.min >= 0 {
            for (offset, &value) in side.slots.iter().enumerate() {
                if value != EMPTY {
                    index.put(side.min + offset as i64, value)?;
                }
            }
        }
        Ok(index)
    }

    fn slot(&self, index: i64) -> Option<(Chunk, usize)> {
        if index < 0 {
            return None;
        }
        let chunk_index = index as usize / self.chunk_size;
        let sub_index = index as usize % self.chunk_size;
        let chunks = self.chunks.read();
        let chunk = chunks.get(chunk_index)?.clone()?;
        Some((chunk, sub_index))
    }

    fn slot_or_create(&self, index: i64) -> (Chunk, usize) {
        let chunk_index = index as usize / self.chunk_size;
        let sub_index = index as usize % self.chunk_size;
        {
            let chunks = self.chunks.read();
            if let Some(Some(chunk)) = chunks.get(chunk_index) {
                return (chunk.clone(), sub_index);
            }
        }
        let mut chunks = self.chunks.write();
        if chunks.len() <= chunk_index {
            chunks.resize(chunk_index + 1, None);
        }
        let chunk = chunks[chunk_index].get_or_insert_with(|| {
            Arc::new((0..self.chunk_size).map(|_| AtomicU64::new(EMPTY)).collect())
        });
        (chunk.clone(), sub_index)
    }

    /// Clear a slot in a kept chunk, keeping the size counter accurate
    fn clear_slot(&self, chunk: &Chunk, sub_index: usize) {
        let old = chunk[sub_index].swap(EMPTY, Ordering::AcqRel);
        if old != EMPTY {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl LongIndex for MemLongIndex {
    fn get(&self, index: i64) -> Option<u64> {
        if index < self.min_valid.load(Ordering::Acquire)
            || index > self.max_valid.load(Ordering::Acquire)
        {
            return None;
        }
        let (chunk, sub_index) = self.slot(index)?;
        match chunk[sub_index].load(Ordering::Acquire) {
            EMPTY => None,
            value => Some(value),
        }
    }

    fn put(&self, index: i64, value: u64) -> Result<()> {
        check_put(
            index,
            value,
            self.min_valid.load(Ordering::Acquire),
            self.max_valid.load(Ordering::Acquire),
        )?;
        let (chunk, sub_index) = self.slot_or_create(index);
        let old = chunk[sub_index].swap(value, Ordering::AcqRel);
        if old == EMPTY {
            self.size.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn put_if_equal(&self, index: i64, old: u64, new: u64) -> bool {
        if new == EMPTY {
            return false;
        }
        match self.slot(index) {
            Some((chunk, sub_index)) => chunk[sub_index]
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    fn remove(&self, index: i64) {
        if let Some((chunk, sub_index)) = self.slot(index) {
            self.clear_slot(&chunk, sub_index);
        }
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn min_valid_index(&self) -> i64 {
        self.min_valid.load(Ordering::Acquire)
    }

    fn max_valid_index(&self) -> i64 {
        self.max_valid.load(Ordering::Acquire)
    }

    fn update_valid_range(&self, min: i64, max: i64) -> Result<()> {
        check_range(min, max)?;
        self.min_valid.store(min, Ordering::Release);
        self.max_valid.store(max, Ordering::Release);

        // Truncate backing storage: free whole chunks outside the new range,
        // clear out-of-range slots in the boundary chunks
        let mut chunks = self.chunks.write();
        for (chunk_index, entry) in chunks.iter_mut().enumerate() {
            let Some(chunk) = entry else { continue };
            let first = (chunk_index * self.chunk_size) as i64;
            let last = first + self.chunk_size as i64 - 1;
            if min < 0 || last < min || first > max {
                for slot in chunk.iter() {
                    if slot.swap(EMPTY, Ordering::AcqRel) != EMPTY {
                        self.size.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                *entry = None;
            } else {
                let chunk = chunk.clone();
                for index in first..=last {
                    if index < min || index > max {
                        self.clear_slot(&chunk, (index - first) as usize);
                    }
                }
            }
        }
        Ok(())
    }

    fn write_to_file(&self, path: &Path) -> Result<()> {
        let min = self.min_valid.load(Ordering::Acquire);
        let max = self.max_valid.load(Ordering::Acquire);
        write_side_file(path, min, max, |index| {
            self.slot(index)
                .map(|(chunk, sub)| chunk[sub].load(Ordering::Acquire))
                .unwrap_or(EMPTY)
        })
    }
}

// =============================================================================
// Disk backing
// =============================================================================

/// Header of the working file: magic only; range is kept in memory and
/// persisted through the side file
const DISK_HEADER_SIZE: u64 = 4;

/// Disk-backed long index: slots live in a sparse working file, addressed by
/// positioned I/O. Slower than the in-memory backing but unbounded.
pub struct DiskLongIndex {
    file: File,
    /// Serializes read-modify-write cycles (put_if_equal has no atomic pwrite)
    write_lock: Mutex<()>,
    size: AtomicU64,
    min_valid: AtomicI64,
    max_valid: AtomicI64,
}

impl DiskLongIndex {
    /// Create an empty index backed by a fresh working file
    pub fn create(work_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(work_path)?;
        file.write_all_at(&SIDE_FILE_MAGIC.to_le_bytes(), 0)?;
        Ok(Self {
            file,
            write_lock: Mutex::new(()),
            size: AtomicU64::new(0),
            min_valid: AtomicI64::new(-1),
            max_valid: AtomicI64::new(-1),
        })
    }

    /// Load an index from a side file into a fresh working file
    pub fn from_file(side_path: &Path, work_path: &Path) -> Result<Self> {
        let side = read_side_file(side_path)?;
        let index = Self::create(work_path)?;
        index.min_valid.store(side.min, Ordering::Release);
        index.max_valid.store(side.max, Ordering::Release);
        if side.min >= 0 {
            for (offset, &value) in side.slots.iter().enumerate() {
                if value != EMPTY {
                    index.put(side.min + offset as i64, value)?;
                }
            }
        }
        Ok(index)
    }

    fn offset_of(index: i64) -> u64 {
        DISK_HEADER_SIZE + (index as u64) * 8
    }

    fn read_slot(&self, index: i64) -> u64 {
        let mut word = [0u8; 8];
        // Short reads past EOF mean the slot was never written
        match self.file.read_at(&mut word, Self::offset_of(index)) {
            Ok(8) => u64::from_le_bytes(word),
            _ => EMPTY,
        }
    }

    fn write_slot(&self, index: i64, value: u64) -> Result<()> {
        self.file
            .write_all_at(&value.to_le_bytes(), Self::offset_of(index))?;
        Ok(())
    }
}

impl LongIndex for DiskLongIndex {
    fn get(&self, index: i64) -> Option<u64> {
        if index < self.min_valid.load(Ordering::Acquire)
            || index > self.max_valid.load(Ordering::Acquire)
        {
            return None;
        }
        match self.read_slot(index) {
            EMPTY => None,
            value => Some(value),
        }
    }

    fn put(&self, index: i64, value: u64) -> Result<()> {
        check_put(
            index,
            value,
            self.min_valid.load(Ordering::Acquire),
            self.max_valid.load(Ordering::Acquire),
        )?;
        let _guard = self.write_lock.lock();
        let old = self.read_slot(index);
        self.write_slot(index, value)?;
        if old == EMPTY {
            self.size.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn put_if_equal(&self, index: i64, old: u64, new: u64) -> bool {
        if new == EMPTY || index < 0 {
            return false;
        }
        let _guard = self.write_lock.lock();
        if self.read_slot(index) != old {
            return false;
        }
        self.write_slot(index, new).is_ok()
    }

    fn remove(&self, index: i64) {
        if index < 0 {
            return;
        }
        let _guard = self.write_lock.lock();
        if self.read_slot(index) != EMPTY {
            let _ = self.write_slot(index, EMPTY);
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn min_valid_index(&self) -> i64 {
        self.min_valid.load(Ordering::Acquire)
    }

    fn max_valid_index(&self) -> i64 {
        self.max_valid.load(Ordering::Acquire)
    }

    fn update_valid_range(&self, min: i64, max: i64) -> Result<()> {
        check_range(min, max)?;
        let old_min = self.min_valid.swap(min, Ordering::AcqRel);
        let old_max = self.max_valid.swap(max, Ordering::AcqRel);
        // Clear slots that fell out of the range so size stays accurate
        if old_min >= 0 {
            let _guard = self.write_lock.lock();
            for index in old_min..=old_max {
                if (min < 0 || index < min || index > max) && self.read_slot(index) != EMPTY {
                    self.write_slot(index, EMPTY)?;
                    self.size.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        Ok(())
    }

    fn write_to_file(&self, path: &Path) -> Result<()> {
        let min = self.min_valid.load(Ordering::Acquire);
        let max = self.max_valid.load(Ordering::Acquire);
        write_side_file(path, min, max, |index| self.read_slot(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(index: &dyn LongIndex) {
        index.update_valid_range(0, 1000).unwrap();
        assert_eq!(index.get(5), None);
        index.put(5, 77).unwrap();
        index.put(900, 42).unwrap();
        assert_eq!(index.get(5), Some(77));
        assert_eq!(index.get(900), Some(42));
        assert_eq!(index.size(), 2);

        // CAS only succeeds against the current value
        assert!(!index.put_if_equal(5, 1, 99));
        assert!(index.put_if_equal(5, 77, 99));
        assert_eq!(index.get(5), Some(99));

        index.remove(5);
        assert_eq!(index.get(5), None);
        assert_eq!(index.size(), 1);

        // Truncation discards out-of-range entries
        index.put(5, 11).unwrap();
        index.update_valid_range(0, 100).unwrap();
        assert_eq!(index.get(900), None);
        assert_eq!(index.get(5), Some(11));
        assert_eq!(index.size(), 1);

        assert!(index.put(200, 1).is_err());
        assert!(index.put(5, 0).is_err());
    }

    #[test]
    fn mem_index_basics() {
        let index = MemLongIndex::new(64);
        exercise(&index);
    }

    #[test]
    fn disk_index_basics() {
        let dir = TempDir::new().unwrap();
        let index = DiskLongIndex::create(&dir.path().join("work.idx")).unwrap();
        exercise(&index);
    }

    #[test]
    fn side_file_round_trip_across_backings() {
        let dir = TempDir::new().unwrap();
        let side = dir.path().join("index.side");

        let mem = MemLongIndex::new(16);
        mem.update_valid_range(10, 50).unwrap();
        mem.put(10, 1).unwrap();
        mem.put(33, 2).unwrap();
        mem.put(50, 3).unwrap();
        mem.write_to_file(&side).unwrap();

        let disk = DiskLongIndex::from_file(&side, &dir.path().join("work.idx")).unwrap();
        assert_eq!(disk.min_valid_index(), 10);
        assert_eq!(disk.max_valid_index(), 50);
        assert_eq!(disk.get(10), Some(1));
        assert_eq!(disk.get(33), Some(2));
        assert_eq!(disk.get(50), Some(3));
        assert_eq!(disk.size(), 3);

        let reloaded = MemLongIndex::from_file(&side, 16).unwrap();
        assert_eq!(reloaded.get(33), Some(2));
        assert_eq!(reloaded.size(), 3);
    }

    #[test]
    fn invalid_range_round_trip() {
        let dir = TempDir::new().unwrap();
        let side = dir.path().join("empty.side");
        let mem = MemLongIndex::new(16);
        mem.write_to_file(&side).unwrap();
        let reloaded = MemLongIndex::from_file(&side, 16).unwrap();
        assert_eq!(reloaded.min_valid_index(), -1);
        assert_eq!(reloaded.max_valid_index(), -1);
        assert_eq!(reloaded.size(), 0);
    }
}
