//! Data file collection
//!
//! A set of append-only generation files for one store. Writes go through
//! explicit sessions (`start_writing` / `store_data_item` / `end_writing`);
//! each session produces one new file. Completed files are immutable and are
//! only ever removed by compaction, after every live item has been copied to
//! a newer generation.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, VirtaError};

/// Data file magic: "VKDF"
const FILE_MAGIC: u32 = 0x564b_4446;

/// Header: magic (4) + file index (4)
const FILE_HEADER_SIZE: u64 = 8;

/// Item header: payload length (4) + crc32 (4)
const ITEM_HEADER_SIZE: u64 = 8;

/// Data file name extension
const FILE_EXTENSION: &str = "vdf";

/// Largest addressable file size; the byte offset half of a location is
/// 32 bits wide
const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Pack a (file index, offset) pair into a single location word
fn location(file_index: u32, offset: u64) -> u64 {
    ((file_index as u64) << 32) | offset
}

/// File index half of a location
pub fn location_file(location: u64) -> u32 {
    (location >> 32) as u32
}

/// Byte offset half of a location
fn location_offset(location: u64) -> u64 {
    location & 0xffff_ffff
}

// =============================================================================
// DataFile
// =============================================================================

/// One immutable (once completed) generation file
pub struct DataFile {
    index: u32,
    path: PathBuf,
    file: File,
}

impl DataFile {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut header = [0u8; 8];
        file.read_exact_at(&mut header, 0)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != FILE_MAGIC {
            return Err(VirtaError::Corruption(format!(
                "Bad data file magic in {}: {:#x}",
                path.display(),
                magic
            )));
        }
        let index = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        Ok(Self {
            index,
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and verify the item at `offset`
    fn read_item(&self, offset: u64) -> Result<Vec<u8>> {
        let mut header = [0u8; 8];
        self.file.read_exact_at(&mut header, offset)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut payload = vec![0u8; len];
        self.file.read_exact_at(&mut payload, offset + ITEM_HEADER_SIZE)?;
        if crc32fast::hash(&payload) != crc {
            return Err(VirtaError::Corruption(format!(
                "CRC mismatch at offset {} in {}",
                offset,
                self.path.display()
            )));
        }
        Ok(payload)
    }

    /// Replay every item in this file in write order
    pub fn for_each_item(
        &self,
        mut callback: impl FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let end = self.file.metadata()?.len();
        let mut offset = FILE_HEADER_SIZE;
        while offset < end {
            let payload = self.read_item(offset)?;
            callback(location(self.index, offset), &payload)?;
            offset += ITEM_HEADER_SIZE + payload.len() as u64;
        }
        Ok(())
    }
}

// =============================================================================
// Write sessions
// =============================================================================

/// In-progress flush session state
struct SessionWriter {
    file: Arc<DataFile>,
    writable: File,
    offset: u64,
}

/// Writer for a compaction output file. The file stays at a temporary path,
/// invisible to readers, until `finish` renames it into place; `abandon`
/// removes it, so a cancelled compaction never leaves a half-written file
/// visible.
pub struct CompactionWriter {
    index: u32,
    temp_path: PathBuf,
    final_path: PathBuf,
    file: File,
    offset: u64,
}

impl CompactionWriter {
    /// Append an item, returning the location it will have once the file is
    /// renamed into place
    pub fn store_item(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.offset;
        append_item(&self.file, &mut self.offset, data)?;
        Ok(location(self.index, offset))
    }

    /// Remove the temporary file without publishing it
    pub fn abandon(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path);
    }
}

fn append_item(file: &File, offset: &mut u64, data: &[u8]) -> Result<()> {
    let end = *offset + ITEM_HEADER_SIZE + data.len() as u64;
    if end > MAX_FILE_SIZE {
        return Err(VirtaError::InvalidState(format!(
            "data file full: item at offset {} would end at {}, past the {} byte limit",
            offset, end, MAX_FILE_SIZE
        )));
    }
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
    header[4..].copy_from_slice(&crc32fast::hash(data).to_le_bytes());
    file.write_all_at(&header, *offset)?;
    file.write_all_at(data, *offset + ITEM_HEADER_SIZE)?;
    *offset += ITEM_HEADER_SIZE + data.len() as u64;
    Ok(())
}

fn write_file_header(file: &File, index: u32) -> Result<()> {
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
    header[4..].copy_from_slice(&index.to_le_bytes());
    file.write_all_at(&header, 0)?;
    Ok(())
}

// =============================================================================
// DataFileCollection
// =============================================================================

/// The append-only file set of one store
pub struct DataFileCollection {
    store_name: String,
    dir: PathBuf,

    /// Completed (immutable) files by file index
    completed: RwLock<BTreeMap<u32, Arc<DataFile>>>,

    /// File of the in-progress flush session, readable while being written
    current: RwLock<Option<Arc<DataFile>>>,

    /// Session writer; locked for the duration of each append
    writer: Mutex<Option<SessionWriter>>,

    next_file_index: AtomicU32,
}

impl DataFileCollection {
    /// Open or create a collection in `dir`, discovering existing files.
    /// Returns the collection and whether any existing files were found.
    pub fn open(dir: &Path, store_name: &str) -> Result<(Self, bool)> {
        fs::create_dir_all(dir)?;

        let mut completed = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && Self::is_data_file(&path, store_name) {
                let data_file = DataFile::open(&path)?;
                completed.insert(data_file.index, Arc::new(data_file));
            }
        }
        let next_index = completed.keys().next_back().map(|&i| i + 1).unwrap_or(1);
        let loaded_from_existing = !completed.is_empty();

        Ok((
            Self {
                store_name: store_name.to_string(),
                dir: dir.to_path_buf(),
                completed: RwLock::new(completed),
                current: RwLock::new(None),
                writer: Mutex::new(None),
                next_file_index: AtomicU32::new(next_index),
            },
            loaded_from_existing,
        ))
    }

    fn is_data_file(path: &Path, store_name: &str) -> bool {
        if path.extension().map_or(true, |e| e != FILE_EXTENSION) {
            return false;
        }
        path.file_stem()
            .map(|stem| stem.to_string_lossy().starts_with(store_name))
            .unwrap_or(false)
    }

    fn file_path(&self, index: u32) -> PathBuf {
        self.dir
            .join(format!("{}_{:06}.{}", self.store_name, index, FILE_EXTENSION))
    }

    /// Begin a flush session with a fresh file
    pub fn start_writing(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Err(VirtaError::InvalidState(format!(
                "{}: writing session already open",
                self.store_name
            )));
        }
        let index = self.next_file_index.fetch_add(1, Ordering::SeqCst);
        let path = self.file_path(index);
        let writable = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        write_file_header(&writable, index)?;
        let data_file = Arc::new(DataFile {
            index,
            path,
            file: writable.try_clone()?,
        });
        *self.current.write() = Some(data_file.clone());
        *writer = Some(SessionWriter {
            file: data_file,
            writable,
            offset: FILE_HEADER_SIZE,
        });
        Ok(())
    }

    /// Append one item to the session file, returning its location
    pub fn store_data_item(&self, data: &[u8]) -> Result<u64> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| {
            VirtaError::InvalidState(format!("{}: no writing session open", self.store_name))
        })?;
        let offset = writer.offset;
        append_item(&writer.writable, &mut writer.offset, data)?;
        Ok(location(writer.file.index, offset))
    }

    /// Complete the session: sync the file and move it to the completed set
    pub fn end_writing(&self) -> Result<Arc<DataFile>> {
        let session = self.writer.lock().take().ok_or_else(|| {
            VirtaError::InvalidState(format!("{}: no writing session open", self.store_name))
        })?;
        session.writable.sync_all()?;
        *self.current.write() = None;
        let file = session.file;
        self.completed.write().insert(file.index, file.clone());
        Ok(file)
    }

    /// Read and verify the item at `location`. Fails with a storage error if
    /// the file is gone (compacted away); callers re-read the index and retry.
    pub fn read_data_item(&self, loc: u64) -> Result<Vec<u8>> {
        let file_index = location_file(loc);
        let file = {
            let completed = self.completed.read();
            match completed.get(&file_index) {
                Some(file) => Some(file.clone()),
                None => self
                    .current
                    .read()
                    .as_ref()
                    .filter(|f| f.index == file_index)
                    .cloned(),
            }
        };
        match file {
            Some(file) => file.read_item(location_offset(loc)),
            None => Err(VirtaError::storage(
                &self.store_name,
                format!("data file {} is gone", file_index),
            )),
        }
    }

    /// Snapshot of the completed files, oldest first
    pub fn completed_files(&self) -> Vec<Arc<DataFile>> {
        self.completed.read().values().cloned().collect()
    }

    pub fn completed_file_count(&self) -> usize {
        self.completed.read().len()
    }

    /// Allocate a compaction output file at a temporary path
    pub fn new_compaction_writer(&self) -> Result<CompactionWriter> {
        let index = self.next_file_index.fetch_add(1, Ordering::SeqCst);
        let final_path = self.file_path(index);
        let temp_path = final_path.with_extension("compact");
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&temp_path)?;
        write_file_header(&file, index)?;
        Ok(CompactionWriter {
            index,
            temp_path,
            final_path,
            file,
            offset: FILE_HEADER_SIZE,
        })
    }

    /// Publish a finished compaction file: sync, rename into place, register
    pub fn publish_compaction_file(&self, writer: CompactionWriter) -> Result<Arc<DataFile>> {
        writer.file.sync_all()?;
        fs::rename(&writer.temp_path, &writer.final_path)?;
        let file = Arc::new(DataFile {
            index: writer.index,
            path: writer.final_path,
            file: writer.file,
        });
        self.completed.write().insert(writer.index, file.clone());
        Ok(file)
    }

    /// Drop compacted-away files from the set and delete them from disk
    pub fn remove_files(&self, indices: &[u32]) -> Result<()> {
        let mut removed = Vec::new();
        {
            let mut completed = self.completed.write();
            for index in indices {
                if let Some(file) = completed.remove(index) {
                    removed.push(file);
                }
            }
        }
        for file in removed {
            fs::remove_file(file.path())?;
        }
        Ok(())
    }

    /// Copy all completed files into `target_dir` (hard link when possible)
    pub fn snapshot(&self, target_dir: &Path) -> Result<()> {
        fs::create_dir_all(target_dir)?;
        for file in self.completed_files() {
            let file_name = file.path().file_name().ok_or_else(|| {
                VirtaError::storage(&self.store_name, "data file without a name")
            })?;
            let target = target_dir.join(file_name);
            if fs::hard_link(file.path(), &target).is_err() {
                fs::copy(file.path(), &target)?;
            }
        }
        Ok(())
    }

    /// Replay every item of every completed file, oldest file first, in
    /// write order within each file. Used to rebuild a missing index.
    pub fn for_each_item(
        &self,
        mut callback: impl FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        for file in self.completed_files() {
            file.for_each_item(&mut callback)?;
        }
        Ok(())
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }
}
