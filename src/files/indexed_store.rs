//! Indexed key-value store
//!
//! Glue between a disk location index and a data file collection: a
//! long-keyed store whose values live in append-only files and whose index
//! fits the `LongIndex` contract. Backs the path-to-leaf store and the disk
//! tier of the hash store.

use std::path::Path;
use std::sync::Arc;

use crate::collections::LongIndex;
use crate::error::{Result, VirtaError};
use crate::files::DataFileCollection;

/// Number of times a read retries when its file was compacted away between
/// the index lookup and the file lookup
const READ_RETRIES: usize = 5;

pub struct IndexedStore {
    name: String,
    index: Arc<dyn LongIndex>,
    files: Arc<DataFileCollection>,
}

impl IndexedStore {
    /// Open or create a store in `dir`.
    ///
    /// If existing data files are found and `loaded_callback` is given, every
    /// stored item is replayed through it before the store is used — this is
    /// how a missing index side-file is rebuilt on restore.
    pub fn open(
        dir: &Path,
        name: &str,
        index: Arc<dyn LongIndex>,
        loaded_callback: Option<&mut dyn FnMut(u64, &[u8]) -> Result<()>>,
    ) -> Result<Self> {
        let (files, loaded_from_existing) = DataFileCollection::open(dir, name)?;
        if loaded_from_existing {
            if let Some(callback) = loaded_callback {
                files.for_each_item(callback)?;
            }
        }
        Ok(Self {
            name: name.to_string(),
            index,
            files: Arc::new(files),
        })
    }

    /// Get the value stored for `key`, if any.
    ///
    /// Retries the index lookup when the referenced file has been compacted
    /// away in between — the index entry is CAS-updated before file removal,
    /// so a fresh lookup always lands in a live file.
    pub fn get(&self, key: i64) -> Result<Option<Vec<u8>>> {
        for _ in 0..READ_RETRIES {
            let Some(location) = self.index.get(key) else {
                return Ok(None);
            };
            match self.files.read_data_item(location) {
                Ok(data) => return Ok(Some(data)),
                Err(VirtaError::Storage { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(VirtaError::storage(
            &self.name,
            format!("gave up reading key {} after {} retries", key, READ_RETRIES),
        ))
    }

    /// Store a value for `key` within the open writing session
    pub fn put(&self, key: i64, data: &[u8]) -> Result<()> {
        let location = self.files.store_data_item(data)?;
        self.index.put(key, location)
    }

    /// Begin a writing session (one new data file)
    pub fn start_writing(&self) -> Result<()> {
        self.files.start_writing()
    }

    /// Complete the writing session and make the new file durable
    pub fn end_writing(&self) -> Result<()> {
        self.files.end_writing()?;
        Ok(())
    }

    /// Update the valid key range, truncating index entries outside it
    pub fn update_valid_key_range(&self, min: i64, max: i64) -> Result<()> {
        self.index.update_valid_range(min, max)
    }

    /// Copy the store's durable state (completed data files) into `target_dir`
    pub fn snapshot(&self, target_dir: &Path) -> Result<()> {
        self.files.snapshot(target_dir)
    }

    /// Release resources. The index is owned by the caller and closed
    /// separately.
    pub fn close(&self) -> Result<()> {
        Ok(())
    }

    pub fn index(&self) -> &Arc<dyn LongIndex> {
        &self.index
    }

    pub fn file_collection(&self) -> &Arc<DataFileCollection> {
        &self.files
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::MemLongIndex;
    use tempfile::TempDir;

    fn new_store(dir: &Path) -> IndexedStore {
        let index = Arc::new(MemLongIndex::new(1024));
        index.update_valid_range(0, 1_000).unwrap();
        IndexedStore::open(dir, "teststore", index, None).unwrap()
    }

    #[test]
    fn put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = new_store(dir.path());

        store.start_writing().unwrap();
        store.put(7, b"seven").unwrap();
        store.put(9, b"nine").unwrap();
        store.end_writing().unwrap();

        assert_eq!(store.get(7).unwrap().unwrap(), b"seven");
        assert_eq!(store.get(9).unwrap().unwrap(), b"nine");
        assert_eq!(store.get(8).unwrap(), None);
    }

    #[test]
    fn newer_session_wins() {
        let dir = TempDir::new().unwrap();
        let store = new_store(dir.path());

        store.start_writing().unwrap();
        store.put(7, b"old").unwrap();
        store.end_writing().unwrap();

        store.start_writing().unwrap();
        store.put(7, b"new").unwrap();
        store.end_writing().unwrap();

        assert_eq!(store.get(7).unwrap().unwrap(), b"new");
    }

    #[test]
    fn range_truncation_hides_entries() {
        let dir = TempDir::new().unwrap();
        let store = new_store(dir.path());

        store.start_writing().unwrap();
        store.put(7, b"seven").unwrap();
        store.put(500, b"five hundred").unwrap();
        store.end_writing().unwrap();

        store.update_valid_key_range(0, 100).unwrap();
        assert_eq!(store.get(500).unwrap(), None);
        assert_eq!(store.get(7).unwrap().unwrap(), b"seven");
    }

    #[test]
    fn rebuild_index_by_replay() {
        let dir = TempDir::new().unwrap();
        {
            let store = new_store(dir.path());
            store.start_writing().unwrap();
            store.put(3, b"three").unwrap();
            store.end_writing().unwrap();
        }

        // Fresh empty index; replay callback repopulates it from the files
        let index: Arc<dyn LongIndex> = Arc::new(MemLongIndex::new(1024));
        index.update_valid_range(0, 1_000).unwrap();
        let replay_index = index.clone();
        let mut callback = move |location: u64, _data: &[u8]| replay_index.put(3, location);
        let store =
            IndexedStore::open(dir.path(), "teststore", index, Some(&mut callback)).unwrap();
        assert_eq!(store.get(3).unwrap().unwrap(), b"three");
    }
}
