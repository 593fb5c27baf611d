//! In-memory hash list
//!
//! RAM tier of the hash store: hashes for the hot low-numbered paths are
//! held in memory in chunked storage and persisted wholesale to a side-file
//! at snapshot time. Paths at or above the configured threshold go to the
//! disk tier instead (see `datasource`).

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{Result, VirtaError};
use crate::records::{DigestType, Hash};

/// Hash list side-file magic: "VKHL"
const HASH_FILE_MAGIC: u32 = 0x564b_484c;

type Chunk = RwLock<Vec<Option<Hash>>>;

pub struct HashList {
    digest_type: DigestType,
    chunk_size: usize,
    chunks: RwLock<Vec<Arc<Chunk>>>,
    /// Highest path ever stored plus one
    size: AtomicI64,
}

impl HashList {
    pub fn new(digest_type: DigestType, chunk_size: usize) -> Self {
        Self {
            digest_type,
            chunk_size,
            chunks: RwLock::new(Vec::new()),
            size: AtomicI64::new(0),
        }
    }

    /// Number of path slots covered, i.e. highest stored path plus one
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn get(&self, path: i64) -> Option<Hash> {
        if path < 0 || path >= self.size() {
            return None;
        }
        let chunk_index = (path as usize) / self.chunk_size;
        let chunk = self.chunks.read().get(chunk_index)?.clone();
        let slot = (path as usize) % self.chunk_size;
        let hash = chunk.read()[slot].clone();
        hash
    }

    pub fn put(&self, path: i64, hash: Hash) -> Result<()> {
        if path < 0 {
            return Err(VirtaError::InvalidArgument(format!(
                "Path must be non-negative, got {}",
                path
            )));
        }
        let chunk_index = (path as usize) / self.chunk_size;
        let chunk = {
            let chunks = self.chunks.read();
            chunks.get(chunk_index).cloned()
        };
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => {
                let mut chunks = self.chunks.write();
                while chunks.len() <= chunk_index {
                    chunks.push(Arc::new(RwLock::new(vec![None; self.chunk_size])));
                }
                chunks[chunk_index].clone()
            }
        };
        let slot = (path as usize) % self.chunk_size;
        chunk.write()[slot] = Some(hash);
        self.size.fetch_max(path + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Persist the full list to `path`:
    /// `[magic (4)][digest id (4)][size (8)]` then one presence byte plus,
    /// if present, the raw digest per slot.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&HASH_FILE_MAGIC.to_le_bytes())?;
        out.write_all(&self.digest_type.id().to_le_bytes())?;
        let size = self.size();
        out.write_all(&size.to_le_bytes())?;
        for path in 0..size {
            match self.get(path) {
                Some(hash) => {
                    out.write_all(&[1])?;
                    out.write_all(hash.bytes())?;
                }
                None => out.write_all(&[0])?,
            }
        }
        out.flush()?;
        out.into_inner()
            .map_err(|e| VirtaError::Io(e.into_error()))?
            .sync_all()?;
        Ok(())
    }

    /// Load a list previously written by `write_to_file`
    pub fn from_file(path: &Path, chunk_size: usize) -> Result<Self> {
        let mut input = BufReader::new(File::open(path)?);
        let mut header = [0u8; 16];
        input.read_exact(&mut header)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != HASH_FILE_MAGIC {
            return Err(VirtaError::Corruption(format!(
                "Bad hash list magic in {}: {:#x}",
                path.display(),
                magic
            )));
        }
        let digest_id = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let digest_type = DigestType::from_id(digest_id)?;
        let size = i64::from_le_bytes([
            header[8], header[9], header[10], header[11], header[12], header[13], header[14],
            header[15],
        ]);
        if size < 0 {
            return Err(VirtaError::Corruption(format!(
                "Negative hash list size in {}: {}",
                path.display(),
                size
            )));
        }

        let list = Self::new(digest_type, chunk_size);
        let digest_size = digest_type.size();
        let mut digest = vec![0u8; digest_size];
        for slot in 0..size {
            let mut present = [0u8; 1];
            input.read_exact(&mut present)?;
            if present[0] != 0 {
                input.read_exact(&mut digest)?;
                list.put(slot, Hash::new(digest_type, Bytes::copy_from_slice(&digest))?)?;
            }
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(fill: u8) -> Hash {
        Hash::new(DigestType::Sha384, Bytes::from(vec![fill; 48])).unwrap()
    }

    #[test]
    fn put_get_across_chunks() {
        let list = HashList::new(DigestType::Sha384, 4);
        list.put(0, hash(1)).unwrap();
        list.put(9, hash(2)).unwrap();
        assert_eq!(list.get(0).unwrap(), hash(1));
        assert_eq!(list.get(9).unwrap(), hash(2));
        assert_eq!(list.get(5), None);
        assert_eq!(list.get(10), None);
        assert_eq!(list.size(), 10);
    }

    #[test]
    fn negative_path_rejected() {
        let list = HashList::new(DigestType::Sha384, 4);
        assert!(list.put(-1, hash(1)).is_err());
        assert_eq!(list.get(-1), None);
    }

    #[test]
    fn file_round_trip_preserves_holes() {
        let dir = TempDir::new().unwrap();
        let side = dir.path().join("hashes.hl");

        let list = HashList::new(DigestType::Sha384, 4);
        list.put(1, hash(0xAA)).unwrap();
        list.put(7, hash(0xBB)).unwrap();
        list.write_to_file(&side).unwrap();

        let restored = HashList::from_file(&side, 16).unwrap();
        assert_eq!(restored.size(), 8);
        assert_eq!(restored.get(0), None);
        assert_eq!(restored.get(1).unwrap(), hash(0xAA));
        assert_eq!(restored.get(7).unwrap(), hash(0xBB));
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let side = dir.path().join("hashes.hl");
        std::fs::write(&side, vec![0u8; 32]).unwrap();
        assert!(matches!(
            HashList::from_file(&side, 16),
            Err(VirtaError::Corruption(_))
        ));
    }
}
