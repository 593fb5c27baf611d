//! Table configuration and directory layout
//!
//! A table is one data source on disk: a directory holding the metadata and
//! config blobs, two index side-files, the RAM hash list side-file, and three
//! store directories. `TableConfig` is fixed at table creation and travels
//! with every snapshot, so a snapshot directory is self-describing.

use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::codec::{read_tag, read_varint, write_varint_field};
use crate::error::{Result, VirtaError};
use crate::range::KeyRange;
use crate::records::DigestType;

// =============================================================================
// TableConfig
// =============================================================================

/// Config wire format fields
const FIELD_HASH_VERSION: u32 = 1;
const FIELD_DIGEST_TYPE_ID: u32 = 2;
const FIELD_MAX_NUMBER_OF_KEYS: u32 = 3;
const FIELD_HASHES_RAM_TO_DISK_THRESHOLD: u32 = 4;
/// Legacy fields: serializer class ids and a disk-index preference flag.
/// Accepted on read, never written.
const FIELD_LEGACY_KEY_SERIALIZER: u32 = 5;
const FIELD_LEGACY_VALUE_SERIALIZER: u32 = 6;
const FIELD_LEGACY_PREFER_DISK_INDICES: u32 = 7;

/// Per-table configuration, immutable once the table exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    hash_version: i32,
    digest_type: DigestType,
    max_number_of_keys: i64,
    hashes_ram_to_disk_threshold: i64,
}

impl TableConfig {
    pub fn new(hash_version: i32, digest_type: DigestType) -> Self {
        Self {
            hash_version,
            digest_type,
            max_number_of_keys: 1_000_000,
            hashes_ram_to_disk_threshold: 0,
        }
    }

    /// Set the key capacity the table is sized for; must be positive
    pub fn max_number_of_keys(mut self, max: i64) -> Result<Self> {
        if max <= 0 {
            return Err(VirtaError::InvalidArgument(format!(
                "Max number of keys must be positive, got {}",
                max
            )));
        }
        self.max_number_of_keys = max;
        Ok(self)
    }

    /// Set the path threshold below which hashes are held in RAM; must be
    /// non-negative
    pub fn hashes_ram_to_disk_threshold(mut self, threshold: i64) -> Result<Self> {
        if threshold < 0 {
            return Err(VirtaError::InvalidArgument(format!(
                "Hashes RAM/disk threshold must be non-negative, got {}",
                threshold
            )));
        }
        self.hashes_ram_to_disk_threshold = threshold;
        Ok(self)
    }

    pub fn hash_version(&self) -> i32 {
        self.hash_version
    }

    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    pub fn get_max_number_of_keys(&self) -> i64 {
        self.max_number_of_keys
    }

    pub fn get_hashes_ram_to_disk_threshold(&self) -> i64 {
        self.hashes_ram_to_disk_threshold
    }

    /// Serialize to the tagged wire format. Field order is fixed and
    /// zero-valued fields are omitted, so equal configs encode identically.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint_field(&mut buf, FIELD_HASH_VERSION, self.hash_version as u32 as u64);
        write_varint_field(
            &mut buf,
            FIELD_DIGEST_TYPE_ID,
            self.digest_type.id() as u32 as u64,
        );
        write_varint_field(
            &mut buf,
            FIELD_MAX_NUMBER_OF_KEYS,
            self.max_number_of_keys as u64,
        );
        write_varint_field(
            &mut buf,
            FIELD_HASHES_RAM_TO_DISK_THRESHOLD,
            self.hashes_ram_to_disk_threshold as u64,
        );
        buf
    }

    /// Parse from the tagged wire format. Legacy fields are skipped; an
    /// unrecognized field number is a hard error.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let mut hash_version: i32 = 0;
        let mut digest_type_id: i32 = 0;
        let mut max_number_of_keys: i64 = 0;
        let mut threshold: i64 = 0;
        while !buf.is_empty() {
            let field = read_tag(&mut buf)?;
            let value = read_varint(&mut buf)?;
            match field {
                FIELD_HASH_VERSION => hash_version = value as u32 as i32,
                FIELD_DIGEST_TYPE_ID => digest_type_id = value as u32 as i32,
                FIELD_MAX_NUMBER_OF_KEYS => max_number_of_keys = value as i64,
                FIELD_HASHES_RAM_TO_DISK_THRESHOLD => threshold = value as i64,
                FIELD_LEGACY_KEY_SERIALIZER
                | FIELD_LEGACY_VALUE_SERIALIZER
                | FIELD_LEGACY_PREFER_DISK_INDICES => {}
                _ => {
                    return Err(VirtaError::Corruption(format!(
                        "Unknown table config field: {}",
                        field
                    )))
                }
            }
        }
        if max_number_of_keys <= 0 {
            return Err(VirtaError::Corruption(format!(
                "Table config max number of keys must be positive, got {}",
                max_number_of_keys
            )));
        }
        Ok(Self {
            hash_version,
            digest_type: DigestType::from_id(digest_type_id)?,
            max_number_of_keys,
            hashes_ram_to_disk_threshold: threshold,
        })
    }
}

// =============================================================================
// Table metadata (valid key range)
// =============================================================================

/// Metadata wire format fields
const FIELD_MIN_VALID_KEY: u32 = 1;
const FIELD_MAX_VALID_KEY: u32 = 2;

/// Encode the valid key range as tagged varints of the i64 bit patterns,
/// omitting zero values
pub fn encode_table_metadata(range: &KeyRange) -> Vec<u8> {
    let mut buf = Vec::new();
    write_varint_field(&mut buf, FIELD_MIN_VALID_KEY, range.min_valid_key() as u64);
    write_varint_field(&mut buf, FIELD_MAX_VALID_KEY, range.max_valid_key() as u64);
    buf
}

/// Decode table metadata; omitted fields default to zero, an unknown field
/// is a hard error
pub fn decode_table_metadata(data: &[u8]) -> Result<KeyRange> {
    let mut buf = data;
    let mut min: i64 = 0;
    let mut max: i64 = 0;
    while !buf.is_empty() {
        let field = read_tag(&mut buf)?;
        let value = read_varint(&mut buf)?;
        match field {
            FIELD_MIN_VALID_KEY => min = value as i64,
            FIELD_MAX_VALID_KEY => max = value as i64,
            _ => {
                return Err(VirtaError::Corruption(format!(
                    "Unknown table metadata field: {}",
                    field
                )))
            }
        }
    }
    KeyRange::new(min, max)
}

// =============================================================================
// TablePaths
// =============================================================================

/// File and directory names inside one table directory
#[derive(Debug, Clone)]
pub struct TablePaths {
    dir: PathBuf,
}

impl TablePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.dir.join("table_metadata")
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join("table_config")
    }

    /// Side-file of the internal-node (hash) disk location index
    pub fn internal_nodes_index_file(&self) -> PathBuf {
        self.dir.join("pathToDiskLocationInternalNodes")
    }

    pub fn internal_nodes_index_work_file(&self) -> PathBuf {
        self.dir.join("pathToDiskLocationInternalNodes.work")
    }

    /// Side-file of the leaf-node disk location index
    pub fn leaf_nodes_index_file(&self) -> PathBuf {
        self.dir.join("pathToDiskLocationLeafNodes")
    }

    pub fn leaf_nodes_index_work_file(&self) -> PathBuf {
        self.dir.join("pathToDiskLocationLeafNodes.work")
    }

    /// Side-file of the RAM hash list
    pub fn hash_list_file(&self) -> PathBuf {
        self.dir.join("internalHashStoreRam")
    }

    pub fn hash_store_disk_dir(&self) -> PathBuf {
        self.dir.join("internalHashStoreDisk")
    }

    pub fn key_to_path_dir(&self) -> PathBuf {
        self.dir.join("objectKeyToPath")
    }

    pub fn path_to_leaf_dir(&self) -> PathBuf {
        self.dir.join("pathToHashKeyValue")
    }

    pub fn create_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::create_dir_all(self.hash_store_disk_dir())?;
        std::fs::create_dir_all(self.key_to_path_dir())?;
        std::fs::create_dir_all(self.path_to_leaf_dir())?;
        Ok(())
    }
}

/// Write a small blob to a file atomically enough for our purposes: write to
/// a temp name, sync, rename over the target
pub(crate) fn write_blob(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn read_blob(path: &Path) -> Result<Bytes> {
    Ok(Bytes::from(std::fs::read(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{write_tag, write_varint};
    use crate::range::INVALID_KEY_RANGE;

    fn config() -> TableConfig {
        TableConfig::new(1, DigestType::Sha384)
            .max_number_of_keys(5_000_000)
            .unwrap()
            .hashes_ram_to_disk_threshold(8_388_608)
            .unwrap()
    }

    #[test]
    fn config_round_trip_is_byte_identical() {
        let original = config();
        let bytes = original.to_bytes();
        let parsed = TableConfig::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn legacy_fields_skipped_on_read() {
        let mut bytes = config().to_bytes();
        write_tag(&mut bytes, 7);
        write_varint(&mut bytes, 1);
        let parsed = TableConfig::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, config());
        // And they are never written back
        assert!(parsed.to_bytes().len() < bytes.len());
    }

    #[test]
    fn unknown_config_field_is_a_hard_error() {
        let mut bytes = config().to_bytes();
        write_tag(&mut bytes, 9);
        write_varint(&mut bytes, 1);
        assert!(matches!(
            TableConfig::from_bytes(&bytes),
            Err(VirtaError::Corruption(_))
        ));
    }

    #[test]
    fn invalid_config_values_rejected() {
        assert!(TableConfig::new(1, DigestType::Sha384)
            .max_number_of_keys(0)
            .is_err());
        assert!(TableConfig::new(1, DigestType::Sha384)
            .hashes_ram_to_disk_threshold(-1)
            .is_err());
    }

    #[test]
    fn metadata_round_trip() {
        for range in [
            KeyRange::new(0, 0).unwrap(),
            KeyRange::new(0, 17).unwrap(),
            KeyRange::new(128, 4_000_000_000).unwrap(),
            INVALID_KEY_RANGE,
        ] {
            let bytes = encode_table_metadata(&range);
            assert_eq!(decode_table_metadata(&bytes).unwrap(), range);
        }
    }

    #[test]
    fn metadata_omits_zero_fields() {
        let bytes = encode_table_metadata(&KeyRange::new(0, 9).unwrap());
        let mut slice = bytes.as_slice();
        assert_eq!(read_tag(&mut slice).unwrap(), 2);
        assert_eq!(read_varint(&mut slice).unwrap(), 9);
        assert!(slice.is_empty());
    }

    #[test]
    fn unknown_metadata_field_is_a_hard_error() {
        let mut bytes = Vec::new();
        write_tag(&mut bytes, 3);
        write_varint(&mut bytes, 5);
        assert!(decode_table_metadata(&bytes).is_err());
    }
}
