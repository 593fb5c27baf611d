//! Record types
//!
//! The record types flowing between the tree layer and the storage engine:
//! per-path hashes and leaf (key, value) payloads. Keys and values are opaque
//! byte sequences plus a caller-supplied hash code; the engine only ever
//! inspects the path fields.
//!
//! ## On-disk item formats (little-endian)
//! ```text
//! Hash record:  ┌──────────┬──────────────────┐
//!               │ path (8) │ digest bytes (48)│
//!               └──────────┴──────────────────┘
//! Leaf record:  ┌──────────┬────────────┬────────────┬─────┬────────────┬───────┐
//!               │ path (8) │ keyHash (4)│ keyLen (4) │ key │ valLen (4) │ value │
//!               └──────────┴────────────┴────────────┴─────┴────────────┴───────┘
//! ```

use std::io::Write;

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Result, VirtaError};

/// Value length marker for a leaf record with no value payload
const NO_VALUE: u32 = u32::MAX;

// =============================================================================
// Digests
// =============================================================================

/// Supported hash digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestType {
    Sha384,
}

impl DigestType {
    /// Stable numeric id written to sinks and config blobs
    pub fn id(&self) -> i32 {
        match self {
            DigestType::Sha384 => 0x58ff_811b,
        }
    }

    /// Digest size in bytes
    pub fn size(&self) -> usize {
        match self {
            DigestType::Sha384 => 48,
        }
    }

    /// Look a digest type up by its numeric id
    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            0x58ff_811b => Ok(DigestType::Sha384),
            _ => Err(VirtaError::Corruption(format!(
                "Unknown digest type id: {}",
                id
            ))),
        }
    }
}

/// A fixed-size digest value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hash {
    digest_type: DigestType,
    bytes: Bytes,
}

impl Hash {
    /// Wrap digest bytes; the length must match the digest type
    pub fn new(digest_type: DigestType, bytes: Bytes) -> Result<Self> {
        if bytes.len() != digest_type.size() {
            return Err(VirtaError::InvalidArgument(format!(
                "Digest must be {} bytes, got {}",
                digest_type.size(),
                bytes.len()
            )));
        }
        Ok(Self { digest_type, bytes })
    }

    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Write this hash to a sink in the fixed interchange layout:
    /// digest id (4, BE) + size (4, BE) + digest bytes. The layout is the
    /// same regardless of which tier served the hash.
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        out.write_all(&self.digest_type.id().to_be_bytes())?;
        out.write_all(&(self.bytes.len() as i32).to_be_bytes())?;
        out.write_all(&self.bytes)?;
        Ok(())
    }
}

// =============================================================================
// Hash records
// =============================================================================

/// One dirty (path, hash) pair from a write batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRecord {
    pub path: i64,
    pub hash: Hash,
}

impl HashRecord {
    pub fn new(path: i64, hash: Hash) -> Self {
        Self { path, hash }
    }

    /// Serialized size in bytes
    pub fn size_in_bytes(&self) -> usize {
        8 + self.hash.bytes().len()
    }

    /// Serialize to the on-disk item layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size_in_bytes());
        buf.put_i64_le(self.path);
        buf.put_slice(self.hash.bytes());
        buf
    }

    /// Parse from the on-disk item layout
    pub fn parse(mut data: &[u8], digest_type: DigestType) -> Result<Self> {
        if data.len() != 8 + digest_type.size() {
            return Err(VirtaError::Corruption(format!(
                "Hash record must be {} bytes, got {}",
                8 + digest_type.size(),
                data.len()
            )));
        }
        let path = data.get_i64_le();
        let hash = Hash::new(digest_type, Bytes::copy_from_slice(data))?;
        Ok(Self { path, hash })
    }

    /// Extract just the path from a serialized record, for index rebuilds
    /// and compaction without materializing the hash
    pub fn path_of(data: &[u8]) -> Result<i64> {
        if data.len() < 8 {
            return Err(VirtaError::Corruption(
                "Hash record shorter than its path field".to_string(),
            ));
        }
        Ok((&data[..8]).get_i64_le())
    }
}

// =============================================================================
// Leaf records
// =============================================================================

/// A leaf (key, value) payload at a path
///
/// `value_bytes == None` never reaches disk; it is used for delete records
/// coming in from the tree layer and for partial/negative entries in the
/// leaf read cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecord {
    pub path: i64,
    pub key_bytes: Bytes,
    pub key_hash_code: i32,
    pub value_bytes: Option<Bytes>,
}

impl LeafRecord {
    pub fn new(path: i64, key_bytes: Bytes, key_hash_code: i32, value_bytes: Option<Bytes>) -> Self {
        Self {
            path,
            key_bytes,
            key_hash_code,
            value_bytes,
        }
    }

    /// Serialized size in bytes
    pub fn size_in_bytes(&self) -> usize {
        8 + 4 + 4 + self.key_bytes.len() + 4 + self.value_bytes.as_ref().map_or(0, |v| v.len())
    }

    /// Serialize to the on-disk item layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size_in_bytes());
        buf.put_i64_le(self.path);
        buf.put_i32_le(self.key_hash_code);
        buf.put_u32_le(self.key_bytes.len() as u32);
        buf.put_slice(&self.key_bytes);
        match &self.value_bytes {
            Some(value) => {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
            None => buf.put_u32_le(NO_VALUE),
        }
        buf
    }

    /// Parse from the on-disk item layout
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(VirtaError::Corruption(
                "Leaf record shorter than its header".to_string(),
            ));
        }
        let path = data.get_i64_le();
        let key_hash_code = data.get_i32_le();
        let key_len = data.get_u32_le() as usize;
        if data.len() < key_len + 4 {
            return Err(VirtaError::Corruption(
                "Leaf record truncated in key".to_string(),
            ));
        }
        let key_bytes = Bytes::copy_from_slice(&data[..key_len]);
        data.advance(key_len);
        let value_len = data.get_u32_le();
        let value_bytes = if value_len == NO_VALUE {
            None
        } else {
            if data.len() != value_len as usize {
                return Err(VirtaError::Corruption(
                    "Leaf record truncated in value".to_string(),
                ));
            }
            Some(Bytes::copy_from_slice(data))
        };
        Ok(Self {
            path,
            key_bytes,
            key_hash_code,
            value_bytes,
        })
    }

    /// Extract just the path from a serialized record
    pub fn path_of(data: &[u8]) -> Result<i64> {
        if data.len() < 8 {
            return Err(VirtaError::Corruption(
                "Leaf record shorter than its path field".to_string(),
            ));
        }
        Ok((&data[..8]).get_i64_le())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hash(fill: u8) -> Hash {
        Hash::new(DigestType::Sha384, Bytes::from(vec![fill; 48])).unwrap()
    }

    #[test]
    fn hash_record_round_trip() {
        let record = HashRecord::new(42, test_hash(7));
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), record.size_in_bytes());
        assert_eq!(HashRecord::path_of(&bytes).unwrap(), 42);
        let parsed = HashRecord::parse(&bytes, DigestType::Sha384).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn leaf_record_round_trip() {
        let record = LeafRecord::new(
            9,
            Bytes::from_static(b"a key"),
            -12345,
            Some(Bytes::from_static(b"a value")),
        );
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), record.size_in_bytes());
        assert_eq!(LeafRecord::path_of(&bytes).unwrap(), 9);
        assert_eq!(LeafRecord::parse(&bytes).unwrap(), record);
    }

    #[test]
    fn leaf_record_without_value_round_trip() {
        let record = LeafRecord::new(3, Bytes::from_static(b"k"), 1, None);
        assert_eq!(LeafRecord::parse(&record.to_bytes()).unwrap(), record);
    }

    #[test]
    fn hash_sink_layout_is_fixed() {
        let mut out = Vec::new();
        test_hash(0xAB).write_to(&mut out).unwrap();
        assert_eq!(&out[0..4], &0x58ff_811bi32.to_be_bytes());
        assert_eq!(&out[4..8], &48i32.to_be_bytes());
        assert_eq!(out.len(), 8 + 48);
    }

    #[test]
    fn wrong_digest_size_rejected() {
        assert!(Hash::new(DigestType::Sha384, Bytes::from(vec![0; 20])).is_err());
    }
}
