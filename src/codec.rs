//! Tagged binary encoding
//!
//! Minimal tag/varint codec used by the table metadata and table config wire
//! formats.
//!
//! ## Wire Format
//! ```text
//! ┌──────────────────────────────┬──────────────────────┐
//! │ tag = (field << 3) | wiretype│   varint payload     │
//! └──────────────────────────────┴──────────────────────┘
//! ```
//!
//! Only varint (wire type 0) fields are used. Zero-valued fields are omitted
//! by writers; an unrecognized field number during parse is a hard error, so
//! a corrupted or future-versioned blob is never silently misinterpreted.

use bytes::{Buf, BufMut};

use crate::error::{Result, VirtaError};

/// Number of bits the field number is shifted left of the wire type
pub const TAG_FIELD_OFFSET: u32 = 3;

/// Varint wire type
pub const WIRE_TYPE_VARINT: u32 = 0;

// =============================================================================
// Writing
// =============================================================================

/// Write a field tag with the varint wire type
pub fn write_tag(buf: &mut impl BufMut, field: u32) {
    write_varint(buf, ((field << TAG_FIELD_OFFSET) | WIRE_TYPE_VARINT) as u64);
}

/// Write an unsigned LEB128 varint
pub fn write_varint(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Write `field = value` as tag + varint, omitting zero values entirely
pub fn write_varint_field(buf: &mut impl BufMut, field: u32, value: u64) {
    if value != 0 {
        write_tag(buf, field);
        write_varint(buf, value);
    }
}

// =============================================================================
// Reading
// =============================================================================

/// Read an unsigned LEB128 varint
pub fn read_varint(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(VirtaError::Corruption("truncated varint".to_string()));
        }
        if shift >= 64 {
            return Err(VirtaError::Corruption("varint overflow".to_string()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Read a tag, returning the field number. The wire type must be varint.
pub fn read_tag(buf: &mut impl Buf) -> Result<u32> {
    let tag = read_varint(buf)? as u32;
    let wire_type = tag & ((1 << TAG_FIELD_OFFSET) - 1);
    if wire_type != WIRE_TYPE_VARINT {
        return Err(VirtaError::Corruption(format!(
            "Unsupported wire type: {}",
            wire_type
        )));
    }
    Ok(tag >> TAG_FIELD_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut slice = buf.as_slice();
            assert_eq!(read_varint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn zero_fields_are_omitted() {
        let mut buf = Vec::new();
        write_varint_field(&mut buf, 1, 0);
        assert!(buf.is_empty());
        write_varint_field(&mut buf, 2, 9);
        let mut slice = buf.as_slice();
        assert_eq!(read_tag(&mut slice).unwrap(), 2);
        assert_eq!(read_varint(&mut slice).unwrap(), 9);
    }

    #[test]
    fn truncated_varint_is_corruption() {
        let mut slice: &[u8] = &[0x80];
        assert!(read_varint(&mut slice).is_err());
    }
}
