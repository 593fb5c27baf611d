//! Valid path range
//!
//! Immutable inclusive `[min, max]` bounds describing which paths are
//! currently live. Every lookup reads the range, every write batch replaces
//! it wholesale, so it is always swapped as a single value and never mutated
//! field by field.

use crate::error::{Result, VirtaError};

/// Sentinel path meaning "no path" / "key not found"
pub const INVALID_PATH: i64 = -1;

/// The range of a data source with no valid entries
pub const INVALID_KEY_RANGE: KeyRange = KeyRange {
    min_valid_key: -1,
    max_valid_key: -1,
};

/// Inclusive range of valid keys (paths)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    min_valid_key: i64,
    max_valid_key: i64,
}

impl KeyRange {
    /// Create a new range. `max < min` is rejected unless both are the
    /// invalid sentinel (-1, -1).
    pub fn new(min_valid_key: i64, max_valid_key: i64) -> Result<Self> {
        if max_valid_key < min_valid_key && !(min_valid_key == -1 && max_valid_key == -1) {
            return Err(VirtaError::InvalidArgument(format!(
                "Invalid range {} - {}",
                min_valid_key, max_valid_key
            )));
        }
        Ok(Self {
            min_valid_key,
            max_valid_key,
        })
    }

    /// The lowest valid key, or -1 for the invalid range
    pub fn min_valid_key(&self) -> i64 {
        self.min_valid_key
    }

    /// The highest valid key, or -1 for the invalid range
    pub fn max_valid_key(&self) -> i64 {
        self.max_valid_key
    }

    /// True iff `min <= key <= max`. Always false for the invalid range.
    pub fn within_range(&self, key: i64) -> bool {
        key >= self.min_valid_key && key <= self.max_valid_key && self.min_valid_key >= 0
    }
}
