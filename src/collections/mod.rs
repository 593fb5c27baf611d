//! Collections Module
//!
//! Long-indexed structures backing the disk location indices.
//!
//! ## Responsibilities
//! - Map a path (long) to a location within an append-only data file
//! - Support an explicit valid range to bound growth and allow truncation
//! - Offer interchangeable in-memory and disk-backed strategies
//! - Persist to / load from a common side-file format

mod long_index;

pub use long_index::{DiskLongIndex, LongIndex, MemLongIndex};
