//! Files Module
//!
//! On-disk store building blocks: append-only data file collections, the
//! index+file key-value store, the bucket-based key-to-path map, and the
//! background compactor that rewrites file generations.
//!
//! ## File Format (data files)
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Header                                 │
//! │ ┌──────────┬───────────────┐           │
//! │ │Magic (4) │ File Index (4)│           │
//! │ └──────────┴───────────────┘           │
//! ├────────────────────────────────────────┤
//! │ Item (repeated)                        │
//! │ ┌────────┬────────┬─────────────────┐  │
//! │ │Len (4) │CRC (4) │     Payload     │  │
//! │ └────────┴────────┴─────────────────┘  │
//! └────────────────────────────────────────┘
//! ```
//!
//! A location is `file_index << 32 | byte_offset`, so it is never zero
//! (offsets start past the header) and fits a single index slot.

mod compactor;
mod data_file;
mod indexed_store;
mod key_to_path;

pub use compactor::{CancelToken, PauseGate, StoreCompactor};
pub use data_file::{DataFile, DataFileCollection, CompactionWriter};
pub use indexed_store::IndexedStore;
pub use key_to_path::KeyToPathStore;

pub(crate) use key_to_path::bucket_id_of;
