//! # VirtaKV
//!
//! A hybrid on-disk/in-memory virtual key-value storage engine backing a
//! large, sparse, path-addressed merkle tree, with:
//! - Append-only data files with CRC-checked items and background compaction
//! - RAM/disk-tiered per-path hash storage with a configurable threshold
//! - A disk-resident bucket hash map from opaque keys to tree paths
//! - Crash-consistent point-in-time snapshots
//! - Single-writer-per-batch / multi-reader concurrency model
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Database                              │
//! │              (table registry + builder)                      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      DataSource                              │
//! │     (valid range, leaf cache, flush workers, snapshot)       │
//! └───────┬──────────────────┬──────────────────┬───────────────┘
//!         │                  │                  │
//!         ▼                  ▼                  ▼
//!  ┌─────────────┐    ┌─────────────┐    ┌──────────────┐
//!  │  Hash Tier  │    │ Path→Leaf   │    │  Key→Path    │
//!  │ (RAM/disk)  │    │   Store     │    │ (bucket map) │
//!  └──────┬──────┘    └──────┬──────┘    └──────┬───────┘
//!         │                  │                  │
//!         ▼                  ▼                  ▼
//!  ┌─────────────────────────────────────────────────────┐
//!  │       Data Files + Long Indices + Compaction         │
//!  └─────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod codec;
pub mod collections;
pub mod compaction;
pub mod database;
pub mod datasource;
pub mod files;
pub mod hashes;
pub mod range;
pub mod records;
pub mod table;
pub mod worker;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::Config;
pub use database::{DataSourceBuilder, Database};
pub use datasource::DataSource;
pub use error::{Result, VirtaError};
pub use range::{KeyRange, INVALID_KEY_RANGE, INVALID_PATH};
pub use records::{DigestType, Hash, HashRecord, LeafRecord};
pub use table::TableConfig;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of VirtaKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
