//! Configuration for virtakv
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

/// Engine-wide configuration, shared by every table of a database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Use disk-backed disk-location indices instead of in-memory ones.
    /// Disk-backed indices are unbounded but slower.
    pub prefer_disk_indices: bool,

    /// Number of 64-bit slots per index chunk (in-memory backing)
    pub index_chunk_size: usize,

    // -------------------------------------------------------------------------
    // Leaf Read Cache Configuration
    // -------------------------------------------------------------------------
    /// Number of slots in the direct-mapped leaf record cache.
    /// Zero disables the cache entirely.
    pub leaf_record_cache_size: usize,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Number of threads in the shared background compaction pool
    pub compaction_threads: usize,

    /// Minimum number of completed data files before a store is compacted
    pub min_files_to_compact: usize,

    /// How long `close` waits for in-flight compaction tasks to drain.
    /// Elapsing is logged as an error but does not fail the close.
    pub compaction_stop_timeout: Duration,

    // -------------------------------------------------------------------------
    // Shutdown Configuration
    // -------------------------------------------------------------------------
    /// How long `close` waits for the flush workers to drain.
    /// Elapsing is a hard failure: files must not be closed under a writer.
    pub worker_shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefer_disk_indices: false,
            index_chunk_size: 1024 * 1024,
            leaf_record_cache_size: 1024 * 1024,
            compaction_threads: 2,
            min_files_to_compact: 2,
            compaction_stop_timeout: Duration::from_secs(30),
            worker_shutdown_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Prefer disk-backed disk-location indices over in-memory ones
    pub fn prefer_disk_indices(mut self, prefer: bool) -> Self {
        self.config.prefer_disk_indices = prefer;
        self
    }

    /// Set the number of 64-bit slots per in-memory index chunk
    pub fn index_chunk_size(mut self, slots: usize) -> Self {
        self.config.index_chunk_size = slots;
        self
    }

    /// Set the leaf record cache size (0 disables the cache)
    pub fn leaf_record_cache_size(mut self, slots: usize) -> Self {
        self.config.leaf_record_cache_size = slots;
        self
    }

    /// Set the number of background compaction threads
    pub fn compaction_threads(mut self, threads: usize) -> Self {
        self.config.compaction_threads = threads.max(1);
        self
    }

    /// Set the minimum number of completed files before compacting a store
    pub fn min_files_to_compact(mut self, files: usize) -> Self {
        self.config.min_files_to_compact = files.max(2);
        self
    }

    /// Set how long close waits for compaction tasks to drain
    pub fn compaction_stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.compaction_stop_timeout = timeout;
        self
    }

    /// Set how long close waits for the flush workers to drain
    pub fn worker_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker_shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
