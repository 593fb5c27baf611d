//! Error types for virtakv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using VirtaError
pub type Result<T> = std::result::Result<T, VirtaError>;

/// Unified error type for virtakv operations
#[derive(Debug, Error)]
pub enum VirtaError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Argument / State Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Data source is closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error in {store}: {message}")]
    Storage { store: String, message: String },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Snapshot / Shutdown Errors
    // -------------------------------------------------------------------------
    #[error("Snapshot already in progress")]
    SnapshotInProgress,

    #[error("Timeout while shutting down {0}")]
    ShutdownTimeout(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VirtaError {
    /// Build a storage error carrying the store name for diagnostics
    pub fn storage(store: impl Into<String>, message: impl Into<String>) -> Self {
        VirtaError::Storage {
            store: store.into(),
            message: message.into(),
        }
    }
}
