//! Error types for ChronoKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using ChronoError
pub type Result<T> = std::result::Result<T, ChronoError>;

/// Unified error type for ChronoKV operations
#[derive(Debug, Error)]
pub enum ChronoError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A queued I/O request was withdrawn before it went in flight
    #[error("I/O request cancelled before it was processed")]
    Cancelled,

    /// The record reached the value log but the in-memory index rejected
    /// it. The version is durable and replay applies it on the next open;
    /// retrying the write would record a second version.
    #[error("version {version} is logged but not indexed: {source}")]
    NotIndexed {
        version: u64,
        source: Box<ChronoError>,
    },

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    /// Checksum mismatch or malformed bytes in a block, record or superblock
    #[error("Corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    NotFound,

    // -------------------------------------------------------------------------
    // Capacity Errors
    // -------------------------------------------------------------------------
    /// A node or key does not fit the configured block geometry
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Engine is closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChronoError {
    /// Shorthand for building a corruption error from anything displayable
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        ChronoError::Corruption(msg.into())
    }

    /// True for the normal "nothing there" outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChronoError::NotFound)
    }
}
