//! # ChronoKV
//!
//! An embedded, versioned key-value storage engine with:
//! - Per-key version history and point-in-time reads (`get_as_of`)
//! - Write-ahead value log with crash replay and torn-tail repair
//! - Copy-on-write B+Tree (or hash index) persisted as checksummed blocks
//! - One single-threaded I/O actor per file
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │        (open / checkpoint / close, recovery on open)        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   VersionedIndex                            │
//! │       (single writer, version allocation, value refs)       │
//! └──────────┬───────────────────────────────────┬──────────────┘
//!            │ append first                      │ insert / lookup
//!            ▼                                   ▼
//!   ┌─────────────────┐                ┌───────────────────┐
//!   │    ValueLog     │                │   IndexBackend    │
//!   │   (wal module)  │                │  BTree  |  Hash   │
//!   └────────┬────────┘                └─────────┬─────────┘
//!            │                                   │ BlockSearcher
//!            ▼                                   ▼
//!   ┌─────────────────┐                ┌───────────────────┐
//!   │ IoActor         │                │ IoActor           │
//!   │ values.log      │                │ index.db          │
//!   └─────────────────┘                └───────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod io;
pub mod wal;
pub mod storage;
pub mod index;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ChronoError, Result};
pub use config::{Config, IndexKind, SyncStrategy};
pub use engine::Engine;
pub use index::{Entry, KeyRange, ScanStart, Version};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of ChronoKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
