//! Value Log Module
//!
//! Append-only record store that makes every write durable before it is
//! applied to the index (write-ahead ordering).
//!
//! ## Responsibilities
//! - Append records through the value-log I/O actor
//! - CRC32 checksums for corruption detection
//! - Per-record re-read with checksum verification
//! - Crash recovery and replay from a checkpoint offset
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Record 1                                                     │
//! │ ┌─────────┬─────┬─────────┬────────┬─────────┬───────┬─────┐ │
//! │ │KeyLen(4)│ Key │ Ver (8) │ Ts (8) │ValLen(4)│ Value │CRC 4│ │
//! │ └─────────┴─────┴─────────┴────────┴─────────┴───────┴─────┘ │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record 2 ...                                                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//! `ValLen == u32::MAX` marks a tombstone (no value bytes). The CRC covers
//! every byte of the record before it.

mod log;
mod reader;
mod record;
mod recovery;

pub use log::ValueLog;
pub use reader::{TailState, ValueLogReader};
pub use record::{now_millis, ValueLogRecord, RECORD_OVERHEAD, TOMBSTONE_MARKER};
pub use recovery::{RecoveryResult, ValueLogRecovery};
