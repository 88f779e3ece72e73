//! Value log recovery
//!
//! Replays records from a checkpoint offset after a crash.

use crate::error::Result;
use crate::io::IoAddress;

use super::{TailState, ValueLog, ValueLogRecord};

/// Handles value-log replay on open
pub struct ValueLogRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of records handed to the apply callback
    pub records_applied: u64,

    /// Offset right after the last well-formed record
    pub valid_end: u64,

    /// Bytes of a torn trailing record that were dropped
    pub discarded_bytes: u64,

    /// Whether the log was truncated (partial write removed)
    pub was_truncated: bool,
}

impl ValueLogRecovery {
    /// Replay every well-formed record from `start` in file order.
    ///
    /// This will:
    /// 1. Read records through the value-log actor
    /// 2. Stop at a torn trailing record and truncate it away
    /// 3. Fail on a damaged record that is followed by more data
    pub fn replay<F>(log: &ValueLog, start: u64, mut apply: F) -> Result<RecoveryResult>
    where
        F: FnMut(IoAddress, ValueLogRecord) -> Result<()>,
    {
        let mut reader = log.reader(start)?;
        let mut result = RecoveryResult::default();

        while let Some((address, record)) = reader.next_record()? {
            apply(address, record)?;
            result.records_applied += 1;
        }
        result.valid_end = reader.position();

        if let TailState::Torn { offset, discarded } = reader.tail() {
            tracing::warn!(
                offset,
                discarded,
                "discarding torn value-log tail left by an interrupted write"
            );
            log.truncate_to(offset)?;
            result.discarded_bytes = discarded;
            result.was_truncated = true;
        }

        Ok(result)
    }

    /// Verify integrity from `start` without applying or modifying anything
    pub fn verify(log: &ValueLog, start: u64) -> Result<RecoveryResult> {
        let mut reader = log.reader(start)?;
        let mut result = RecoveryResult::default();

        while reader.next_record()?.is_some() {
            result.records_applied += 1;
        }
        result.valid_end = reader.position();
        if let TailState::Torn { discarded, .. } = reader.tail() {
            result.discarded_bytes = discarded;
        }
        Ok(result)
    }
}
