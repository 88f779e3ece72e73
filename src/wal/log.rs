//! Value log
//!
//! Appends records through the value-log actor and re-reads them by address.

use parking_lot::Mutex;

use crate::config::SyncStrategy;
use crate::error::{ChronoError, Result};
use crate::io::{FileId, IoAddress, IoHandle};

use super::{ValueLogReader, ValueLogRecord};

/// Append-only value log built on one I/O actor
///
/// ## Concurrency:
/// - `state`: Mutex held across the actor round-trip so appends are
///   assigned offsets in the same order they are written
/// - Reads go straight to the actor (records are immutable once appended)
pub struct ValueLog {
    io: IoHandle,
    sync_strategy: SyncStrategy,
    state: Mutex<AppendState>,
}

struct AppendState {
    /// Where the next record goes
    append_offset: u64,
    /// Appends since the last fsync
    unsynced: usize,
}

impl ValueLog {
    /// Attach to the actor of an existing or empty log file
    pub fn open(io: IoHandle, sync_strategy: SyncStrategy) -> Result<Self> {
        if io.file_id() != FileId::VALUE_LOG {
            return Err(ChronoError::Config(format!(
                "value log needs the value-log actor, got {}",
                io.file_id()
            )));
        }
        let append_offset = io.len()?;
        Ok(Self {
            io,
            sync_strategy,
            state: Mutex::new(AppendState {
                append_offset,
                unsynced: 0,
            }),
        })
    }

    /// Append a record and return its address.
    ///
    /// The append offset only advances once the write (and a sync, when the
    /// strategy asks for one) succeeded, so retrying a failed append reuses
    /// the same offset instead of appending twice.
    pub fn append(&self, record: &ValueLogRecord) -> Result<IoAddress> {
        let bytes = record.encode();
        let len = bytes.len() as u32;

        let mut state = self.state.lock();
        let offset = state.append_offset;
        self.io.write(offset, bytes)?;

        let should_sync = match self.sync_strategy {
            SyncStrategy::EveryWrite => true,
            SyncStrategy::EveryNEntries { count } => state.unsynced + 1 >= count,
        };
        if should_sync {
            if let Err(e) = self.io.sync() {
                // drop the unsynced record so it cannot resurface on replay
                let _ = self.io.truncate(offset);
                return Err(e);
            }
            state.unsynced = 0;
        } else {
            state.unsynced += 1;
        }

        state.append_offset = offset + len as u64;
        Ok(IoAddress::new(FileId::VALUE_LOG, offset, len))
    }

    /// Re-read and checksum-verify the record at `address`
    pub fn read(&self, address: IoAddress) -> Result<ValueLogRecord> {
        if address.file != FileId::VALUE_LOG {
            return Err(ChronoError::corruption(format!(
                "address {} does not point into the value log",
                address
            )));
        }
        if address.end() > self.append_offset() {
            return Err(ChronoError::NotFound);
        }
        let bytes = self.io.read(address.offset, address.len as usize)?;
        ValueLogRecord::decode(&bytes)
    }

    /// Durability boundary for every record appended so far
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.io.sync()?;
        state.unsynced = 0;
        Ok(())
    }

    /// Offset the next append will use
    pub fn append_offset(&self) -> u64 {
        self.state.lock().append_offset
    }

    /// Appends not yet covered by an fsync
    pub fn unsynced_count(&self) -> usize {
        self.state.lock().unsynced
    }

    /// Sequential reader over `[start, append_offset)`
    pub fn reader(&self, start: u64) -> Result<ValueLogReader> {
        let end = self.append_offset();
        if start > end {
            return Err(ChronoError::corruption(format!(
                "replay offset {} is past the end of the value log ({})",
                start, end
            )));
        }
        Ok(ValueLogReader::new(self.io.clone(), start, end))
    }

    /// Drop everything from `offset` on; used to cut a torn tail
    pub(crate) fn truncate_to(&self, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        self.io.truncate(offset)?;
        self.io.sync()?;
        state.append_offset = offset;
        state.unsynced = 0;
        Ok(())
    }
}
