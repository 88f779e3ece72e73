//! Value log reader
//!
//! Sequentially reads records through the value-log actor, classifying a
//! malformed trailing record as a torn tail rather than corruption. A
//! malformed record with a well-formed one somewhere after it is corruption.

use bytes::Buf;

use crate::error::{ChronoError, Result};
use crate::io::{FileId, IoAddress, IoHandle};

use super::record::{MIDDLE_SIZE, TOMBSTONE_MARKER};
use super::ValueLogRecord;

/// What the reader found after the last well-formed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    /// Not finished yet
    Pending,

    /// The last record ends exactly at end-of-file
    Clean,

    /// A partial record starts at `offset`; `discarded` bytes follow it
    Torn { offset: u64, discarded: u64 },
}

/// Reads records from `start` up to a fixed end-of-file
pub struct ValueLogReader {
    io: IoHandle,
    position: u64,
    file_len: u64,
    tail: TailState,
    failed: bool,
}

impl ValueLogReader {
    pub fn new(io: IoHandle, start: u64, file_len: u64) -> Self {
        Self {
            io,
            position: start,
            file_len,
            tail: TailState::Pending,
            failed: false,
        }
    }

    /// Offset right after the last well-formed record read so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn tail(&self) -> TailState {
        self.tail
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` at end-of-file or at a torn tail; a checksum
    /// failure followed by more bytes is reported as corruption.
    pub fn next_record(&mut self) -> Result<Option<(IoAddress, ValueLogRecord)>> {
        if self.tail != TailState::Pending {
            return Ok(None);
        }
        if self.position == self.file_len {
            self.tail = TailState::Clean;
            return Ok(None);
        }

        let start = self.position;
        let remaining = self.file_len - start;

        if remaining < 4 {
            return self.torn(start);
        }
        let key_len = (&self.io.read(start, 4)?[..]).get_u32_le() as u64;

        let middle_at = start + 4 + key_len;
        if middle_at + MIDDLE_SIZE as u64 > self.file_len {
            return self.torn(start);
        }
        let middle = self.io.read(middle_at, MIDDLE_SIZE)?;
        let value_len = (&middle[16..]).get_u32_le();
        let value_bytes = if value_len == TOMBSTONE_MARKER {
            0
        } else {
            value_len as u64
        };

        let end = middle_at + MIDDLE_SIZE as u64 + value_bytes + 4;
        if end > self.file_len {
            return self.torn(start);
        }

        let len = end - start;
        let bytes = self.io.read(start, len as usize)?;
        match ValueLogRecord::decode(&bytes) {
            Ok(record) => {
                self.position = end;
                let address = IoAddress::new(FileId::VALUE_LOG, start, len as u32);
                Ok(Some((address, record)))
            }
            Err(ChronoError::Corruption(_)) if end == self.file_len => self.torn(start),
            Err(e) => Err(ChronoError::corruption(format!(
                "value-log record at offset {} is damaged and followed by more data: {}",
                start, e
            ))),
        }
    }

    /// Give up on the record at `offset`. If a well-formed record turns up
    /// in the bytes that would be discarded, the damage is mid-log (a flipped
    /// length field, for instance) and truncating would lose valid records.
    fn torn(&mut self, offset: u64) -> Result<Option<(IoAddress, ValueLogRecord)>> {
        let rest = self.io.read(offset, (self.file_len - offset) as usize)?;
        if let Some(skip) = first_record_after_start(&rest) {
            return Err(ChronoError::corruption(format!(
                "value-log record at offset {} is damaged but a well-formed record follows at offset {}",
                offset,
                offset + skip as u64
            )));
        }

        self.tail = TailState::Torn {
            offset,
            discarded: self.file_len - offset,
        };
        Ok(None)
    }
}

/// Offset of the first record inside `bytes` (past position 0) that is fully
/// present and passes its checksum
fn first_record_after_start(bytes: &[u8]) -> Option<usize> {
    (1..bytes.len()).find(|&at| {
        let candidate = &bytes[at..];
        ValueLogRecord::framed_len(candidate)
            .map_or(false, |len| ValueLogRecord::decode(&candidate[..len]).is_ok())
    })
}

impl Iterator for ValueLogReader {
    type Item = Result<(IoAddress, ValueLogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.next_record().transpose();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}
