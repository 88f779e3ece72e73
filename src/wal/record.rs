//! Value log record definitions
//!
//! Defines the on-disk structure of a single value-log record.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};

use crate::error::{ChronoError, Result};

/// Sentinel value length indicating a tombstone (deleted key)
pub const TOMBSTONE_MARKER: u32 = u32::MAX;

/// Fixed bytes per record: KeyLen (4) + Version (8) + Timestamp (8) + ValLen (4) + CRC (4)
pub const RECORD_OVERHEAD: usize = 28;

/// Bytes between the key and the value: Version (8) + Timestamp (8) + ValLen (4)
pub(crate) const MIDDLE_SIZE: usize = 20;

/// A single immutable record in the value log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueLogRecord {
    pub key: Vec<u8>,

    /// Per-key version assigned by the index
    pub version: u64,

    /// Wall-clock write time (unix millis)
    pub timestamp: u64,

    /// `None` for a tombstone
    pub value: Option<Vec<u8>>,
}

impl ValueLogRecord {
    pub fn put(key: Vec<u8>, version: u64, value: Vec<u8>) -> Self {
        Self {
            key,
            version,
            timestamp: now_millis(),
            value: Some(value),
        }
    }

    pub fn tombstone(key: Vec<u8>, version: u64) -> Self {
        Self {
            key,
            version,
            timestamp: now_millis(),
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Size of this record when serialized on disk
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }

    /// Serialize this record, CRC last
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(&self.key);
        buf.put_u64_le(self.version);
        buf.put_u64_le(self.timestamp);
        match &self.value {
            Some(value) => {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
            None => buf.put_u32_le(TOMBSTONE_MARKER),
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Total length of the record framed at the start of `data`, if its
    /// declared key and value lengths fit inside `data`
    pub fn framed_len(data: &[u8]) -> Option<usize> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return None;
        }
        let key_len = buf.get_u32_le() as usize;
        let middle_at = 4usize.checked_add(key_len)?;
        let middle = data.get(middle_at..middle_at.checked_add(MIDDLE_SIZE)?)?;
        let value_len = (&middle[16..]).get_u32_le();
        let value_bytes = if value_len == TOMBSTONE_MARKER {
            0
        } else {
            value_len as usize
        };
        let end = (middle_at + MIDDLE_SIZE).checked_add(value_bytes)?.checked_add(4)?;
        (end <= data.len()).then_some(end)
    }

    /// Deserialize exactly one record. Fails on length or CRC mismatch.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_OVERHEAD {
            return Err(ChronoError::corruption("value-log record too short"));
        }

        let body_len = data.len() - 4;
        let stored_crc = (&data[body_len..]).get_u32_le();
        let computed_crc = crc32fast::hash(&data[..body_len]);
        if stored_crc != computed_crc {
            return Err(ChronoError::corruption(format!(
                "value-log record CRC mismatch (stored {:#010x}, computed {:#010x})",
                stored_crc, computed_crc
            )));
        }

        let mut buf = &data[..body_len];
        let key_len = buf.get_u32_le() as usize;
        if buf.remaining() < key_len + MIDDLE_SIZE {
            return Err(ChronoError::corruption("value-log key length exceeds record"));
        }
        let key = buf[..key_len].to_vec();
        buf.advance(key_len);

        let version = buf.get_u64_le();
        let timestamp = buf.get_u64_le();
        let value_len = buf.get_u32_le();

        let value = if value_len == TOMBSTONE_MARKER {
            None
        } else {
            if buf.remaining() != value_len as usize {
                return Err(ChronoError::corruption("value-log value length mismatch"));
            }
            Some(buf.to_vec())
        };
        if value.is_none() && buf.has_remaining() {
            return Err(ChronoError::corruption("trailing bytes after tombstone"));
        }

        Ok(Self {
            key,
            version,
            timestamp,
            value,
        })
    }
}

/// Milliseconds since the unix epoch (0 if the clock is before it)
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
