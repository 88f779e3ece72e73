//! Superblock
//!
//! Two checkpoint slots at the head of the index file, written alternately.
//! A torn slot write leaves the other slot intact, so the previous
//! checkpoint always survives.
//!
//! ## Slot Layout
//! ```text
//! ┌────────────────────┬─────────────────┬─────────────────────────┬───────────┐
//! │ Magic "CKVSUPER" 8 │ Payload len u32 │ bincode(CheckpointMeta) │ CRC32 u32 │
//! └────────────────────┴─────────────────┴─────────────────────────┴───────────┘
//! ```
//! Slot 0 lives at offset 0 and slot 1 at `page_size`; tree blocks start at
//! `2 * page_size`. The CRC covers magic, length and payload.

use serde::{Deserialize, Serialize};

use crate::error::{ChronoError, Result};
use crate::io::{FileId, IoAddress, IoHandle};

use super::TreeRoot;

/// Magic bytes identifying a superblock slot
pub const SUPERBLOCK_MAGIC: &[u8; 8] = b"CKVSUPER";

const SLOT_HEADER_SIZE: usize = 12;
const CRC_SIZE: usize = 4;

/// Everything needed to reopen the engine at a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Incremented by every commit; the higher valid slot wins
    pub sequence: u64,
    /// Offset of the root block, `None` before the first flush
    pub root_offset: Option<u64>,
    pub height: u32,
    /// Value-log offset from which replay resumes
    pub replay_offset: u64,
    /// First free block offset in the index file
    pub next_block_offset: u64,
    pub page_size: u32,
    pub index_kind: u8,
}

impl CheckpointMeta {
    /// State of a brand-new index file
    pub fn fresh(page_size: usize, index_kind: u8) -> Self {
        Self {
            sequence: 0,
            root_offset: None,
            height: 0,
            replay_offset: 0,
            next_block_offset: 2 * page_size as u64,
            page_size: page_size as u32,
            index_kind,
        }
    }

    pub fn root(&self) -> Option<TreeRoot> {
        self.root_offset.map(|offset| TreeRoot {
            address: IoAddress::new(FileId::INDEX, offset, self.page_size),
            height: self.height,
        })
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| ChronoError::corruption(format!("superblock encode failed: {}", e)))?;
        let mut buf = Vec::with_capacity(SLOT_HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(SUPERBLOCK_MAGIC);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

/// Owner of the two superblock slots
pub struct Superblock {
    io: IoHandle,
    page_size: usize,
    current: CheckpointMeta,
}

impl Superblock {
    /// Load the newest valid slot, or start fresh when no slot was ever
    /// written.
    ///
    /// Fails with `Config` when the file was created with another page
    /// size, and with `Corruption` when a slot was written but neither one
    /// is readable.
    pub fn load(io: IoHandle, page_size: usize, index_kind: u8) -> Result<Self> {
        let file_len = io.len()?;
        if file_len == 0 {
            return Ok(Self {
                io,
                page_size,
                current: CheckpointMeta::fresh(page_size, index_kind),
            });
        }

        let mut best: Option<CheckpointMeta> = None;
        let mut damaged = 0;
        for slot in 0..2u64 {
            match read_slot(&io, slot * page_size as u64, file_len) {
                Ok(Some(meta)) => {
                    if best.as_ref().map_or(true, |b| meta.sequence > b.sequence) {
                        best = Some(meta);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    damaged += 1;
                    tracing::warn!(slot, error = %e, "superblock slot unreadable");
                }
            }
        }

        let current = match best {
            Some(meta) => meta,
            // blocks were flushed but no checkpoint was ever committed
            None if damaged == 0 => CheckpointMeta::fresh(page_size, index_kind),
            None => return Err(ChronoError::corruption("index file has no valid superblock slot")),
        };
        if current.page_size as usize != page_size {
            return Err(ChronoError::Config(format!(
                "index file uses page_size {}, configured {}",
                current.page_size, page_size
            )));
        }

        tracing::debug!(
            sequence = current.sequence,
            root = ?current.root_offset,
            replay_offset = current.replay_offset,
            "superblock loaded"
        );
        Ok(Self {
            io,
            page_size,
            current,
        })
    }

    /// Last committed checkpoint
    pub fn meta(&self) -> &CheckpointMeta {
        &self.current
    }

    /// Persist `next` into the slot not holding the current checkpoint.
    ///
    /// The sequence number is assigned here; the in-memory copy only
    /// changes once the slot is written and synced.
    pub fn commit(&mut self, mut next: CheckpointMeta) -> Result<()> {
        next.sequence = self.current.sequence + 1;
        next.page_size = self.page_size as u32;

        let mut bytes = next.encode()?;
        if bytes.len() > self.page_size {
            return Err(ChronoError::Capacity(format!(
                "superblock needs {} bytes, slot holds {}",
                bytes.len(),
                self.page_size
            )));
        }
        bytes.resize(self.page_size, 0);

        let offset = (next.sequence % 2) * self.page_size as u64;
        self.io.write(offset, bytes)?;
        self.io.sync()?;

        tracing::debug!(
            sequence = next.sequence,
            slot = next.sequence % 2,
            root = ?next.root_offset,
            "superblock committed"
        );
        self.current = next;
        Ok(())
    }
}

/// `None` for a slot that was never written
fn read_slot(io: &IoHandle, offset: u64, file_len: u64) -> Result<Option<CheckpointMeta>> {
    if offset + SLOT_HEADER_SIZE as u64 > file_len {
        return Ok(None);
    }
    let header = io.read(offset, SLOT_HEADER_SIZE)?;
    if header.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    if &header[..8] != SUPERBLOCK_MAGIC {
        return Err(ChronoError::corruption("invalid superblock magic"));
    }
    let payload_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;

    let rest_len = payload_len + CRC_SIZE;
    if offset + (SLOT_HEADER_SIZE + rest_len) as u64 > file_len {
        return Err(ChronoError::corruption("superblock slot truncated"));
    }
    let rest = io.read(offset + SLOT_HEADER_SIZE as u64, rest_len)?;
    let (payload, crc_bytes) = rest.split_at(payload_len);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(payload);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if hasher.finalize() != stored {
        return Err(ChronoError::corruption("superblock checksum mismatch"));
    }

    bincode::deserialize(payload)
        .map(Some)
        .map_err(|e| ChronoError::corruption(format!("superblock decode failed: {}", e)))
}
