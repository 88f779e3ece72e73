//! On-disk addresses
//!
//! `IoAddress` is the only way a component names a location on disk.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::{ChronoError, Result};

/// Encoded size of an address: file (4) + offset (8) + length (4)
pub const ADDRESS_SIZE: usize = 16;

/// Identifies one of the engine's files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    /// The index file (superblocks + tree blocks)
    pub const INDEX: FileId = FileId(1);

    /// The append-only value log
    pub const VALUE_LOG: FileId = FileId(2);
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FileId::INDEX => write!(f, "index"),
            FileId::VALUE_LOG => write!(f, "value-log"),
            FileId(other) => write!(f, "file-{}", other),
        }
    }
}

/// (file, byte offset, length) triple naming a block or record on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoAddress {
    pub file: FileId,
    pub offset: u64,
    pub len: u32,
}

impl IoAddress {
    pub fn new(file: FileId, offset: u64, len: u32) -> Self {
        Self { file, offset, len }
    }

    /// First byte past the addressed region
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.file.0);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.len);
    }

    pub fn decode_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < ADDRESS_SIZE {
            return Err(ChronoError::corruption("truncated address"));
        }
        let file = FileId(buf.get_u32_le());
        let offset = buf.get_u64_le();
        let len = buf.get_u32_le();
        Ok(Self { file, offset, len })
    }
}

impl fmt::Display for IoAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.file, self.offset, self.len)
    }
}
