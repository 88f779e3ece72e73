//! Index block format
//!
//! Every tree node is serialized into one fixed-size block.
//!
//! ## Layout
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Header (20 bytes)                                                │
//! │   Magic "CKVB" (4) | Format u16 (2) | Kind u8 (1) | Reserved (1) │
//! │   Level u16 (2) | Entry count u16 (2) | Payload len u32 (4)      │
//! │   CRC32 u32 (4) over header (CRC zeroed) + payload               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Payload                                                          │
//! │   Leaf:     [KeyLen u16][Key][Version u64][Ts u64][Tag u8][Val]  │
//! │             Tag 0: [Len u32][Bytes]  1: [Address 16]  2: (none)  │
//! │   Internal: [Address 16] then per separator                      │
//! │             [KeyLen u16][Key][Version u64][Address 16]           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Zero padding up to the page size                                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut};

use crate::error::{ChronoError, Result};
use crate::index::{Child, IndexEntry, InternalNode, LeafNode, Node, ValueRef, VersionedKey};
use crate::io::{IoAddress, ADDRESS_SIZE};

/// Magic bytes identifying a ChronoKV index block
pub const BLOCK_MAGIC: &[u8; 4] = b"CKVB";

/// Current block format version
pub const BLOCK_FORMAT_VERSION: u16 = 1;

/// Header size: Magic (4) + Format (2) + Kind (1) + Reserved (1) + Level (2)
/// + Count (2) + PayloadLen (4) + CRC (4) = 20 bytes
pub const BLOCK_HEADER_SIZE: usize = 20;

const CHECKSUM_OFFSET: usize = 16;

const TAG_INLINE: u8 = 0;
const TAG_LOGGED: u8 = 1;
const TAG_TOMBSTONE: u8 = 2;

/// Leaf entry without key or value: KeyLen (2) + Version (8) + Timestamp (8) + Tag (1)
const LEAF_ENTRY_FIXED: usize = 19;

/// Separator without key: KeyLen (2) + Version (8) + child address
const SEPARATOR_FIXED: usize = 10 + ADDRESS_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf = 1,
    Internal = 2,
}

impl NodeKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(NodeKind::Leaf),
            2 => Ok(NodeKind::Internal),
            other => Err(ChronoError::corruption(format!("unknown node kind {}", other))),
        }
    }
}

/// Decoded block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub format_version: u16,
    pub kind: NodeKind,
    pub level: u16,
    pub entry_count: u16,
    pub payload_len: u32,
    pub checksum: u32,
}

/// A verified, page-sized index block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    header: BlockHeader,
    bytes: Vec<u8>,
}

impl Block {
    /// Serialize `node` into a block of exactly `page_size` bytes.
    ///
    /// `resolve` maps each child of an internal node to its on-disk address.
    /// Fails with `Capacity` when the node does not fit.
    pub fn encode<F>(node: &Node, page_size: usize, mut resolve: F) -> Result<Self>
    where
        F: FnMut(&Child) -> Result<IoAddress>,
    {
        let mut payload = Vec::with_capacity(page_size - BLOCK_HEADER_SIZE.min(page_size));
        let (kind, level, count) = match node {
            Node::Leaf(leaf) => {
                for entry in &leaf.entries {
                    encode_entry(&mut payload, entry);
                }
                (NodeKind::Leaf, 0, leaf.entries.len())
            }
            Node::Internal(inner) => {
                if inner.children.len() != inner.separators.len() + 1 {
                    return Err(ChronoError::corruption(format!(
                        "internal node has {} children for {} separators",
                        inner.children.len(),
                        inner.separators.len()
                    )));
                }
                resolve(&inner.children[0])?.encode_into(&mut payload);
                for (separator, child) in inner.separators.iter().zip(&inner.children[1..]) {
                    payload.put_u16_le(separator.key.len() as u16);
                    payload.put_slice(&separator.key);
                    payload.put_u64_le(separator.version);
                    resolve(child)?.encode_into(&mut payload);
                }
                (NodeKind::Internal, inner.level, inner.children.len())
            }
        };

        if BLOCK_HEADER_SIZE + payload.len() > page_size {
            return Err(ChronoError::Capacity(format!(
                "{:?} node with {} items needs {} bytes, block holds {}",
                kind,
                count,
                BLOCK_HEADER_SIZE + payload.len(),
                page_size
            )));
        }
        if count > u16::MAX as usize {
            return Err(ChronoError::Capacity(format!("{} items exceed the block entry count", count)));
        }

        let mut bytes = Vec::with_capacity(page_size);
        bytes.put_slice(BLOCK_MAGIC);
        bytes.put_u16_le(BLOCK_FORMAT_VERSION);
        bytes.put_u8(kind as u8);
        bytes.put_u8(0);
        bytes.put_u16_le(level);
        bytes.put_u16_le(count as u16);
        bytes.put_u32_le(payload.len() as u32);
        bytes.put_u32_le(0);
        bytes.put_slice(&payload);

        let checksum = crc32fast::hash(&bytes);
        bytes[CHECKSUM_OFFSET..BLOCK_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
        bytes.resize(page_size, 0);

        Ok(Self {
            header: BlockHeader {
                format_version: BLOCK_FORMAT_VERSION,
                kind,
                level,
                entry_count: count as u16,
                payload_len: payload.len() as u32,
                checksum,
            },
            bytes,
        })
    }

    /// Parse and checksum-verify raw block bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(ChronoError::corruption("block shorter than its header"));
        }
        if &bytes[0..4] != BLOCK_MAGIC {
            return Err(ChronoError::corruption(format!(
                "invalid block magic: expected CKVB, got {:?}",
                &bytes[0..4]
            )));
        }

        let mut header = &bytes[4..BLOCK_HEADER_SIZE];
        let format_version = header.get_u16_le();
        if format_version != BLOCK_FORMAT_VERSION {
            return Err(ChronoError::corruption(format!(
                "unsupported block format version {}",
                format_version
            )));
        }
        let kind = NodeKind::from_u8(header.get_u8())?;
        let _reserved = header.get_u8();
        let level = header.get_u16_le();
        let entry_count = header.get_u16_le();
        let payload_len = header.get_u32_le();
        let checksum = header.get_u32_le();

        let end = BLOCK_HEADER_SIZE + payload_len as usize;
        if end > bytes.len() {
            return Err(ChronoError::corruption(format!(
                "block payload length {} exceeds block size {}",
                payload_len,
                bytes.len()
            )));
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..CHECKSUM_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&bytes[BLOCK_HEADER_SIZE..end]);
        let computed = hasher.finalize();
        if computed != checksum {
            return Err(ChronoError::corruption(format!(
                "block checksum mismatch (stored {:#010x}, computed {:#010x})",
                checksum, computed
            )));
        }

        if (kind == NodeKind::Leaf) != (level == 0) {
            return Err(ChronoError::corruption(format!(
                "{:?} block at level {}",
                kind, level
            )));
        }

        Ok(Self {
            header: BlockHeader {
                format_version,
                kind,
                level,
                entry_count,
                payload_len,
                checksum,
            },
            bytes,
        })
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn payload(&self) -> &[u8] {
        &self.bytes[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + self.header.payload_len as usize]
    }

    /// Rebuild the node. Children of internal nodes come back as `OnDisk`.
    pub fn decode_node(&self) -> Result<Node> {
        let mut buf = self.payload();
        let count = self.header.entry_count as usize;

        let node = match self.header.kind {
            NodeKind::Leaf => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(decode_entry(&mut buf)?);
                }
                Node::Leaf(LeafNode { entries })
            }
            NodeKind::Internal => {
                if count == 0 {
                    return Err(ChronoError::corruption("internal block without children"));
                }
                let mut children = Vec::with_capacity(count);
                let mut separators = Vec::with_capacity(count - 1);
                children.push(Child::OnDisk(IoAddress::decode_from(&mut buf)?));
                for _ in 1..count {
                    let key = take_key(&mut buf)?;
                    need(&buf, 8)?;
                    let version = buf.get_u64_le();
                    separators.push(VersionedKey { key, version });
                    children.push(Child::OnDisk(IoAddress::decode_from(&mut buf)?));
                }
                Node::Internal(InternalNode {
                    level: self.header.level,
                    separators,
                    children,
                })
            }
        };

        if buf.has_remaining() {
            return Err(ChronoError::corruption(format!(
                "{} trailing payload bytes in block",
                buf.remaining()
            )));
        }
        Ok(node)
    }
}

// =============================================================================
// Size Accounting
// =============================================================================

/// Largest encoded leaf entry for the given key and inline bounds
pub fn max_leaf_entry_size(max_key_len: usize, inline_value_limit: usize) -> usize {
    LEAF_ENTRY_FIXED + max_key_len + (4 + inline_value_limit).max(ADDRESS_SIZE)
}

/// Bytes needed by the largest possible node with `max_fill` items
pub fn worst_case_node_size(max_fill: usize, max_key_len: usize, inline_value_limit: usize) -> usize {
    let leaf = max_fill * max_leaf_entry_size(max_key_len, inline_value_limit);
    let internal = ADDRESS_SIZE + max_fill.saturating_sub(1) * (SEPARATOR_FIXED + max_key_len);
    BLOCK_HEADER_SIZE + leaf.max(internal)
}

// =============================================================================
// Entry Codec
// =============================================================================

fn encode_entry(buf: &mut Vec<u8>, entry: &IndexEntry) {
    buf.put_u16_le(entry.key.len() as u16);
    buf.put_slice(&entry.key);
    buf.put_u64_le(entry.version);
    buf.put_u64_le(entry.timestamp);
    match &entry.value {
        ValueRef::Inline(value) => {
            buf.put_u8(TAG_INLINE);
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(value);
        }
        ValueRef::Logged(address) => {
            buf.put_u8(TAG_LOGGED);
            address.encode_into(buf);
        }
        ValueRef::Tombstone => buf.put_u8(TAG_TOMBSTONE),
    }
}

fn decode_entry(buf: &mut &[u8]) -> Result<IndexEntry> {
    let key = take_key(buf)?;
    need(buf, 17)?;
    let version = buf.get_u64_le();
    let timestamp = buf.get_u64_le();
    let value = match buf.get_u8() {
        TAG_INLINE => {
            need(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            need(buf, len)?;
            let value = buf[..len].to_vec();
            buf.advance(len);
            ValueRef::Inline(value)
        }
        TAG_LOGGED => ValueRef::Logged(IoAddress::decode_from(buf)?),
        TAG_TOMBSTONE => ValueRef::Tombstone,
        other => {
            return Err(ChronoError::corruption(format!("unknown value tag {}", other)));
        }
    };
    Ok(IndexEntry {
        key,
        version,
        timestamp,
        value,
    })
}

fn take_key(buf: &mut &[u8]) -> Result<Vec<u8>> {
    need(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    need(buf, len)?;
    let key = buf[..len].to_vec();
    buf.advance(len);
    Ok(key)
}

fn need(buf: &&[u8], len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(ChronoError::corruption(format!(
            "block payload truncated: need {} bytes, {} left",
            len,
            buf.remaining()
        )));
    }
    Ok(())
}
