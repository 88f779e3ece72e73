//! Storage Module
//!
//! Fixed-size index blocks on the index file.
//!
//! ## Responsibilities
//! - Encode tree nodes into checksummed, page-sized blocks
//! - Read-only lookups and scans over a persisted tree image
//! - Bulk-load a tree image from a sorted entry stream
//! - Double-slot superblock naming the current root and replay offset
//!
//! ## Index File Layout
//! ```text
//! ┌────────────────────────────────────────┐ 0
//! │ Superblock slot 0                      │
//! ├────────────────────────────────────────┤ page_size
//! │ Superblock slot 1                      │
//! ├────────────────────────────────────────┤ 2 * page_size
//! │ Block │ Block │ Block │ ...            │
//! │ (append-only, one node per block)      │
//! └────────────────────────────────────────┘
//! ```
//! Blocks are never rewritten in place: a flush writes new blocks for
//! every changed node and the superblock switches to the new root.

pub mod block;
mod builder;
mod searcher;
mod superblock;

use crate::io::IoAddress;

pub use block::{Block, BlockHeader, NodeKind, BLOCK_HEADER_SIZE, BLOCK_MAGIC};
pub use builder::{BlockWriter, BuiltTree, TreeBuilder};
pub use searcher::{ActorBlockSource, BlockScan, BlockSearcher, BlockSource};
pub use superblock::{CheckpointMeta, Superblock, SUPERBLOCK_MAGIC};

/// Root block of a persisted tree image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub address: IoAddress,
    /// Number of levels, leaves included
    pub height: u32,
}
