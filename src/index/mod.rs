//! Index Module
//!
//! Versioned, ordered index over `(key, version)` pairs.
//!
//! ## Responsibilities
//! - Allocate per-key versions and enforce write-ahead ordering
//! - Point-in-time lookups (`get_as_of`) and restartable range scans
//! - Interchangeable backends behind [`IndexBackend`]:
//!   - [`BTreeIndex`]: copy-on-write B+Tree with fault-in and eviction
//!   - [`HashIndex`]: in-memory version chains over a bulk-built image
//!
//! ## Ordering
//! ```text
//! ("a", 3) < ("a", 2) < ("a", 1) < ("b", 7) < ("b", 1)
//!   key ascending, version descending (newest first)
//! ```

mod btree;
mod hash;
mod node;
mod range;
mod scan;
mod types;
mod versioned;

use crate::config::{Config, IndexKind};
use crate::error::Result;

pub use crate::storage::TreeRoot;
pub use btree::{BTreeIndex, IndexStats, TreeShape};
pub use hash::HashIndex;
pub use node::{Child, InternalNode, LeafNode, Node, NodeId};
pub use range::{KeyRange, ScanStart};
pub use scan::Scan;
pub use types::{compare, Entry, IndexEntry, ValueRef, Version, VersionedKey};
pub use versioned::VersionedIndex;

/// Node geometry shared by both backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeGeometry {
    pub page_size: usize,
    pub min_fill: usize,
    pub max_fill: usize,
    pub max_resident_nodes: usize,
}

impl TreeGeometry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.page_size,
            min_fill: config.min_fill,
            max_fill: config.max_fill,
            max_resident_nodes: config.max_resident_nodes,
        }
    }
}

/// What a flush left on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Root of the image now on disk; `None` if nothing was ever flushed
    pub root: Option<TreeRoot>,
    pub blocks_written: usize,
    pub next_block_offset: u64,
}

/// Capability interface implemented by every index structure.
///
/// Writers (`prepare_insert`, `insert`, `flush`) are serialized by the
/// caller; lookups and scans may run concurrently with them.
pub trait IndexBackend: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Do any I/O an insert of `target` would need, so that the following
    /// [`insert`](Self::insert) only touches memory
    fn prepare_insert(&self, _target: &VersionedKey) -> Result<()> {
        Ok(())
    }

    /// Add an entry, replacing one with the same key and version
    fn insert(&self, entry: IndexEntry) -> Result<()>;

    /// Newest entry for `key` with a version `<= as_of`, tombstones included
    fn lookup_as_of(&self, key: &[u8], as_of: Version) -> Result<Option<IndexEntry>>;

    /// Up to `limit` entries in composite order, starting at `start`.
    /// An empty page means the scan is finished.
    fn scan_page(&self, range: &KeyRange, start: &ScanStart, limit: usize) -> Result<Vec<IndexEntry>>;

    /// Persist every change since the last flush under fresh block addresses
    fn flush(&self) -> Result<FlushOutcome>;

    /// Root of the last flushed image
    fn root(&self) -> Option<TreeRoot>;

    /// Unflushed work: dirty nodes or buffered entries
    fn dirty_count(&self) -> usize;

    fn next_block_offset(&self) -> u64;
}
