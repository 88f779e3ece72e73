//! Configuration for ChronoKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ChronoError, Result};
use crate::storage::block;

/// Main configuration for a ChronoKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── index.db         (superblocks + fixed-size index blocks)
    ///     └── values.log       (append-only value log)
    pub data_dir: PathBuf,

    /// Size of every index block (and superblock slot) in bytes
    pub page_size: usize,

    // -------------------------------------------------------------------------
    // Tree Geometry
    // -------------------------------------------------------------------------
    /// Maximum entries per leaf / children per internal node
    pub max_fill: usize,

    /// Minimum occupancy for every non-root node
    pub min_fill: usize,

    /// Longest key accepted by `put`/`delete`
    pub max_key_len: usize,

    /// Values up to this many bytes are stored inside the leaf entry;
    /// larger values are referenced by their value-log address
    pub inline_value_limit: usize,

    /// Which index structure backs the engine
    pub index_kind: IndexKind,

    // -------------------------------------------------------------------------
    // Value Log Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync the value log
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Memory / Checkpoint Configuration
    // -------------------------------------------------------------------------
    /// Dirty nodes (or buffered entries for the hash index) that trigger
    /// an automatic checkpoint after a write
    pub checkpoint_dirty_limit: usize,

    /// Resident node budget; clean nodes above it are evicted after a flush
    pub max_resident_nodes: usize,

    /// Optional upper bound on how long a caller waits for one I/O request
    pub io_timeout: Option<Duration>,
}

/// Value log sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every append (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced appends (balanced durability/performance)
    EveryNEntries { count: usize },
}

/// Index structure selected at construction time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Copy-on-write B+Tree whose nodes map 1:1 to index blocks
    BTree,

    /// Hash map of version chains over an immutable flushed tree image
    Hash,
}

impl IndexKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            IndexKind::BTree => 1,
            IndexKind::Hash => 2,
        }
    }

    pub(crate) fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(IndexKind::BTree),
            2 => Ok(IndexKind::Hash),
            other => Err(ChronoError::corruption(format!("unknown index kind {}", other))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./chronokv_data"),
            page_size: 4096,
            max_fill: 32,
            min_fill: 16,
            max_key_len: 64,
            inline_value_limit: 32,
            index_kind: IndexKind::BTree,
            sync_strategy: SyncStrategy::EveryNEntries { count: 100 },
            checkpoint_dirty_limit: 1024,
            max_resident_nodes: 4096,
            io_timeout: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check fill bounds and that a full node of worst-case entries fits one block
    pub fn validate(&self) -> Result<()> {
        if self.max_fill < 4 {
            return Err(ChronoError::Config(format!(
                "max_fill must be at least 4, got {}",
                self.max_fill
            )));
        }
        if self.min_fill < 1 || self.min_fill > self.max_fill / 2 {
            return Err(ChronoError::Config(format!(
                "min_fill must be within [1, max_fill / 2] = [1, {}], got {}",
                self.max_fill / 2,
                self.min_fill
            )));
        }
        if self.max_key_len == 0 || self.max_key_len > u16::MAX as usize {
            return Err(ChronoError::Config(format!(
                "max_key_len must be within [1, {}], got {}",
                u16::MAX,
                self.max_key_len
            )));
        }
        if let SyncStrategy::EveryNEntries { count: 0 } = self.sync_strategy {
            return Err(ChronoError::Config(
                "EveryNEntries sync strategy needs a count of at least 1".to_string(),
            ));
        }

        let worst = block::worst_case_node_size(
            self.max_fill,
            self.max_key_len,
            self.inline_value_limit,
        );
        if worst > self.page_size {
            return Err(ChronoError::Config(format!(
                "page_size {} cannot hold a full node of {} worst-case entries ({} bytes needed)",
                self.page_size, self.max_fill, worst
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the index block size
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.config.page_size = bytes;
        self
    }

    /// Set the node occupancy bounds
    pub fn fill_bounds(mut self, min_fill: usize, max_fill: usize) -> Self {
        self.config.min_fill = min_fill;
        self.config.max_fill = max_fill;
        self
    }

    /// Set the maximum accepted key length
    pub fn max_key_len(mut self, len: usize) -> Self {
        self.config.max_key_len = len;
        self
    }

    /// Set the largest value stored inline in a leaf entry
    pub fn inline_value_limit(mut self, len: usize) -> Self {
        self.config.inline_value_limit = len;
        self
    }

    /// Select the index structure
    pub fn index_kind(mut self, kind: IndexKind) -> Self {
        self.config.index_kind = kind;
        self
    }

    /// Set the value log sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the dirty-node count that triggers an automatic checkpoint
    pub fn checkpoint_dirty_limit(mut self, limit: usize) -> Self {
        self.config.checkpoint_dirty_limit = limit;
        self
    }

    /// Set the resident node budget
    pub fn max_resident_nodes(mut self, count: usize) -> Self {
        self.config.max_resident_nodes = count;
        self
    }

    /// Set the per-request I/O timeout
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
