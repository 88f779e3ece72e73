//! Engine Module
//!
//! The embedded storage engine that wires all components together.
//!
//! ## Responsibilities
//! - Own one I/O actor per file (index file, value log)
//! - Recover the index from the last checkpoint plus value-log replay
//! - Route reads and writes to the versioned index
//! - Write checkpoints (flush + superblock) on demand, on close and when
//!   enough unflushed work has piled up

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{Config, IndexKind};
use crate::error::{ChronoError, Result};
use crate::index::{
    BTreeIndex, Entry, FlushOutcome, HashIndex, IndexBackend, KeyRange, Scan, ScanStart, TreeGeometry, Version,
    VersionedIndex,
};
use crate::io::{FileId, IoActor};
use crate::storage::{BlockSearcher, CheckpointMeta, Superblock};
use crate::wal::{RecoveryResult, ValueLog, ValueLogRecovery};

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (put/delete/flush/checkpoint): serialized inside
///   [`VersionedIndex`]; a checkpoint additionally holds `superblock`
///   (always taken before the index writer lock)
/// - **Reads** (get/get_as_of/scan/history): never wait for the writer;
///   they only take the backend's read locks page by page
///
/// ## Lifecycle
/// `open` → operations → `close`. Dropping an engine without `close` skips
/// the final checkpoint; the next `open` replays the value log instead.
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Actors are taken out on close so their threads stop
    index_actor: Mutex<Option<IoActor>>,
    log_actor: Mutex<Option<IoActor>>,

    index: VersionedIndex,

    /// Last committed checkpoint; also serializes checkpoints
    superblock: Mutex<Superblock>,

    closed: AtomicBool,

    /// What replay did during `open`
    recovery: RecoveryResult,
}

impl Engine {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const INDEX_FILENAME: &'static str = "index.db";
    const VALUE_LOG_FILENAME: &'static str = "values.log";

    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate the config and create the data directory
    /// 2. Start the index-file and value-log actors
    /// 3. Load the newest valid superblock slot
    /// 4. Attach the configured backend to the checkpointed root
    /// 5. Replay the value log from the checkpoint's replay offset
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Configuration and directory
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        // Step 2: One actor per file
        let index_actor = IoActor::spawn(&config.data_dir.join(Self::INDEX_FILENAME), FileId::INDEX)?;
        let log_actor = IoActor::spawn(&config.data_dir.join(Self::VALUE_LOG_FILENAME), FileId::VALUE_LOG)?;
        let index_io = index_actor.handle().with_timeout(config.io_timeout);
        let log_io = log_actor.handle().with_timeout(config.io_timeout);

        // Step 3: Checkpoint
        let superblock = Superblock::load(index_io.clone(), config.page_size, config.index_kind.as_u8())?;
        let meta = superblock.meta().clone();
        if meta.sequence > 0 {
            let stored = IndexKind::from_u8(meta.index_kind)?;
            if stored != config.index_kind {
                tracing::info!(from = ?stored, to = ?config.index_kind, "switching index backend");
            }
        }

        // Step 4: Index over the checkpointed image
        let log = Arc::new(ValueLog::open(log_io, config.sync_strategy)?);
        let geometry = TreeGeometry::from_config(&config);
        let searcher = BlockSearcher::over_actor(index_io.clone(), config.page_size);
        let backend: Box<dyn IndexBackend> = match config.index_kind {
            IndexKind::BTree => Box::new(BTreeIndex::open(
                index_io,
                searcher,
                geometry,
                meta.root(),
                meta.next_block_offset,
            )),
            IndexKind::Hash => Box::new(HashIndex::open(
                index_io,
                searcher,
                geometry,
                meta.root(),
                meta.next_block_offset,
            )),
        };
        let index = VersionedIndex::new(backend, Arc::clone(&log), &config);

        // Step 5: Replay everything written after the checkpoint
        let recovery = ValueLogRecovery::replay(&log, meta.replay_offset, |address, record| {
            index.replay(address, record)
        })?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            index = ?config.index_kind,
            checkpoint = meta.sequence,
            replayed = recovery.records_applied,
            truncated = recovery.was_truncated,
            "engine opened"
        );

        Ok(Self {
            config,
            index_actor: Mutex::new(Some(index_actor)),
            log_actor: Mutex::new(Some(log_actor)),
            index,
            superblock: Mutex::new(superblock),
            closed: AtomicBool::new(false),
            recovery,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `value` as the next version of `key`
    ///
    /// A returned version is committed. An automatic checkpoint that fails
    /// afterwards is logged and retried, never reported as a failed put.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Version> {
        self.ensure_open()?;
        let version = self.index.put(key, value)?;
        self.maybe_checkpoint();
        Ok(version)
    }

    /// Record a deletion of `key` as a new version
    pub fn delete(&self, key: &[u8]) -> Result<Version> {
        self.ensure_open()?;
        let version = self.index.delete(key)?;
        self.maybe_checkpoint();
        Ok(version)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Newest live version of `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.ensure_open()?;
        self.index.get(key)
    }

    /// Newest version of `key` at or below `version`, unless it is a tombstone
    pub fn get_as_of(&self, key: &[u8], version: Version) -> Result<Option<Entry>> {
        self.ensure_open()?;
        self.index.get_as_of(key, version)
    }

    /// Lazy scan over every version of every key in `range`
    pub fn scan(&self, range: KeyRange) -> Result<Scan<'_>> {
        self.ensure_open()?;
        Ok(self.index.scan(range))
    }

    /// Restart a scan from a position returned by [`Scan::resume_position`]
    pub fn scan_from(&self, range: KeyRange, start: ScanStart) -> Result<Scan<'_>> {
        self.ensure_open()?;
        Ok(self.index.scan_from(range, start))
    }

    /// All versions of `key`, newest first
    pub fn history(&self, key: &[u8]) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        self.index.history(key)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write dirty index state to fresh blocks without moving the checkpoint
    pub fn flush(&self) -> Result<FlushOutcome> {
        self.ensure_open()?;
        self.index.flush()
    }

    /// Flush the index and record the value-log replay offset in the superblock
    pub fn checkpoint(&self) -> Result<CheckpointMeta> {
        self.ensure_open()?;
        self.checkpoint_internal()
    }

    fn checkpoint_internal(&self) -> Result<CheckpointMeta> {
        let mut superblock = self.superblock.lock();
        let kind = self.config.index_kind.as_u8();
        let outcome = self.index.checkpoint(|outcome, replay_offset| {
            let mut next = superblock.meta().clone();
            next.root_offset = outcome.root.map(|root| root.address.offset);
            next.height = outcome.root.map_or(0, |root| root.height);
            next.replay_offset = replay_offset;
            next.next_block_offset = outcome.next_block_offset;
            next.index_kind = kind;
            superblock.commit(next)
        })?;

        let meta = superblock.meta().clone();
        tracing::info!(
            sequence = meta.sequence,
            blocks = outcome.blocks_written,
            replay_offset = meta.replay_offset,
            "checkpoint written"
        );
        Ok(meta)
    }

    /// Checkpoint once enough unflushed work has piled up.
    ///
    /// The write that triggered it is already in the value log, so a failure
    /// here is only logged. Dirty state stays behind and the next write (or an
    /// explicit [`checkpoint`](Self::checkpoint)) tries again.
    fn maybe_checkpoint(&self) {
        let dirty = self.index.dirty_count();
        if dirty < self.config.checkpoint_dirty_limit {
            return;
        }
        tracing::debug!(dirty, "dirty limit reached, checkpointing");
        if let Err(e) = self.checkpoint_internal() {
            tracing::error!(error = %e, dirty, "automatic checkpoint failed");
        }
    }

    /// Checkpoint, then stop both actors. Every later call returns `Closed`.
    pub fn close(&self) -> Result<()> {
        self.ensure_open()?;
        self.checkpoint_internal()?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ChronoError::Closed);
        }

        for actor in [&self.index_actor, &self.log_actor] {
            if let Some(actor) = actor.lock().take() {
                actor.shutdown();
            }
        }
        tracing::info!(data_dir = %self.config.data_dir.display(), "engine closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChronoError::Closed);
        }
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Path of the index file
    pub fn index_path(&self) -> PathBuf {
        self.config.data_dir.join(Self::INDEX_FILENAME)
    }

    /// Path of the value log
    pub fn value_log_path(&self) -> PathBuf {
        self.config.data_dir.join(Self::VALUE_LOG_FILENAME)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replay statistics from `open`
    pub fn recovery(&self) -> &RecoveryResult {
        &self.recovery
    }

    /// Last committed checkpoint
    pub fn checkpoint_meta(&self) -> CheckpointMeta {
        self.superblock.lock().meta().clone()
    }

    /// Unflushed nodes or entries in the index
    pub fn dirty_count(&self) -> usize {
        self.index.dirty_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
