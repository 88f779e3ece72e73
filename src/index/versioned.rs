//! Versioned Index
//!
//! Front door of the index: allocates versions, appends to the value log
//! before touching the index, and resolves value references on reads.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{ChronoError, Result};
use crate::io::IoAddress;
use crate::storage::TreeRoot;
use crate::wal::{ValueLog, ValueLogRecord};

use super::range::{KeyRange, ScanStart};
use super::scan::Scan;
use super::types::{Entry, IndexEntry, ValueRef, Version, VersionedKey};
use super::{FlushOutcome, IndexBackend};

/// Versioned key-value index over a pluggable [`IndexBackend`]
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader
/// - `put`, `delete`, `flush`, replay and checkpoint hold `writer`
/// - Reads never take `writer`; the backend's own locks keep them safe
///
/// ## Write-ahead ordering
/// 1. allocate `latest + 1` as the new version
/// 2. `prepare_insert` (may fault in blocks)
/// 3. append the record to the value log; on failure nothing changes
/// 4. insert the entry (memory only); a failure here is reported as
///    [`ChronoError::NotIndexed`] because the record is already durable
///
/// After a `NotIndexed` failure the index is behind the log: further writes
/// and checkpoints are refused until a reopen replays the missing record.
pub struct VersionedIndex {
    backend: Box<dyn IndexBackend>,
    log: Arc<ValueLog>,
    /// Logged version that never reached the index, if any
    writer: Mutex<Option<Version>>,
    max_key_len: usize,
    inline_value_limit: usize,
    page_len: usize,
}

impl VersionedIndex {
    pub fn new(backend: Box<dyn IndexBackend>, log: Arc<ValueLog>, config: &Config) -> Self {
        Self {
            backend,
            log,
            writer: Mutex::new(None),
            max_key_len: config.max_key_len,
            inline_value_limit: config.inline_value_limit,
            page_len: config.max_fill,
        }
    }

    pub fn backend(&self) -> &dyn IndexBackend {
        self.backend.as_ref()
    }

    pub fn log(&self) -> &Arc<ValueLog> {
        &self.log
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store a new version of `key` and return its version number
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Version> {
        self.write(key, Some(value))
    }

    /// Record a tombstone as a new version of `key`.
    ///
    /// Deleting a key that never existed still records the tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<Version> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<Version> {
        if key.len() > self.max_key_len {
            return Err(ChronoError::Capacity(format!(
                "key of {} bytes exceeds max_key_len {}",
                key.len(),
                self.max_key_len
            )));
        }

        let mut writer = self.writer.lock();
        ensure_indexed(&writer)?;

        let version = self
            .backend
            .lookup_as_of(key, Version::MAX)?
            .map_or(0, |latest| latest.version)
            + 1;
        self.backend
            .prepare_insert(&VersionedKey::new(key, version))?;

        let record = match value {
            Some(value) => ValueLogRecord::put(key.to_vec(), version, value.to_vec()),
            None => ValueLogRecord::tombstone(key.to_vec(), version),
        };
        let address = self.log.append(&record)?;

        self.backend
            .insert(IndexEntry::from_record(&record, address, self.inline_value_limit))
            .map_err(|source| {
                *writer = Some(version);
                ChronoError::NotIndexed {
                    version,
                    source: Box::new(source),
                }
            })?;
        Ok(version)
    }

    /// Re-apply a record found in the value log during recovery
    pub(crate) fn replay(&self, address: IoAddress, record: ValueLogRecord) -> Result<()> {
        let _writer = self.writer.lock();
        let entry = IndexEntry::from_record(&record, address, self.inline_value_limit);
        self.backend.prepare_insert(&entry.versioned_key())?;
        self.backend.insert(entry)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Newest live version of `key`; `None` if absent or deleted
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.get_as_of(key, Version::MAX)
    }

    /// Newest version `<= version`; `None` if there is none or it is a tombstone
    pub fn get_as_of(&self, key: &[u8], version: Version) -> Result<Option<Entry>> {
        match self.backend.lookup_as_of(key, version)? {
            Some(entry) if !entry.is_tombstone() => self.resolve(entry).map(Some),
            _ => Ok(None),
        }
    }

    /// Turn a leaf entry into a caller-facing entry, reading logged values
    /// back from the value log
    pub fn resolve(&self, entry: IndexEntry) -> Result<Entry> {
        let value = match entry.value {
            ValueRef::Inline(value) => Some(value),
            ValueRef::Tombstone => None,
            ValueRef::Logged(address) => {
                let record = self.log.read(address)?;
                if record.key != entry.key || record.version != entry.version {
                    return Err(ChronoError::corruption(format!(
                        "value log record at {} belongs to {:?}@{}, expected {:?}@{}",
                        address, record.key, record.version, entry.key, entry.version
                    )));
                }
                match record.value {
                    Some(value) => Some(value),
                    None => {
                        return Err(ChronoError::corruption(format!(
                            "logged value at {} is a tombstone",
                            address
                        )));
                    }
                }
            }
        };
        Ok(Entry {
            key: entry.key,
            version: entry.version,
            timestamp: entry.timestamp,
            value,
        })
    }

    /// Every version in `range`, key ascending then newest first
    pub fn scan(&self, range: KeyRange) -> Scan<'_> {
        let start = range.start_position();
        Scan::new(self, range, start, self.page_len)
    }

    /// Resume a scan at `start` (see [`Scan::resume_position`])
    pub fn scan_from(&self, range: KeyRange, start: ScanStart) -> Scan<'_> {
        Scan::new(self, range, start, self.page_len)
    }

    /// Full version chain of `key`, newest first, tombstones included
    pub fn history(&self, key: &[u8]) -> Result<Vec<Entry>> {
        self.scan(KeyRange::single(key)).collect()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn flush(&self) -> Result<FlushOutcome> {
        let _writer = self.writer.lock();
        self.backend.flush()
    }

    /// Sync the log, flush the index and hand both positions to `commit`
    /// while writers are still excluded
    pub(crate) fn checkpoint<F>(&self, commit: F) -> Result<FlushOutcome>
    where
        F: FnOnce(&FlushOutcome, u64) -> Result<()>,
    {
        let writer = self.writer.lock();
        ensure_indexed(&writer)?;
        self.log.sync()?;
        let replay_offset = self.log.append_offset();
        let outcome = self.backend.flush()?;
        commit(&outcome, replay_offset)?;
        Ok(outcome)
    }

    pub fn dirty_count(&self) -> usize {
        self.backend.dirty_count()
    }

    pub fn root(&self) -> Option<TreeRoot> {
        self.backend.root()
    }
}

fn ensure_indexed(unindexed: &Option<Version>) -> Result<()> {
    match unindexed {
        Some(version) => Err(ChronoError::corruption(format!(
            "logged version {} is missing from the index; reopen to replay the value log",
            version
        ))),
        None => Ok(()),
    }
}
