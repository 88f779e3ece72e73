//! Hash Index
//!
//! Version chains for recently written keys live in a hash map; everything
//! older lives in an immutable tree image on disk. A flush merges both into
//! a brand-new image with [`TreeBuilder`] and swaps the root.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::iter::Peekable;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::IndexKind;
use crate::error::Result;
use crate::io::IoHandle;
use crate::storage::{BlockSearcher, BlockWriter, TreeBuilder, TreeRoot};

use super::range::{KeyRange, ScanStart};
use super::types::{compare, IndexEntry, Version};
use super::{FlushOutcome, IndexBackend, TreeGeometry};

#[derive(Default)]
struct HashState {
    /// Newest version first
    chains: HashMap<Vec<u8>, Vec<IndexEntry>>,
    buffered: usize,
}

/// Hash-map backend
///
/// ## Concurrency:
/// - `state` is always locked before `root`; readers snapshot the root
///   while holding `state` so a concurrent flush cannot hide entries
///   between the two
pub struct HashIndex {
    io: IoHandle,
    searcher: BlockSearcher,
    geometry: TreeGeometry,
    state: RwLock<HashState>,
    root: RwLock<Option<TreeRoot>>,
    next_block_offset: AtomicU64,
}

impl HashIndex {
    pub fn open(
        io: IoHandle,
        searcher: BlockSearcher,
        geometry: TreeGeometry,
        root: Option<TreeRoot>,
        next_block_offset: u64,
    ) -> Self {
        tracing::debug!(root = ?root.map(|r| r.address.offset), "hash index opened");
        Self {
            io,
            searcher,
            geometry,
            state: RwLock::new(HashState::default()),
            root: RwLock::new(root),
            next_block_offset: AtomicU64::new(next_block_offset),
        }
    }

    /// Number of keys with buffered versions
    pub fn buffered_keys(&self) -> usize {
        self.state.read().chains.len()
    }

    /// Buffered entries admitted by `range` and `start`, sorted
    fn memory_entries(state: &HashState, range: &KeyRange, start: &ScanStart) -> Vec<IndexEntry> {
        let mut entries: Vec<IndexEntry> = state
            .chains
            .iter()
            .filter(|(key, _)| range.contains(key))
            .flat_map(|(_, chain)| chain.iter())
            .filter(|entry| start.admits(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| compare(&a.key, a.version, &b.key, b.version));
        entries
    }
}

impl IndexBackend for HashIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Hash
    }

    fn insert(&self, entry: IndexEntry) -> Result<()> {
        let mut state = self.state.write();
        let chain = state.chains.entry(entry.key.clone()).or_default();
        let pos = chain.partition_point(|e| e.version > entry.version);
        let added = if chain.get(pos).map_or(false, |e| e.version == entry.version) {
            chain[pos] = entry;
            false
        } else {
            chain.insert(pos, entry);
            true
        };
        if added {
            state.buffered += 1;
        }
        Ok(())
    }

    fn lookup_as_of(&self, key: &[u8], as_of: Version) -> Result<Option<IndexEntry>> {
        let root = {
            let state = self.state.read();
            if let Some(chain) = state.chains.get(key) {
                if let Some(entry) = chain.iter().find(|e| e.version <= as_of) {
                    return Ok(Some(entry.clone()));
                }
            }
            *self.root.read()
        };
        match root {
            Some(root) => self.searcher.lookup_as_of(root.address, key, as_of),
            None => Ok(None),
        }
    }

    fn scan_page(&self, range: &KeyRange, start: &ScanStart, limit: usize) -> Result<Vec<IndexEntry>> {
        let (mut memory, root) = {
            let state = self.state.read();
            (Self::memory_entries(&state, range, start), *self.root.read())
        };
        memory.truncate(limit);

        let disk: Vec<Result<IndexEntry>> = match root {
            Some(root) => self
                .searcher
                .scan_from(root.address, range.clone(), start.clone())
                .take(limit)
                .collect(),
            None => Vec::new(),
        };

        MergeSorted::new(disk.into_iter(), memory).take(limit).collect()
    }

    fn flush(&self) -> Result<FlushOutcome> {
        let (memory, root) = {
            let state = self.state.read();
            let root = *self.root.read();
            if state.buffered == 0 && root.is_some() {
                return Ok(FlushOutcome {
                    root,
                    blocks_written: 0,
                    next_block_offset: self.next_block_offset(),
                });
            }
            (
                Self::memory_entries(&state, &KeyRange::all(), &ScanStart::Unbounded),
                root,
            )
        };
        let buffered = memory.len();

        let writer = BlockWriter::new(
            self.io.clone(),
            self.geometry.page_size,
            self.next_block_offset(),
        );
        let mut builder = TreeBuilder::new(writer, self.geometry.min_fill, self.geometry.max_fill);
        let disk = root.map(|root| self.searcher.scan(root.address, KeyRange::all()));
        for entry in MergeSorted::new(disk.into_iter().flatten(), memory) {
            builder.add(entry?)?;
        }
        let built = builder.finish()?;

        {
            let mut state = self.state.write();
            *self.root.write() = Some(built.root);
            state.chains.clear();
            state.buffered = 0;
        }
        self.next_block_offset
            .store(built.next_block_offset, Ordering::Release);

        tracing::debug!(
            merged = buffered,
            entries = built.entries,
            blocks = built.blocks_written,
            root = %built.root.address,
            "hash index rebuilt"
        );
        Ok(FlushOutcome {
            root: Some(built.root),
            blocks_written: built.blocks_written,
            next_block_offset: built.next_block_offset,
        })
    }

    fn root(&self) -> Option<TreeRoot> {
        *self.root.read()
    }

    fn dirty_count(&self) -> usize {
        self.state.read().buffered
    }

    fn next_block_offset(&self) -> u64 {
        self.next_block_offset.load(Ordering::Acquire)
    }
}

/// Merge of an on-disk stream with sorted buffered entries; on an equal
/// `(key, version)` the buffered entry wins
struct MergeSorted<D: Iterator<Item = Result<IndexEntry>>> {
    disk: Peekable<D>,
    memory: Peekable<std::vec::IntoIter<IndexEntry>>,
}

impl<D: Iterator<Item = Result<IndexEntry>>> MergeSorted<D> {
    fn new(disk: D, memory: Vec<IndexEntry>) -> Self {
        Self {
            disk: disk.peekable(),
            memory: memory.into_iter().peekable(),
        }
    }
}

impl<D: Iterator<Item = Result<IndexEntry>>> Iterator for MergeSorted<D> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let order = match (self.disk.peek(), self.memory.peek()) {
            (None, None) => return None,
            (Some(Err(_)), _) | (Some(Ok(_)), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (Some(Ok(d)), Some(m)) => compare(&d.key, d.version, &m.key, m.version),
        };
        match order {
            CmpOrdering::Less => self.disk.next(),
            CmpOrdering::Greater => self.memory.next().map(Ok),
            CmpOrdering::Equal => {
                self.disk.next();
                self.memory.next().map(Ok)
            }
        }
    }
}

