//! Block Searcher
//!
//! Read-only traversal of a persisted tree image. Every block comes through
//! a [`BlockSource`], so a page cache can be slotted in without touching the
//! traversal code.

use std::sync::Arc;

use crate::error::{ChronoError, Result};
use crate::index::{Child, IndexEntry, KeyRange, Node, ScanStart, Version, VersionedKey};
use crate::io::{FileId, IoAddress, IoHandle};

use super::block::Block;

/// Supplies verified blocks by address
pub trait BlockSource: Send + Sync {
    fn fetch_block(&self, address: IoAddress) -> Result<Block>;
}

/// Reads blocks straight from the index file actor
pub struct ActorBlockSource {
    io: IoHandle,
    page_size: usize,
}

impl ActorBlockSource {
    pub fn new(io: IoHandle, page_size: usize) -> Self {
        Self { io, page_size }
    }
}

impl BlockSource for ActorBlockSource {
    fn fetch_block(&self, address: IoAddress) -> Result<Block> {
        if address.file != FileId::INDEX || address.len as usize != self.page_size {
            return Err(ChronoError::corruption(format!(
                "address {} is not an index block of {} bytes",
                address, self.page_size
            )));
        }
        let bytes = self.io.read(address.offset, address.len as usize)?;
        Block::from_bytes(bytes)
    }
}

/// Point lookups and range scans over blocks on disk
#[derive(Clone)]
pub struct BlockSearcher {
    source: Arc<dyn BlockSource>,
}

impl BlockSearcher {
    pub fn new(source: Arc<dyn BlockSource>) -> Self {
        Self { source }
    }

    /// Searcher reading through an index file actor
    pub fn over_actor(io: IoHandle, page_size: usize) -> Self {
        Self::new(Arc::new(ActorBlockSource::new(io, page_size)))
    }

    pub fn fetch_block(&self, address: IoAddress) -> Result<Block> {
        self.source.fetch_block(address)
    }

    /// Fetch and decode one node; its children come back `OnDisk`
    pub fn fetch_node(&self, address: IoAddress) -> Result<Node> {
        self.fetch_block(address)?.decode_node()
    }

    /// First entry at or after `target` in composite order
    pub fn seek(&self, root: IoAddress, target: &VersionedKey) -> Result<Option<IndexEntry>> {
        self.scan_from(root, KeyRange::all(), ScanStart::At(target.clone()))
            .next()
            .transpose()
    }

    /// Newest version of `key`, tombstones included
    pub fn lookup(&self, root: IoAddress, key: &[u8]) -> Result<Option<IndexEntry>> {
        self.lookup_as_of(root, key, Version::MAX)
    }

    /// Newest version of `key` that is `<= as_of`
    pub fn lookup_as_of(&self, root: IoAddress, key: &[u8], as_of: Version) -> Result<Option<IndexEntry>> {
        self.scan_from(
            root,
            KeyRange::single(key),
            ScanStart::At(VersionedKey::new(key, as_of)),
        )
        .next()
        .transpose()
    }

    /// Every version of every key in `range`, in composite order
    pub fn scan(&self, root: IoAddress, range: KeyRange) -> BlockScan {
        let start = range.start_position();
        self.scan_from(root, range, start)
    }

    /// Like [`scan`](Self::scan) but starting at an explicit position
    pub fn scan_from(&self, root: IoAddress, range: KeyRange, start: ScanStart) -> BlockScan {
        BlockScan {
            searcher: self.clone(),
            range,
            start,
            root: Some(root),
            stack: Vec::new(),
            done: false,
        }
    }
}

enum Frame {
    Leaf(std::vec::IntoIter<IndexEntry>),
    Internal(std::vec::IntoIter<Child>),
}

/// Lazy depth-first scan; blocks are fetched only when the scan reaches them
pub struct BlockScan {
    searcher: BlockSearcher,
    range: KeyRange,
    start: ScanStart,
    root: Option<IoAddress>,
    stack: Vec<Frame>,
    done: bool,
}

impl BlockScan {
    fn descend(&mut self, address: IoAddress) -> Result<()> {
        match self.searcher.fetch_node(address)? {
            Node::Leaf(mut leaf) => {
                let first = self.start.first_index(&leaf.entries);
                let entries = leaf.entries.split_off(first);
                self.stack.push(Frame::Leaf(entries.into_iter()));
            }
            Node::Internal(mut inner) => {
                let first = self.start.child_index(&inner.separators);
                let children = inner.children.split_off(first);
                self.stack.push(Frame::Internal(children.into_iter()));
            }
        }
        Ok(())
    }

    fn fail(&mut self, error: ChronoError) -> Option<Result<IndexEntry>> {
        self.done = true;
        Some(Err(error))
    }
}

impl Iterator for BlockScan {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(root) = self.root.take() {
            if let Err(e) = self.descend(root) {
                return self.fail(e);
            }
        }

        loop {
            let child = match self.stack.last_mut() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Frame::Leaf(entries)) => match entries.next() {
                    Some(entry) => {
                        if self.range.is_past_end(&entry.key) {
                            self.done = true;
                            return None;
                        }
                        if self.start.admits(&entry) && self.range.admits_start(&entry.key) {
                            return Some(Ok(entry));
                        }
                        continue;
                    }
                    None => {
                        self.stack.pop();
                        continue;
                    }
                },
                Some(Frame::Internal(children)) => match children.next() {
                    Some(child) => child,
                    None => {
                        self.stack.pop();
                        continue;
                    }
                },
            };

            let result = match child {
                Child::OnDisk(address) => self.descend(address),
                Child::Resident(id) => Err(ChronoError::corruption(format!(
                    "decoded block refers to resident node {}",
                    id.0
                ))),
            };
            if let Err(e) = result {
                return self.fail(e);
            }
        }
    }
}
