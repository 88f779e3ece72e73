//! Tree Builder
//!
//! Bulk-loads a complete tree image from entries supplied in composite
//! order, bottom-up, the way an SSTable is written from a sorted run.

use crate::error::{ChronoError, Result};
use crate::index::{Child, IndexEntry, InternalNode, LeafNode, Node, VersionedKey};
use crate::io::{FileId, IoAddress, IoHandle, IoOp, Ticket};

use super::block::Block;
use super::TreeRoot;

/// Pipelines block writes through the index actor.
///
/// Blocks are assigned consecutive page-aligned offsets and submitted
/// without waiting; [`finish`](Self::finish) collects every ticket and
/// issues one sync.
pub struct BlockWriter {
    io: IoHandle,
    page_size: usize,
    next_offset: u64,
    tickets: Vec<Ticket>,
}

impl BlockWriter {
    pub fn new(io: IoHandle, page_size: usize, next_offset: u64) -> Self {
        Self {
            io,
            page_size,
            next_offset,
            tickets: Vec::new(),
        }
    }

    /// Encode `node` and queue its block
    pub fn write_node<F>(&mut self, node: &Node, resolve: F) -> Result<IoAddress>
    where
        F: FnMut(&Child) -> Result<IoAddress>,
    {
        let block = Block::encode(node, self.page_size, resolve)?;
        self.write_block(block)
    }

    pub fn write_block(&mut self, block: Block) -> Result<IoAddress> {
        let offset = self.next_offset;
        let data = block.into_bytes();
        let address = IoAddress::new(FileId::INDEX, offset, data.len() as u32);
        self.tickets.push(self.io.submit(IoOp::Write { offset, data })?);
        self.next_offset += self.page_size as u64;
        Ok(address)
    }

    /// Offset the next block would be written at
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn pending(&self) -> usize {
        self.tickets.len()
    }

    /// Wait for every queued write, then sync. Returns the next free offset.
    pub fn finish(self) -> Result<u64> {
        let mut first_error = None;
        for ticket in self.tickets {
            if let Err(e) = ticket.wait() {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        self.io.sync()?;
        Ok(self.next_offset)
    }
}

/// Result of a bulk build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltTree {
    pub root: TreeRoot,
    pub entries: u64,
    pub blocks_written: usize,
    pub next_block_offset: u64,
}

/// Streaming bottom-up tree construction.
///
/// Leaves are emitted with `max_fill` entries while at least `min_fill`
/// more are held back, so the last leaf never underflows. Internal levels
/// are grouped evenly once all leaves are known.
pub struct TreeBuilder {
    writer: BlockWriter,
    max_fill: usize,
    min_fill: usize,
    pending: Vec<IndexEntry>,
    last: Option<VersionedKey>,
    /// (first key, address) of every emitted leaf
    leaves: Vec<(VersionedKey, IoAddress)>,
    entries: u64,
    blocks: usize,
}

impl TreeBuilder {
    pub fn new(writer: BlockWriter, min_fill: usize, max_fill: usize) -> Self {
        Self {
            writer,
            max_fill,
            min_fill,
            pending: Vec::with_capacity(max_fill + min_fill),
            last: None,
            leaves: Vec::new(),
            entries: 0,
            blocks: 0,
        }
    }

    /// Add the next entry; must sort strictly after the previous one
    pub fn add(&mut self, entry: IndexEntry) -> Result<()> {
        if let Some(last) = &self.last {
            if !entry.cmp_target(last).is_gt() {
                return Err(ChronoError::corruption(format!(
                    "bulk build input out of order at key {:?} version {}",
                    entry.key, entry.version
                )));
            }
        }
        self.last = Some(entry.versioned_key());
        self.pending.push(entry);
        self.entries += 1;

        if self.pending.len() >= self.max_fill + self.min_fill {
            let rest = self.pending.split_off(self.max_fill);
            let full = std::mem::replace(&mut self.pending, rest);
            self.emit_leaf(full)?;
        }
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Write the remaining leaves and every internal level
    pub fn finish(mut self) -> Result<BuiltTree> {
        let remaining = std::mem::take(&mut self.pending);
        if remaining.len() > self.max_fill {
            let mut left = remaining;
            let right = left.split_off(left.len() / 2);
            self.emit_leaf(left)?;
            self.emit_leaf(right)?;
        } else if !remaining.is_empty() || self.leaves.is_empty() {
            self.emit_leaf(remaining)?;
        }

        let mut level_nodes = std::mem::take(&mut self.leaves);
        let mut level: u16 = 0;
        while level_nodes.len() > 1 {
            level += 1;
            level_nodes = self.build_level(level_nodes, level)?;
        }

        let (_, root) = level_nodes
            .pop()
            .ok_or_else(|| ChronoError::corruption("bulk build produced no root"))?;
        let blocks_written = self.blocks;
        let next_block_offset = self.writer.finish()?;

        Ok(BuiltTree {
            root: TreeRoot {
                address: root,
                height: level as u32 + 1,
            },
            entries: self.entries,
            blocks_written,
            next_block_offset,
        })
    }

    fn emit_leaf(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        let first = entries
            .first()
            .map(IndexEntry::versioned_key)
            .unwrap_or_else(|| VersionedKey::latest(&[]));
        let node = Node::Leaf(LeafNode { entries });
        let address = self.writer.write_node(&node, on_disk)?;
        self.blocks += 1;
        self.leaves.push((first, address));
        Ok(())
    }

    fn build_level(
        &mut self,
        nodes: Vec<(VersionedKey, IoAddress)>,
        level: u16,
    ) -> Result<Vec<(VersionedKey, IoAddress)>> {
        let groups = (nodes.len() + self.max_fill - 1) / self.max_fill;
        let base = nodes.len() / groups;
        let extra = nodes.len() % groups;

        let mut parents = Vec::with_capacity(groups);
        let mut iter = nodes.into_iter();
        for g in 0..groups {
            let size = base + usize::from(g < extra);
            let group: Vec<_> = iter.by_ref().take(size).collect();
            let first = group[0].0.clone();
            let separators = group[1..].iter().map(|(key, _)| key.clone()).collect();
            let children = group.iter().map(|(_, addr)| Child::OnDisk(*addr)).collect();
            let node = Node::Internal(InternalNode {
                level,
                separators,
                children,
            });
            let address = self.writer.write_node(&node, on_disk)?;
            self.blocks += 1;
            parents.push((first, address));
        }
        Ok(parents)
    }
}

fn on_disk(child: &Child) -> Result<IoAddress> {
    match child {
        Child::OnDisk(address) => Ok(*address),
        Child::Resident(id) => Err(ChronoError::corruption(format!(
            "bulk-built node refers to resident node {}",
            id.0
        ))),
    }
}
