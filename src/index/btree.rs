//! B+Tree Index
//!
//! Copy-on-write B+Tree over composite `(key, version)` keys. Nodes are
//! loaded from the index file on demand, modified in memory and written
//! back as fresh blocks on flush; blocks are never updated in place.
//!
//! ## Write path
//! ```text
//! prepare_insert ──► fault in root-to-leaf path (I/O, no lock held)
//! insert         ──► upsert into leaf, mark path dirty, split upward
//! flush          ──► rebalance ──► write dirty subtrees ──► sync ──► evict
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::IndexKind;
use crate::error::{ChronoError, Result};
use crate::io::{IoAddress, IoHandle};
use crate::storage::{BlockSearcher, BlockWriter, TreeRoot};

use super::node::{merge_into, shift_left, shift_right, Child, InternalNode, Node, NodeId};
use super::range::{KeyRange, ScanStart};
use super::types::{IndexEntry, Version, VersionedKey};
use super::{FlushOutcome, IndexBackend, TreeGeometry};

/// Counters and sizes exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub resident_nodes: usize,
    pub dirty_nodes: usize,
    pub height: u32,
    pub splits: u64,
    pub merges: u64,
    pub redistributions: u64,
    pub evictions: u64,
    pub fault_ins: u64,
}

/// Shape of the whole tree as found by [`BTreeIndex::verify`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeShape {
    pub height: u32,
    pub leaves: usize,
    pub internal_nodes: usize,
    pub entries: usize,
    /// Non-root nodes below `min_fill`
    pub underfull: usize,
    /// Nodes above `max_fill`
    pub overfull: usize,
}

struct Slot {
    node: Node,
    /// Block holding the last written image of this node
    disk: Option<IoAddress>,
    dirty: bool,
}

#[derive(Default)]
struct Counters {
    splits: u64,
    merges: u64,
    redistributions: u64,
    evictions: u64,
    fault_ins: u64,
}

/// Resident part of the tree
struct Arena {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    root: Child,
    height: u32,
    flushed_root: Option<TreeRoot>,
    dirty: usize,
    resident: usize,
    counters: Counters,
}

/// Parent link: `None` is the root pointer itself
type Link = Option<(NodeId, usize)>;

enum Violation {
    Overfull { path: Vec<(NodeId, usize)>, node: NodeId },
    Underfull { path: Vec<(NodeId, usize)>, node: NodeId },
}

/// B+Tree backend
///
/// ## Concurrency:
/// - `arena`: RwLock; readers hold it for one page of a scan, the writer
///   for one in-memory mutation. No lock is held across block I/O except
///   while a flush submits writes or `verify` walks the tree.
/// - Inserts and flushes must be serialized by the caller.
pub struct BTreeIndex {
    io: IoHandle,
    searcher: BlockSearcher,
    geometry: TreeGeometry,
    arena: RwLock<Arena>,
    next_block_offset: AtomicU64,
}

impl BTreeIndex {
    /// Attach to a persisted root, or start an empty tree when `root` is `None`
    pub fn open(
        io: IoHandle,
        searcher: BlockSearcher,
        geometry: TreeGeometry,
        root: Option<TreeRoot>,
        next_block_offset: u64,
    ) -> Self {
        let mut arena = Arena {
            slots: Vec::new(),
            free: Vec::new(),
            root: Child::Resident(NodeId(0)),
            height: 1,
            flushed_root: root,
            dirty: 0,
            resident: 0,
            counters: Counters::default(),
        };
        arena.root = match root {
            Some(root) => {
                arena.height = root.height;
                Child::OnDisk(root.address)
            }
            None => Child::Resident(arena.alloc(Node::empty_leaf(), None, false)),
        };

        tracing::debug!(
            root = ?root.map(|r| r.address.offset),
            height = arena.height,
            "B+Tree index opened"
        );
        Self {
            io,
            searcher,
            geometry,
            arena: RwLock::new(arena),
            next_block_offset: AtomicU64::new(next_block_offset),
        }
    }

    pub fn stats(&self) -> IndexStats {
        let arena = self.arena.read();
        IndexStats {
            resident_nodes: arena.resident,
            dirty_nodes: arena.dirty,
            height: arena.height,
            splits: arena.counters.splits,
            merges: arena.counters.merges,
            redistributions: arena.counters.redistributions,
            evictions: arena.counters.evictions,
            fault_ins: arena.counters.fault_ins,
        }
    }

    /// Walk every node, resident or not, checking ordering, separator
    /// bounds and uniform leaf depth. Occupancy problems are counted, not
    /// reported as errors.
    pub fn verify(&self) -> Result<TreeShape> {
        let arena = self.arena.read();
        let mut walk = VerifyWalk {
            arena: &arena,
            searcher: &self.searcher,
            geometry: &self.geometry,
            shape: TreeShape::default(),
            leaf_depth: None,
            last: None,
        };
        walk.child(arena.root, 1, None, None, true)?;
        walk.shape.height = walk.leaf_depth.unwrap_or(0);
        if walk.shape.height != arena.height {
            return Err(ChronoError::corruption(format!(
                "tree height is {} but {} levels were found",
                arena.height, walk.shape.height
            )));
        }
        Ok(walk.shape)
    }

    // -------------------------------------------------------------------------
    // Fault-in
    // -------------------------------------------------------------------------

    /// Make the child behind `link` resident and return its id
    fn load_child(&self, link: Link) -> Result<NodeId> {
        let address = {
            let arena = self.arena.read();
            match arena.child_of(link)? {
                Child::Resident(id) => return Ok(id),
                Child::OnDisk(address) => address,
            }
        };

        let node = self.searcher.fetch_node(address)?;

        let mut arena = self.arena.write();
        match arena.child_of(link)? {
            Child::Resident(id) => Ok(id),
            Child::OnDisk(current) if current == address => {
                let id = arena.alloc(node, Some(address), false);
                arena.set_child(link, Child::Resident(id))?;
                arena.counters.fault_ins += 1;
                tracing::trace!(block = %address, "node faulted in");
                Ok(id)
            }
            Child::OnDisk(other) => Err(ChronoError::corruption(format!(
                "child moved from {} to {} during fault-in",
                address, other
            ))),
        }
    }

    /// Make every node on the path toward `target` resident
    fn fault_in_path(&self, target: &VersionedKey) -> Result<()> {
        let mut link = None;
        loop {
            let id = self.load_child(link)?;
            let arena = self.arena.read();
            match &arena.slot(id)?.node {
                Node::Leaf(_) => return Ok(()),
                Node::Internal(inner) => link = Some((id, inner.child_index(target))),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Rebalancing
    // -------------------------------------------------------------------------

    /// Restore occupancy bounds on every resident node
    fn rebalance(&self) -> Result<()> {
        loop {
            let violation = self.arena.read().find_violation(&self.geometry)?;
            match violation {
                None => break,
                Some(Violation::Overfull { path, node }) => {
                    self.arena.write().split_once(node, path)?;
                }
                Some(Violation::Underfull { path, node }) => self.fix_underflow(path, node)?,
            }
        }
        self.collapse_root()
    }

    fn fix_underflow(&self, path: Vec<(NodeId, usize)>, node: NodeId) -> Result<()> {
        let (parent, idx) = *path
            .last()
            .ok_or_else(|| ChronoError::corruption("underfull root reported for rebalance"))?;

        let siblings = self.arena.read().internal(parent)?.children.len();
        if siblings == 1 {
            if path.len() == 1 {
                return self.collapse_root();
            }
            return Err(ChronoError::corruption(format!(
                "node {} has no sibling to rebalance with",
                node.0
            )));
        }

        let sibling_idx = if idx > 0 { idx - 1 } else { idx + 1 };
        let sibling = self.load_child(Some((parent, sibling_idx)))?;
        let (left_idx, left, right) = if sibling_idx < idx {
            (sibling_idx, sibling, node)
        } else {
            (idx, node, sibling)
        };

        let mut guard = self.arena.write();
        let arena = &mut *guard;
        let separator = arena.internal(parent)?.separators[left_idx].clone();
        let sibling_fill = arena.slot(sibling)?.node.occupancy();

        if sibling_fill > self.geometry.min_fill {
            let (l, r) = arena.pair_mut(left, right)?;
            let new_separator = if sibling == left {
                shift_right(&mut l.node, &mut r.node, separator)?
            } else {
                shift_left(&mut l.node, &mut r.node, separator)?
            };
            arena.internal_mut(parent)?.separators[left_idx] = new_separator;
            arena.mark_dirty(left)?;
            arena.mark_dirty(right)?;
            arena.counters.redistributions += 1;
        } else {
            let right_slot = arena.release(right)?;
            merge_into(&mut arena.slot_mut(left)?.node, right_slot.node, separator)?;
            let inner = arena.internal_mut(parent)?;
            inner.separators.remove(left_idx);
            inner.children.remove(left_idx + 1);
            arena.mark_dirty(left)?;
            arena.counters.merges += 1;
        }
        for (ancestor, _) in &path {
            arena.mark_dirty(*ancestor)?;
        }
        Ok(())
    }

    /// Replace an internal root that has a single child by that child
    fn collapse_root(&self) -> Result<()> {
        loop {
            let root = {
                let arena = self.arena.read();
                match arena.root {
                    Child::Resident(id) => match &arena.slot(id)?.node {
                        Node::Internal(inner) if inner.children.len() == 1 => id,
                        _ => return Ok(()),
                    },
                    Child::OnDisk(_) => return Ok(()),
                }
            };
            self.load_child(Some((root, 0)))?;

            let mut arena = self.arena.write();
            let old = arena.release(root)?;
            if let Node::Internal(inner) = old.node {
                arena.root = inner.children[0];
                arena.height -= 1;
                tracing::debug!(height = arena.height, "collapsed single-child root");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Eviction
    // -------------------------------------------------------------------------

    /// Drop clean nodes whose children are all on disk until the resident
    /// budget is met. The root always stays.
    fn evict(&self) -> Result<()> {
        let budget = self.geometry.max_resident_nodes;
        let mut arena = self.arena.write();
        while arena.resident > budget {
            let candidates = arena.eviction_candidates()?;
            if candidates.is_empty() {
                break;
            }
            for (parent, idx, child) in candidates {
                if arena.resident <= budget {
                    break;
                }
                let slot = arena.release(child)?;
                let address = slot
                    .disk
                    .ok_or_else(|| ChronoError::corruption("evicting a node that was never written"))?;
                arena.set_child(Some((parent, idx)), Child::OnDisk(address))?;
                arena.counters.evictions += 1;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn page(&self, range: &KeyRange, start: &ScanStart, limit: usize) -> Result<Vec<IndexEntry>> {
        let mut start = start.clone();
        loop {
            let mut collect = Collect {
                range,
                start: &start,
                limit,
                out: Vec::new(),
                deferred: None,
            };
            {
                let arena = self.arena.read();
                collect.child(&arena, arena.root, None)?;
            }
            let Collect { out, deferred, .. } = collect;

            let Some((address, upper)) = deferred else {
                return Ok(out);
            };
            let found = self
                .searcher
                .scan_from(address, range.clone(), start.clone())
                .take(limit)
                .collect::<Result<Vec<_>>>()?;
            if !found.is_empty() {
                return Ok(found);
            }
            // everything right of the subtree sorts at or after `upper`
            match upper {
                Some(upper) if !range.is_past_end(&upper.key) => start = ScanStart::At(upper),
                _ => return Ok(Vec::new()),
            }
        }
    }
}

impl IndexBackend for BTreeIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::BTree
    }

    fn prepare_insert(&self, target: &VersionedKey) -> Result<()> {
        self.fault_in_path(target)
    }

    fn insert(&self, entry: IndexEntry) -> Result<()> {
        let target = entry.versioned_key();
        self.fault_in_path(&target)?;

        let mut guard = self.arena.write();
        let arena = &mut *guard;

        let mut path = Vec::new();
        let mut current = arena.root_id()?;
        loop {
            let (idx, child) = match &arena.slot(current)?.node {
                Node::Leaf(_) => break,
                Node::Internal(inner) => {
                    let idx = inner.child_index(&target);
                    (idx, inner.children[idx])
                }
            };
            path.push((current, idx));
            current = match child {
                Child::Resident(id) => id,
                Child::OnDisk(address) => {
                    return Err(ChronoError::corruption(format!(
                        "insert path reached unloaded block {}",
                        address
                    )));
                }
            };
        }

        match &mut arena.slot_mut(current)?.node {
            Node::Leaf(leaf) => leaf.upsert(entry),
            Node::Internal(_) => return Err(ChronoError::corruption("insert descended to an internal node")),
        }
        arena.mark_dirty(current)?;
        for (ancestor, _) in &path {
            arena.mark_dirty(*ancestor)?;
        }

        let mut node = current;
        while arena.slot(node)?.node.occupancy() > self.geometry.max_fill {
            match arena.split_once(node, path.clone())? {
                Some(parent) => {
                    path.pop();
                    node = parent;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn lookup_as_of(&self, key: &[u8], as_of: Version) -> Result<Option<IndexEntry>> {
        let start = ScanStart::At(VersionedKey::new(key, as_of));
        Ok(self.page(&KeyRange::single(key), &start, 1)?.into_iter().next())
    }

    fn scan_page(&self, range: &KeyRange, start: &ScanStart, limit: usize) -> Result<Vec<IndexEntry>> {
        self.page(range, start, limit)
    }

    fn flush(&self) -> Result<FlushOutcome> {
        self.rebalance()?;

        let mut writer = BlockWriter::new(
            self.io.clone(),
            self.geometry.page_size,
            self.next_block_offset.load(Ordering::Acquire),
        );
        let mut written = HashMap::new();
        let root_address = {
            let arena = self.arena.read();
            match arena.root {
                Child::Resident(id) => arena.write_subtree(id, &mut writer, &mut written)?,
                Child::OnDisk(address) => address,
            }
        };

        let blocks_written = written.len();
        let next_block_offset = if blocks_written > 0 {
            writer.finish()?
        } else {
            writer.next_offset()
        };

        let root = {
            let mut arena = self.arena.write();
            for (id, address) in &written {
                arena.mark_written(*id, *address)?;
            }
            let root = TreeRoot {
                address: root_address,
                height: arena.height,
            };
            arena.flushed_root = Some(root);
            root
        };
        self.next_block_offset.store(next_block_offset, Ordering::Release);
        self.evict()?;

        tracing::debug!(
            blocks = blocks_written,
            root = %root.address,
            height = root.height,
            "B+Tree flushed"
        );
        Ok(FlushOutcome {
            root: Some(root),
            blocks_written,
            next_block_offset,
        })
    }

    fn root(&self) -> Option<TreeRoot> {
        self.arena.read().flushed_root
    }

    fn dirty_count(&self) -> usize {
        self.arena.read().dirty
    }

    fn next_block_offset(&self) -> u64 {
        self.next_block_offset.load(Ordering::Acquire)
    }
}

// =============================================================================
// Arena
// =============================================================================

impl Arena {
    fn alloc(&mut self, node: Node, disk: Option<IoAddress>, dirty: bool) -> NodeId {
        let slot = Slot { node, disk, dirty };
        self.resident += 1;
        if dirty {
            self.dirty += 1;
        }
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                NodeId(idx)
            }
            None => {
                self.slots.push(Some(slot));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Result<Slot> {
        let slot = self
            .slots
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| dangling(id))?;
        self.free.push(id.0);
        self.resident -= 1;
        if slot.dirty {
            self.dirty -= 1;
        }
        Ok(slot)
    }

    fn slot(&self, id: NodeId) -> Result<&Slot> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| dangling(id))
    }

    fn slot_mut(&mut self, id: NodeId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| dangling(id))
    }

    fn pair_mut(&mut self, a: NodeId, b: NodeId) -> Result<(&mut Slot, &mut Slot)> {
        if a.0 == b.0 || a.0 >= self.slots.len() || b.0 >= self.slots.len() {
            return Err(ChronoError::corruption(format!(
                "invalid sibling pair {} / {}",
                a.0, b.0
            )));
        }
        let (lo, hi) = (a.0.min(b.0), a.0.max(b.0));
        let (head, tail) = self.slots.split_at_mut(hi);
        let (lo_slot, hi_slot) = (
            head[lo].as_mut().ok_or_else(|| dangling(NodeId(lo)))?,
            tail[0].as_mut().ok_or_else(|| dangling(NodeId(hi)))?,
        );
        if a.0 < b.0 {
            Ok((lo_slot, hi_slot))
        } else {
            Ok((hi_slot, lo_slot))
        }
    }

    fn internal(&self, id: NodeId) -> Result<&InternalNode> {
        match &self.slot(id)?.node {
            Node::Internal(inner) => Ok(inner),
            Node::Leaf(_) => Err(ChronoError::corruption(format!("node {} is not internal", id.0))),
        }
    }

    fn internal_mut(&mut self, id: NodeId) -> Result<&mut InternalNode> {
        match &mut self.slot_mut(id)?.node {
            Node::Internal(inner) => Ok(inner),
            Node::Leaf(_) => Err(ChronoError::corruption(format!("node {} is not internal", id.0))),
        }
    }

    fn mark_dirty(&mut self, id: NodeId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if !slot.dirty {
            slot.dirty = true;
            self.dirty += 1;
        }
        Ok(())
    }

    fn mark_written(&mut self, id: NodeId, address: IoAddress) -> Result<()> {
        let slot = self.slot_mut(id)?;
        slot.disk = Some(address);
        if slot.dirty {
            slot.dirty = false;
            self.dirty -= 1;
        }
        Ok(())
    }

    fn root_id(&self) -> Result<NodeId> {
        match self.root {
            Child::Resident(id) => Ok(id),
            Child::OnDisk(address) => Err(ChronoError::corruption(format!(
                "root block {} is not loaded",
                address
            ))),
        }
    }

    fn child_of(&self, link: Link) -> Result<Child> {
        match link {
            None => Ok(self.root),
            Some((parent, idx)) => self
                .internal(parent)?
                .children
                .get(idx)
                .copied()
                .ok_or_else(|| ChronoError::corruption(format!("node {} has no child {}", parent.0, idx))),
        }
    }

    fn set_child(&mut self, link: Link, child: Child) -> Result<()> {
        match link {
            None => {
                self.root = child;
                Ok(())
            }
            Some((parent, idx)) => {
                let inner = self.internal_mut(parent)?;
                match inner.children.get_mut(idx) {
                    Some(slot) => {
                        *slot = child;
                        Ok(())
                    }
                    None => Err(ChronoError::corruption(format!("node {} has no child {}", parent.0, idx))),
                }
            }
        }
    }

    /// Split `node` once and hook the new sibling into its parent (the last
    /// element of `path`), growing a new root when there is none. Returns
    /// the parent that received the separator, `None` after a root split.
    fn split_once(&mut self, node: NodeId, mut path: Vec<(NodeId, usize)>) -> Result<Option<NodeId>> {
        let (separator, right) = self.slot_mut(node)?.node.split();
        let level = right.level();
        let right_id = self.alloc(right, None, true);
        self.mark_dirty(node)?;
        self.counters.splits += 1;

        match path.pop() {
            Some((parent, idx)) => {
                let inner = self.internal_mut(parent)?;
                inner.separators.insert(idx, separator);
                inner.children.insert(idx + 1, Child::Resident(right_id));
                self.mark_dirty(parent)?;
                Ok(Some(parent))
            }
            None => {
                let root = InternalNode {
                    level: level + 1,
                    separators: vec![separator],
                    children: vec![Child::Resident(node), Child::Resident(right_id)],
                };
                let root_id = self.alloc(Node::Internal(root), None, true);
                self.root = Child::Resident(root_id);
                self.height += 1;
                tracing::debug!(height = self.height, "root split");
                Ok(None)
            }
        }
    }

    /// First resident node outside its occupancy bounds, in pre-order
    fn find_violation(&self, geometry: &TreeGeometry) -> Result<Option<Violation>> {
        let Child::Resident(root) = self.root else {
            return Ok(None);
        };
        let mut stack = vec![(root, Vec::new())];
        while let Some((id, path)) = stack.pop() {
            let node = &self.slot(id)?.node;
            let fill = node.occupancy();
            if fill > geometry.max_fill {
                return Ok(Some(Violation::Overfull { path, node: id }));
            }
            if !path.is_empty() && fill < geometry.min_fill {
                return Ok(Some(Violation::Underfull { path, node: id }));
            }
            if let Node::Internal(inner) = node {
                for (idx, child) in inner.children.iter().enumerate().rev() {
                    if let Child::Resident(child_id) = child {
                        let mut child_path = path.clone();
                        child_path.push((id, idx));
                        stack.push((*child_id, child_path));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Post-order write of every node that changed since its last image.
    /// Returns the address the subtree root now lives at.
    fn write_subtree(
        &self,
        id: NodeId,
        writer: &mut BlockWriter,
        written: &mut HashMap<NodeId, IoAddress>,
    ) -> Result<IoAddress> {
        let slot = self.slot(id)?;
        let mut child_moved = false;
        if let Node::Internal(inner) = &slot.node {
            for child in &inner.children {
                if let Child::Resident(child_id) = child {
                    let before = self.slot(*child_id)?.disk;
                    let after = self.write_subtree(*child_id, writer, written)?;
                    child_moved |= before != Some(after);
                }
            }
        }

        if let (false, false, Some(address)) = (slot.dirty, child_moved, slot.disk) {
            return Ok(address);
        }

        let address = writer.write_node(&slot.node, |child| match child {
            Child::OnDisk(address) => Ok(*address),
            Child::Resident(child_id) => written
                .get(child_id)
                .copied()
                .or(self.slot(*child_id)?.disk)
                .ok_or_else(|| ChronoError::corruption(format!("child {} has no block", child_id.0))),
        })?;
        written.insert(id, address);
        Ok(address)
    }

    /// Clean, written, non-root nodes whose children are all on disk
    fn eviction_candidates(&self) -> Result<Vec<(NodeId, usize, NodeId)>> {
        let Child::Resident(root) = self.root else {
            return Ok(Vec::new());
        };
        let mut candidates = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Node::Internal(inner) = &self.slot(id)?.node else {
                continue;
            };
            for (idx, child) in inner.children.iter().enumerate() {
                let Child::Resident(child_id) = child else {
                    continue;
                };
                let slot = self.slot(*child_id)?;
                let children_on_disk = match &slot.node {
                    Node::Leaf(_) => true,
                    Node::Internal(c) => c.children.iter().all(|c| matches!(c, Child::OnDisk(_))),
                };
                if !slot.dirty && slot.disk.is_some() && children_on_disk {
                    candidates.push((id, idx, *child_id));
                } else {
                    stack.push(*child_id);
                }
            }
        }
        Ok(candidates)
    }
}

fn dangling(id: NodeId) -> ChronoError {
    ChronoError::corruption(format!("dangling node id {}", id.0))
}

// =============================================================================
// Resident Scan
// =============================================================================

enum Walk {
    Continue,
    Stop,
}

/// One page of a scan over the resident nodes.
///
/// The first on-disk subtree reached before anything was collected is
/// handed back as `deferred` together with the separator bounding it from
/// above, so the caller can read it without holding the arena lock.
struct Collect<'a> {
    range: &'a KeyRange,
    start: &'a ScanStart,
    limit: usize,
    out: Vec<IndexEntry>,
    deferred: Option<(IoAddress, Option<VersionedKey>)>,
}

impl Collect<'_> {
    fn child(&mut self, arena: &Arena, child: Child, upper: Option<&VersionedKey>) -> Result<Walk> {
        let id = match child {
            Child::Resident(id) => id,
            Child::OnDisk(address) => {
                if self.out.is_empty() {
                    self.deferred = Some((address, upper.cloned()));
                }
                return Ok(Walk::Stop);
            }
        };

        match &arena.slot(id)?.node {
            Node::Leaf(leaf) => {
                let first = self.start.first_index(&leaf.entries);
                for entry in &leaf.entries[first..] {
                    if self.range.is_past_end(&entry.key) {
                        return Ok(Walk::Stop);
                    }
                    if !self.range.admits_start(&entry.key) || !self.start.admits(entry) {
                        continue;
                    }
                    self.out.push(entry.clone());
                    if self.out.len() >= self.limit {
                        return Ok(Walk::Stop);
                    }
                }
                Ok(Walk::Continue)
            }
            Node::Internal(inner) => {
                let first = self.start.child_index(&inner.separators);
                for idx in first..inner.children.len() {
                    let child_upper = inner.separators.get(idx).or(upper);
                    if let Walk::Stop = self.child(arena, inner.children[idx], child_upper)? {
                        return Ok(Walk::Stop);
                    }
                }
                Ok(Walk::Continue)
            }
        }
    }
}

// =============================================================================
// Verification
// =============================================================================

struct VerifyWalk<'a> {
    arena: &'a Arena,
    searcher: &'a BlockSearcher,
    geometry: &'a TreeGeometry,
    shape: TreeShape,
    leaf_depth: Option<u32>,
    last: Option<VersionedKey>,
}

impl VerifyWalk<'_> {
    fn child(
        &mut self,
        child: Child,
        depth: u32,
        lower: Option<&VersionedKey>,
        upper: Option<&VersionedKey>,
        is_root: bool,
    ) -> Result<()> {
        match child {
            Child::Resident(id) => {
                let arena = self.arena;
                self.node(&arena.slot(id)?.node, depth, lower, upper, is_root)
            }
            Child::OnDisk(address) => {
                let node = self.searcher.fetch_node(address)?;
                self.node(&node, depth, lower, upper, is_root)
            }
        }
    }

    fn node(
        &mut self,
        node: &Node,
        depth: u32,
        lower: Option<&VersionedKey>,
        upper: Option<&VersionedKey>,
        is_root: bool,
    ) -> Result<()> {
        let fill = node.occupancy();
        if fill > self.geometry.max_fill {
            self.shape.overfull += 1;
        }
        if !is_root && fill < self.geometry.min_fill {
            self.shape.underfull += 1;
        }

        match node {
            Node::Leaf(leaf) => {
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(ChronoError::corruption(format!(
                            "leaf at depth {} but others at depth {}",
                            depth, expected
                        )));
                    }
                    Some(_) => {}
                }
                for entry in &leaf.entries {
                    let key = entry.versioned_key();
                    if lower.map_or(false, |l| key < *l) || upper.map_or(false, |u| key >= *u) {
                        return Err(ChronoError::corruption(format!(
                            "entry {:?}@{} outside its separator bounds",
                            entry.key, entry.version
                        )));
                    }
                    if self.last.as_ref().map_or(false, |last| key <= *last) {
                        return Err(ChronoError::corruption(format!(
                            "entry {:?}@{} out of order",
                            entry.key, entry.version
                        )));
                    }
                    self.last = Some(key);
                }
                self.shape.leaves += 1;
                self.shape.entries += leaf.entries.len();
            }
            Node::Internal(inner) => {
                if inner.children.len() != inner.separators.len() + 1 {
                    return Err(ChronoError::corruption("internal node child/separator mismatch"));
                }
                if inner.separators.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(ChronoError::corruption("internal separators out of order"));
                }
                self.shape.internal_nodes += 1;
                for (idx, child) in inner.children.iter().enumerate() {
                    let child_lower = if idx == 0 { lower } else { inner.separators.get(idx - 1) };
                    let child_upper = inner.separators.get(idx).or(upper);
                    self.child(*child, depth + 1, child_lower, child_upper, false)?;
                }
            }
        }
        Ok(())
    }
}
