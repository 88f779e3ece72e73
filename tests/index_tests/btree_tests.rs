//! Tests for the B+Tree index backend
//!
//! These tests verify:
//! - Inserts, latest and as-of lookups on a resident tree
//! - Leaf overflow splits once and keeps both halves within bounds
//! - Flush writes copy-on-write images; old roots stay readable
//! - Reopen from a flushed root, lazy fault-in and eviction
//! - Lookups of missing keys read only the blocks of one subtree
//! - Rebalancing (split, borrow, merge) when bounds tighten on reopen
//! - Structural verification

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chronokv::index::{
    BTreeIndex, IndexBackend, IndexEntry, KeyRange, ScanStart, TreeGeometry, TreeRoot, ValueRef,
    VersionedKey,
};
use chronokv::io::{FileId, IoActor, IoAddress};
use chronokv::storage::{ActorBlockSource, Block, BlockSearcher, BlockSource};
use tempfile::TempDir;

const PAGE: usize = 4096;

// =============================================================================
// Helper Functions
// =============================================================================

fn geometry(min_fill: usize, max_fill: usize) -> TreeGeometry {
    TreeGeometry {
        page_size: PAGE,
        min_fill,
        max_fill,
        max_resident_nodes: 1024,
    }
}

fn spawn_actor(dir: &Path) -> IoActor {
    IoActor::spawn(&dir.join("index.db"), FileId::INDEX).unwrap()
}

fn open_tree(actor: &IoActor, geometry: TreeGeometry, root: Option<TreeRoot>, next: u64) -> BTreeIndex {
    let io = actor.handle();
    let searcher = BlockSearcher::over_actor(io.clone(), PAGE);
    BTreeIndex::open(io, searcher, geometry, root, next)
}

fn new_tree(actor: &IoActor, geometry: TreeGeometry) -> BTreeIndex {
    open_tree(actor, geometry, None, 2 * PAGE as u64)
}

fn key(k: u32) -> Vec<u8> {
    format!("k{:04}", k).into_bytes()
}

fn entry(k: u32, version: u64) -> IndexEntry {
    IndexEntry {
        key: key(k),
        version,
        timestamp: 1000 + version,
        value: ValueRef::Inline(format!("{}@{}", k, version).into_bytes()),
    }
}

/// Drain every page of a full scan
fn scan_all(tree: &BTreeIndex) -> Vec<IndexEntry> {
    let range = KeyRange::all();
    let mut start = ScanStart::Unbounded;
    let mut all = Vec::new();
    loop {
        let page = tree.scan_page(&range, &start, 8).unwrap();
        let Some(last) = page.last() else {
            return all;
        };
        start = ScanStart::after(&last.key, last.version);
        all.extend(page);
    }
}

/// Counts block fetches made by a tree
struct CountingSource {
    inner: ActorBlockSource,
    fetches: AtomicUsize,
}

impl CountingSource {
    fn take(&self) -> usize {
        self.fetches.swap(0, Ordering::SeqCst)
    }
}

impl BlockSource for CountingSource {
    fn fetch_block(&self, address: IoAddress) -> chronokv::Result<Block> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_block(address)
    }
}

fn open_counted(
    actor: &IoActor,
    geometry: TreeGeometry,
    root: Option<TreeRoot>,
    next: u64,
) -> (BTreeIndex, Arc<CountingSource>) {
    let io = actor.handle();
    let source = Arc::new(CountingSource {
        inner: ActorBlockSource::new(io.clone(), PAGE),
        fetches: AtomicUsize::new(0),
    });
    let tree = BTreeIndex::open(io, BlockSearcher::new(source.clone()), geometry, root, next);
    (tree, source)
}

/// Deterministic shuffle of 0..n
fn shuffled(n: u32) -> Vec<u32> {
    let mut keys: Vec<u32> = (0..n).collect();
    let mut seed = 0x2545_F491_u64;
    for i in (1..keys.len()).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        keys.swap(i, (seed % (i as u64 + 1)) as usize);
    }
    keys
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_empty_tree() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));

    assert!(tree.lookup_as_of(b"missing", u64::MAX).unwrap().is_none());
    assert!(scan_all(&tree).is_empty());
    assert!(tree.root().is_none());
    assert_eq!(tree.dirty_count(), 0);

    let shape = tree.verify().unwrap();
    assert_eq!(shape.height, 1);
    assert_eq!(shape.leaves, 1);
    assert_eq!(shape.entries, 0);
}

#[test]
fn test_insert_and_lookup_versions() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));

    for v in 1..=5 {
        tree.insert(entry(1, v)).unwrap();
        tree.insert(entry(2, v)).unwrap();
    }

    assert_eq!(tree.lookup_as_of(&key(1), u64::MAX).unwrap(), Some(entry(1, 5)));
    assert_eq!(tree.lookup_as_of(&key(1), 3).unwrap(), Some(entry(1, 3)));
    assert_eq!(tree.lookup_as_of(&key(2), 1).unwrap(), Some(entry(2, 1)));
    assert_eq!(tree.lookup_as_of(&key(2), 0).unwrap(), None);
    assert_eq!(tree.lookup_as_of(&key(3), u64::MAX).unwrap(), None);
}

#[test]
fn test_same_version_replaces_entry() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));

    tree.insert(entry(1, 1)).unwrap();
    let mut replacement = entry(1, 1);
    replacement.value = ValueRef::Tombstone;
    tree.insert(replacement.clone()).unwrap();

    assert_eq!(scan_all(&tree), vec![replacement]);
}

#[test]
fn test_scan_order_after_random_inserts() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));

    for k in shuffled(200) {
        tree.insert(entry(k, 1)).unwrap();
        tree.insert(entry(k, 2)).unwrap();
    }

    let scanned = scan_all(&tree);
    let expected: Vec<IndexEntry> = (0..200).flat_map(|k| vec![entry(k, 2), entry(k, 1)]).collect();
    assert_eq!(scanned, expected);

    let shape = tree.verify().unwrap();
    assert_eq!(shape.entries, 400);
    assert_eq!(shape.overfull, 0);
    assert!(shape.height >= 3);
}

#[test]
fn test_bounded_scan_page() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));
    for k in 0..50 {
        tree.insert(entry(k, 1)).unwrap();
    }

    let range = KeyRange::between(&key(10), &key(14));
    let page = tree.scan_page(&range, &range.start_position(), 100).unwrap();

    assert_eq!(page, (10..14).map(|k| entry(k, 1)).collect::<Vec<_>>());
}

// =============================================================================
// Split Tests
// =============================================================================

#[test]
fn test_leaf_overflow_splits_once() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));

    for k in 0..4 {
        tree.insert(entry(k, 1)).unwrap();
    }
    assert_eq!(tree.stats().splits, 0);
    assert_eq!(tree.stats().height, 1);

    tree.insert(entry(4, 1)).unwrap();

    let stats = tree.stats();
    assert_eq!(stats.splits, 1);
    assert_eq!(stats.height, 2);

    let shape = tree.verify().unwrap();
    assert_eq!(shape.internal_nodes, 1);
    assert_eq!(shape.leaves, 2);
    assert_eq!(shape.entries, 5);
    assert_eq!(shape.underfull, 0);
    assert_eq!(shape.overfull, 0);

    // the promoted separator is the first key of the right leaf
    let outcome = tree.flush().unwrap();
    let searcher = BlockSearcher::over_actor(actor.handle(), PAGE);
    match searcher.fetch_node(outcome.root.unwrap().address).unwrap() {
        chronokv::index::Node::Internal(root) => {
            assert_eq!(root.separators, vec![VersionedKey::new(key(2), 1)]);
        }
        chronokv::index::Node::Leaf(_) => panic!("root should be internal after a split"),
    }
}

// =============================================================================
// Flush Tests
// =============================================================================

#[test]
fn test_flush_writes_blocks_and_clears_dirty() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));
    for k in 0..20 {
        tree.insert(entry(k, 1)).unwrap();
    }
    assert!(tree.dirty_count() > 0);

    let outcome = tree.flush().unwrap();

    assert_eq!(tree.dirty_count(), 0);
    assert!(outcome.blocks_written > 1);
    assert_eq!(tree.root(), outcome.root);
    assert_eq!(
        outcome.next_block_offset,
        2 * PAGE as u64 + (outcome.blocks_written * PAGE) as u64
    );
    assert_eq!(tree.next_block_offset(), outcome.next_block_offset);
}

#[test]
fn test_clean_flush_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));
    for k in 0..20 {
        tree.insert(entry(k, 1)).unwrap();
    }
    let first = tree.flush().unwrap();

    let second = tree.flush().unwrap();

    assert_eq!(second.blocks_written, 0);
    assert_eq!(second.root, first.root);
    assert_eq!(second.next_block_offset, first.next_block_offset);
}

#[test]
fn test_flush_only_rewrites_changed_path() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));
    for k in 0..100 {
        tree.insert(entry(k, 1)).unwrap();
    }
    tree.flush().unwrap();
    let height = tree.stats().height as usize;

    tree.insert(entry(50, 2)).unwrap();
    let outcome = tree.flush().unwrap();

    // sequential inserts leave half-full leaves, so no split: one leaf
    // plus its ancestors
    assert_eq!(outcome.blocks_written, height);
}

#[test]
fn test_old_root_stays_readable() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let tree = new_tree(&actor, geometry(2, 4));
    for k in 0..30 {
        tree.insert(entry(k, 1)).unwrap();
    }
    let old_root = tree.flush().unwrap().root.unwrap();

    for k in 0..30 {
        tree.insert(entry(k, 2)).unwrap();
    }
    let new_root = tree.flush().unwrap().root.unwrap();

    assert_ne!(old_root.address, new_root.address);
    let searcher = BlockSearcher::over_actor(actor.handle(), PAGE);
    assert_eq!(searcher.lookup(old_root.address, &key(7)).unwrap(), Some(entry(7, 1)));
    assert_eq!(searcher.lookup(new_root.address, &key(7)).unwrap(), Some(entry(7, 2)));
}

// =============================================================================
// Reopen, Fault-in and Eviction Tests
// =============================================================================

#[test]
fn test_reopen_from_flushed_root() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let (root, next) = {
        let tree = new_tree(&actor, geometry(2, 4));
        for k in shuffled(120) {
            tree.insert(entry(k, 1)).unwrap();
        }
        let outcome = tree.flush().unwrap();
        (outcome.root, outcome.next_block_offset)
    };

    let tree = open_tree(&actor, geometry(2, 4), root, next);

    assert_eq!(tree.stats().resident_nodes, 0);
    assert_eq!(tree.lookup_as_of(&key(77), u64::MAX).unwrap(), Some(entry(77, 1)));
    assert_eq!(scan_all(&tree).len(), 120);
    // reads go around the arena
    assert_eq!(tree.stats().fault_ins, 0);
    assert_eq!(tree.verify().unwrap().entries, 120);
}

#[test]
fn test_prepare_insert_faults_in_one_path() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let (root, next) = {
        let tree = new_tree(&actor, geometry(2, 4));
        for k in 0..120 {
            tree.insert(entry(k, 1)).unwrap();
        }
        let outcome = tree.flush().unwrap();
        (outcome.root, outcome.next_block_offset)
    };
    let tree = open_tree(&actor, geometry(2, 4), root, next);
    let height = root.unwrap().height as u64;

    tree.prepare_insert(&VersionedKey::new(key(60), 2)).unwrap();

    let stats = tree.stats();
    assert_eq!(stats.fault_ins, height);
    assert_eq!(stats.resident_nodes as u64, height);
    assert_eq!(stats.dirty_nodes, 0);

    tree.insert(entry(60, 2)).unwrap();
    assert_eq!(tree.stats().fault_ins, height);
    assert_eq!(tree.lookup_as_of(&key(60), u64::MAX).unwrap(), Some(entry(60, 2)));
    assert_eq!(tree.lookup_as_of(&key(61), u64::MAX).unwrap(), Some(entry(61, 1)));
}

#[test]
fn test_missing_key_lookup_stays_in_one_subtree() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let (root, next) = {
        let tree = new_tree(&actor, geometry(2, 4));
        for k in 0..2000 {
            tree.insert(entry(k, 1)).unwrap();
        }
        let outcome = tree.flush().unwrap();
        (outcome.root, outcome.next_block_offset)
    };
    let height = root.unwrap().height as usize;
    assert!(height >= 5);

    let (tree, source) = open_counted(&actor, geometry(2, 4), root, next);
    // leftmost path resident, every sibling on disk
    tree.prepare_insert(&VersionedKey::new(key(0), 2)).unwrap();
    source.take();

    assert_eq!(tree.lookup_as_of(&key(10), u64::MAX).unwrap(), Some(entry(10, 1)));
    let hit = source.take();
    assert!(hit < height);

    // sorts between k0010 and k0011
    assert!(tree.lookup_as_of(b"k0010x", u64::MAX).unwrap().is_none());
    let miss = source.take();
    assert!(miss <= hit + 1, "miss read {} blocks, hit read {}", miss, hit);

    // past the last key entirely
    assert!(tree.lookup_as_of(b"k9999", u64::MAX).unwrap().is_none());
    assert!(source.take() <= height);
    assert_eq!(tree.stats().fault_ins as usize, height);
}

#[test]
fn test_flush_evicts_to_budget() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let mut small = geometry(2, 4);
    small.max_resident_nodes = 1;
    let tree = new_tree(&actor, small);
    for k in 0..100 {
        tree.insert(entry(k, 1)).unwrap();
    }
    let resident_before = tree.stats().resident_nodes;

    tree.flush().unwrap();

    let stats = tree.stats();
    assert_eq!(stats.resident_nodes, 1);
    assert_eq!(stats.evictions as usize, resident_before - 1);
    assert_eq!(scan_all(&tree).len(), 100);

    // writes after eviction fault the path back in
    tree.insert(entry(99, 2)).unwrap();
    assert!(tree.stats().fault_ins > 0);
    assert_eq!(tree.lookup_as_of(&key(99), u64::MAX).unwrap(), Some(entry(99, 2)));
    tree.flush().unwrap();
    assert_eq!(tree.verify().unwrap().entries, 101);
}

// =============================================================================
// Rebalance Tests
// =============================================================================

/// Flush `keys` single-version entries with `initial` bounds, then reopen
/// the image with `reopened` bounds
fn reopen_with(
    actor: &IoActor,
    initial: TreeGeometry,
    keys: std::ops::Range<u32>,
    reopened: TreeGeometry,
) -> BTreeIndex {
    let tree = new_tree(actor, initial);
    for k in keys {
        tree.insert(entry(k, 1)).unwrap();
    }
    let outcome = tree.flush().unwrap();
    open_tree(actor, reopened, outcome.root, outcome.next_block_offset)
}

#[test]
fn test_overfull_node_split_on_flush() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    // one leaf of 8 entries, reopened with room for only 4
    let tree = reopen_with(&actor, geometry(2, 8), 0..8, geometry(2, 4));

    tree.insert(entry(8, 1)).unwrap();
    tree.flush().unwrap();

    let shape = tree.verify().unwrap();
    assert_eq!(shape.overfull, 0);
    assert_eq!(shape.underfull, 0);
    assert_eq!(shape.entries, 9);
    assert_eq!(shape.leaves, 3);
    assert_eq!(tree.stats().splits, 2);
}

#[test]
fn test_underfull_leaf_merges_and_root_collapses() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    // leaves [k0, k1] and [k2, k3, k4]
    let tree = reopen_with(&actor, geometry(2, 4), 0..5, geometry(4, 8));

    tree.insert(entry(0, 2)).unwrap();
    tree.flush().unwrap();

    let stats = tree.stats();
    assert_eq!(stats.merges, 1);
    assert_eq!(stats.height, 1);
    let shape = tree.verify().unwrap();
    assert_eq!(shape.leaves, 1);
    assert_eq!(shape.internal_nodes, 0);
    assert_eq!(shape.entries, 6);
}

#[test]
fn test_underfull_leaf_borrows_from_sibling() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    // leaves [k0..k3] and [k4..k11]
    let tree = reopen_with(&actor, geometry(1, 8), 0..12, geometry(6, 12));

    tree.insert(entry(0, 2)).unwrap();
    tree.flush().unwrap();

    let stats = tree.stats();
    assert_eq!(stats.redistributions, 1);
    assert_eq!(stats.merges, 0);
    let shape = tree.verify().unwrap();
    assert_eq!(shape.leaves, 2);
    assert_eq!(shape.underfull, 0);
    assert_eq!(shape.entries, 13);
    assert_eq!(scan_all(&tree).len(), 13);
}
