//! Tests for the hash index backend
//!
//! These tests verify:
//! - Buffered version chains answer latest and as-of lookups
//! - Flush bulk-builds a tree image and clears the buffer
//! - Reads merge buffered and flushed entries in composite order
//! - A buffered entry shadows a flushed one with the same version
//! - Reopen from a flushed root

use std::path::Path;

use chronokv::config::IndexKind;
use chronokv::index::{
    HashIndex, IndexBackend, IndexEntry, KeyRange, ScanStart, TreeGeometry, TreeRoot, ValueRef,
};
use chronokv::io::{FileId, IoActor};
use chronokv::storage::BlockSearcher;
use tempfile::TempDir;

const PAGE: usize = 4096;

// =============================================================================
// Helper Functions
// =============================================================================

fn geometry() -> TreeGeometry {
    TreeGeometry {
        page_size: PAGE,
        min_fill: 2,
        max_fill: 4,
        max_resident_nodes: 1024,
    }
}

fn spawn_actor(dir: &Path) -> IoActor {
    IoActor::spawn(&dir.join("index.db"), FileId::INDEX).unwrap()
}

fn open_index(actor: &IoActor, root: Option<TreeRoot>, next: u64) -> HashIndex {
    let io = actor.handle();
    let searcher = BlockSearcher::over_actor(io.clone(), PAGE);
    HashIndex::open(io, searcher, geometry(), root, next)
}

fn new_index(actor: &IoActor) -> HashIndex {
    open_index(actor, None, 2 * PAGE as u64)
}

fn key(k: u32) -> Vec<u8> {
    format!("h{:04}", k).into_bytes()
}

fn entry(k: u32, version: u64) -> IndexEntry {
    IndexEntry {
        key: key(k),
        version,
        timestamp: version,
        value: ValueRef::Inline(format!("{}@{}", k, version).into_bytes()),
    }
}

fn scan_all(index: &HashIndex) -> Vec<IndexEntry> {
    let range = KeyRange::all();
    let mut start = ScanStart::Unbounded;
    let mut all = Vec::new();
    loop {
        let page = index.scan_page(&range, &start, 5).unwrap();
        let Some(last) = page.last() else {
            return all;
        };
        start = ScanStart::after(&last.key, last.version);
        all.extend(page);
    }
}

// =============================================================================
// Buffered Tests
// =============================================================================

#[test]
fn test_kind() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());

    assert_eq!(new_index(&actor).kind(), IndexKind::Hash);
}

#[test]
fn test_buffered_lookups() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);

    // out of version order on purpose
    for v in [2, 5, 1, 4, 3] {
        index.insert(entry(1, v)).unwrap();
    }
    index.insert(entry(2, 1)).unwrap();

    assert_eq!(index.buffered_keys(), 2);
    assert_eq!(index.dirty_count(), 6);
    assert_eq!(index.lookup_as_of(&key(1), u64::MAX).unwrap(), Some(entry(1, 5)));
    assert_eq!(index.lookup_as_of(&key(1), 3).unwrap(), Some(entry(1, 3)));
    assert_eq!(index.lookup_as_of(&key(1), 0).unwrap(), None);
    assert_eq!(index.lookup_as_of(&key(3), u64::MAX).unwrap(), None);
}

#[test]
fn test_same_version_does_not_grow_buffer() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);

    index.insert(entry(1, 1)).unwrap();
    let mut replacement = entry(1, 1);
    replacement.value = ValueRef::Tombstone;
    index.insert(replacement.clone()).unwrap();

    assert_eq!(index.dirty_count(), 1);
    assert_eq!(index.lookup_as_of(&key(1), 1).unwrap(), Some(replacement));
}

#[test]
fn test_buffered_scan_is_sorted() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);
    for k in [9, 3, 7, 1, 5] {
        index.insert(entry(k, 1)).unwrap();
        index.insert(entry(k, 2)).unwrap();
    }

    let scanned = scan_all(&index);

    let expected: Vec<IndexEntry> = [1, 3, 5, 7, 9]
        .iter()
        .flat_map(|&k| vec![entry(k, 2), entry(k, 1)])
        .collect();
    assert_eq!(scanned, expected);
}

// =============================================================================
// Flush Tests
// =============================================================================

#[test]
fn test_flush_builds_image() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);
    for k in 0..40 {
        index.insert(entry(k, 1)).unwrap();
    }

    let outcome = index.flush().unwrap();

    assert_eq!(index.dirty_count(), 0);
    assert_eq!(index.buffered_keys(), 0);
    assert!(outcome.blocks_written > 1);
    assert_eq!(index.root(), outcome.root);
    assert_eq!(index.next_block_offset(), outcome.next_block_offset);
    assert_eq!(index.lookup_as_of(&key(17), u64::MAX).unwrap(), Some(entry(17, 1)));
    assert_eq!(scan_all(&index).len(), 40);
}

#[test]
fn test_flush_of_empty_index_writes_empty_leaf() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);

    let outcome = index.flush().unwrap();

    assert_eq!(outcome.blocks_written, 1);
    assert_eq!(outcome.root.unwrap().height, 1);
    assert!(scan_all(&index).is_empty());
}

#[test]
fn test_clean_flush_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);
    index.insert(entry(1, 1)).unwrap();
    let first = index.flush().unwrap();

    let second = index.flush().unwrap();

    assert_eq!(second.blocks_written, 0);
    assert_eq!(second.root, first.root);
}

#[test]
fn test_second_flush_merges_with_image() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);
    for k in (0..20).step_by(2) {
        index.insert(entry(k, 1)).unwrap();
    }
    let old_root = index.flush().unwrap().root.unwrap();

    for k in (1..20).step_by(2) {
        index.insert(entry(k, 1)).unwrap();
    }
    index.insert(entry(4, 2)).unwrap();
    let new_root = index.flush().unwrap().root.unwrap();

    let all = scan_all(&index);
    assert_eq!(all.len(), 21);
    assert!(all.windows(2).all(|w| w[0].versioned_key() < w[1].versioned_key()));
    assert_eq!(index.lookup_as_of(&key(4), u64::MAX).unwrap(), Some(entry(4, 2)));
    assert_eq!(index.lookup_as_of(&key(4), 1).unwrap(), Some(entry(4, 1)));

    // the previous image is untouched
    let searcher = BlockSearcher::over_actor(actor.handle(), PAGE);
    assert_eq!(searcher.scan(old_root.address, KeyRange::all()).count(), 10);
    assert_ne!(old_root.address, new_root.address);
}

// =============================================================================
// Merge Tests
// =============================================================================

#[test]
fn test_as_of_falls_through_to_image() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);
    index.insert(entry(1, 1)).unwrap();
    index.insert(entry(1, 2)).unwrap();
    index.flush().unwrap();

    index.insert(entry(1, 3)).unwrap();

    assert_eq!(index.lookup_as_of(&key(1), u64::MAX).unwrap(), Some(entry(1, 3)));
    assert_eq!(index.lookup_as_of(&key(1), 2).unwrap(), Some(entry(1, 2)));
    assert_eq!(index.lookup_as_of(&key(1), 1).unwrap(), Some(entry(1, 1)));
}

#[test]
fn test_buffered_entry_shadows_image() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);
    index.insert(entry(1, 1)).unwrap();
    index.insert(entry(2, 1)).unwrap();
    index.flush().unwrap();

    let mut replay = entry(1, 1);
    replay.value = ValueRef::Inline(b"replayed".to_vec());
    index.insert(replay.clone()).unwrap();

    assert_eq!(scan_all(&index), vec![replay.clone(), entry(2, 1)]);
    assert_eq!(index.lookup_as_of(&key(1), 1).unwrap(), Some(replay));
}

#[test]
fn test_scan_interleaves_memory_and_image() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);
    for k in (0..30).filter(|k| k % 3 == 0) {
        index.insert(entry(k, 1)).unwrap();
    }
    index.flush().unwrap();
    for k in (0..30).filter(|k| k % 3 != 0) {
        index.insert(entry(k, 1)).unwrap();
    }

    let keys: Vec<Vec<u8>> = scan_all(&index).into_iter().map(|e| e.key).collect();

    assert_eq!(keys, (0..30).map(key).collect::<Vec<_>>());
}

#[test]
fn test_bounded_scan_across_sources() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let index = new_index(&actor);
    for k in 0..10 {
        index.insert(entry(k, 1)).unwrap();
    }
    index.flush().unwrap();
    for k in 0..10 {
        index.insert(entry(k, 2)).unwrap();
    }

    let range = KeyRange::between(&key(3), &key(5));
    let page = index.scan_page(&range, &range.start_position(), 100).unwrap();

    assert_eq!(page, vec![entry(3, 2), entry(3, 1), entry(4, 2), entry(4, 1)]);
}

// =============================================================================
// Reopen Tests
// =============================================================================

#[test]
fn test_reopen_from_flushed_root() {
    let temp = TempDir::new().unwrap();
    let actor = spawn_actor(temp.path());
    let (root, next) = {
        let index = new_index(&actor);
        for k in 0..25 {
            index.insert(entry(k, 1)).unwrap();
        }
        let outcome = index.flush().unwrap();
        (outcome.root, outcome.next_block_offset)
    };

    let index = open_index(&actor, root, next);

    assert_eq!(index.dirty_count(), 0);
    assert_eq!(index.lookup_as_of(&key(24), u64::MAX).unwrap(), Some(entry(24, 1)));
    assert_eq!(scan_all(&index).len(), 25);

    index.insert(entry(25, 1)).unwrap();
    let outcome = index.flush().unwrap();
    assert!(outcome.next_block_offset > next);
    assert_eq!(scan_all(&index).len(), 26);
}
