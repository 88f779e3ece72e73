//! B+Tree nodes
//!
//! Nodes live in a flat arena and refer to their children by [`NodeId`]
//! (resident) or [`IoAddress`] (on disk). There are no parent pointers;
//! callers keep the descent path when they need to walk back up.

use crate::error::{ChronoError, Result};
use crate::io::IoAddress;

use super::types::{IndexEntry, VersionedKey};

/// Stable index of a resident node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Child reference held by an internal node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Resident(NodeId),
    OnDisk(IoAddress),
}

/// Sorted entries: key ascending, version descending
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    pub entries: Vec<IndexEntry>,
}

/// `children.len() == separators.len() + 1`; child `i` covers
/// `[separators[i - 1], separators[i])`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    /// Height above the leaves (1 = children are leaves)
    pub level: u16,
    pub separators: Vec<VersionedKey>,
    pub children: Vec<Child>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl LeafNode {
    /// Insert in order, replacing an entry with the same (key, version)
    pub fn upsert(&mut self, entry: IndexEntry) {
        let target = entry.versioned_key();
        let pos = self
            .entries
            .partition_point(|e| e.cmp_target(&target).is_lt());
        if self.entries.get(pos).map_or(false, |e| e.cmp_target(&target).is_eq()) {
            self.entries[pos] = entry;
        } else {
            self.entries.insert(pos, entry);
        }
    }
}

impl InternalNode {
    /// Index of the child whose range holds `target`
    pub fn child_index(&self, target: &VersionedKey) -> usize {
        self.separators.partition_point(|s| s <= target)
    }
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf(LeafNode::default())
    }

    /// Entries for a leaf, children for an internal node
    pub fn occupancy(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Internal(inner) => inner.children.len(),
        }
    }

    pub fn level(&self) -> u16 {
        match self {
            Node::Leaf(_) => 0,
            Node::Internal(inner) => inner.level,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Smallest composite key stored under this node, if it is a non-empty leaf
    pub fn first_key(&self) -> Option<VersionedKey> {
        match self {
            Node::Leaf(leaf) => leaf.entries.first().map(IndexEntry::versioned_key),
            Node::Internal(_) => None,
        }
    }

    /// Split at the median. Returns the separator to promote and the new
    /// right sibling; `self` keeps the lower half.
    ///
    /// Leaves copy the first right key up; internal nodes move the middle
    /// separator up.
    pub fn split(&mut self) -> (VersionedKey, Node) {
        match self {
            Node::Leaf(leaf) => {
                let mid = leaf.entries.len() / 2;
                let right = leaf.entries.split_off(mid);
                let separator = right[0].versioned_key();
                (separator, Node::Leaf(LeafNode { entries: right }))
            }
            Node::Internal(inner) => {
                let mid = inner.children.len() / 2;
                let right_children = inner.children.split_off(mid);
                let right_separators = inner.separators.split_off(mid);
                // the last separator left on this side moves up
                let promoted = inner
                    .separators
                    .pop()
                    .unwrap_or_else(|| right_separators[0].clone());
                let right = InternalNode {
                    level: inner.level,
                    separators: right_separators,
                    children: right_children,
                };
                (promoted, Node::Internal(right))
            }
        }
    }
}

// =============================================================================
// Sibling Rebalancing
// =============================================================================

/// Move one item from `right` to the end of `left`, returning the new
/// separator between them. `separator` is the current one.
pub fn shift_left(left: &mut Node, right: &mut Node, separator: VersionedKey) -> Result<VersionedKey> {
    match (left, right) {
        (Node::Leaf(l), Node::Leaf(r)) => {
            if r.entries.len() < 2 {
                return Err(ChronoError::corruption("cannot borrow from a leaf with one entry"));
            }
            l.entries.push(r.entries.remove(0));
            Ok(r.entries[0].versioned_key())
        }
        (Node::Internal(l), Node::Internal(r)) => {
            if r.children.len() < 2 {
                return Err(ChronoError::corruption("cannot borrow from an internal node with one child"));
            }
            l.separators.push(separator);
            l.children.push(r.children.remove(0));
            Ok(r.separators.remove(0))
        }
        _ => Err(ChronoError::corruption("siblings at different levels")),
    }
}

/// Move one item from the end of `left` to the front of `right`
pub fn shift_right(left: &mut Node, right: &mut Node, separator: VersionedKey) -> Result<VersionedKey> {
    match (left, right) {
        (Node::Leaf(l), Node::Leaf(r)) => {
            let moved = l
                .entries
                .pop()
                .ok_or_else(|| ChronoError::corruption("cannot borrow from an empty leaf"))?;
            r.entries.insert(0, moved);
            Ok(r.entries[0].versioned_key())
        }
        (Node::Internal(l), Node::Internal(r)) => {
            let (Some(child), Some(up)) = (l.children.pop(), l.separators.pop()) else {
                return Err(ChronoError::corruption("cannot borrow from an internal node with one child"));
            };
            r.children.insert(0, child);
            r.separators.insert(0, separator);
            Ok(up)
        }
        _ => Err(ChronoError::corruption("siblings at different levels")),
    }
}

/// Append `right` onto `left`; `separator` is the key that divided them
pub fn merge_into(left: &mut Node, right: Node, separator: VersionedKey) -> Result<()> {
    match (left, right) {
        (Node::Leaf(l), Node::Leaf(mut r)) => {
            l.entries.append(&mut r.entries);
            Ok(())
        }
        (Node::Internal(l), Node::Internal(mut r)) => {
            l.separators.push(separator);
            l.separators.append(&mut r.separators);
            l.children.append(&mut r.children);
            Ok(())
        }
        _ => Err(ChronoError::corruption("siblings at different levels")),
    }
}
