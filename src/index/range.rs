//! Key ranges and scan positions

use std::ops::{Bound, RangeBounds};

use super::types::{IndexEntry, Version, VersionedKey};

/// Range of keys for a scan; every version of an included key is included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
}

impl KeyRange {
    /// Every key
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Copy the bounds of any standard range over owned keys
    pub fn new<R: RangeBounds<Vec<u8>>>(range: R) -> Self {
        Self {
            start: range.start_bound().cloned(),
            end: range.end_bound().cloned(),
        }
    }

    /// `[start, end)`
    pub fn between(start: &[u8], end: &[u8]) -> Self {
        Self {
            start: Bound::Included(start.to_vec()),
            end: Bound::Excluded(end.to_vec()),
        }
    }

    /// Only `key`
    pub fn single(key: &[u8]) -> Self {
        Self {
            start: Bound::Included(key.to_vec()),
            end: Bound::Included(key.to_vec()),
        }
    }

    /// Whether `key` lies after the end bound (and so does everything after it)
    pub fn is_past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
        }
    }

    /// Whether `key` is at or after the start bound
    pub fn admits_start(&self, key: &[u8]) -> bool {
        match &self.start {
            Bound::Unbounded => true,
            Bound::Included(start) => key >= start.as_slice(),
            Bound::Excluded(start) => key > start.as_slice(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.admits_start(key) && !self.is_past_end(key)
    }

    /// Scan position of the first entry the range can contain
    pub fn start_position(&self) -> ScanStart {
        match &self.start {
            Bound::Unbounded => ScanStart::Unbounded,
            Bound::Included(key) => ScanStart::At(VersionedKey::latest(key)),
            Bound::Excluded(key) => ScanStart::After(VersionedKey::oldest(key)),
        }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Lower bound of a scan in composite (key, version) order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStart {
    Unbounded,

    /// First entry at or after the position
    At(VersionedKey),

    /// First entry strictly after the position (resumption)
    After(VersionedKey),
}

impl ScanStart {
    /// Resume right after an entry already yielded
    pub fn after(key: &[u8], version: Version) -> Self {
        ScanStart::After(VersionedKey::new(key, version))
    }

    /// Index of the first admitted entry in a sorted leaf
    pub fn first_index(&self, entries: &[IndexEntry]) -> usize {
        match self {
            ScanStart::Unbounded => 0,
            ScanStart::At(target) => entries.partition_point(|e| e.cmp_target(target).is_lt()),
            ScanStart::After(target) => entries.partition_point(|e| e.cmp_target(target).is_le()),
        }
    }

    /// Index of the child whose subtree holds the first admitted entry
    pub fn child_index(&self, separators: &[VersionedKey]) -> usize {
        match self {
            ScanStart::Unbounded => 0,
            ScanStart::At(target) | ScanStart::After(target) => {
                separators.partition_point(|s| s <= target)
            }
        }
    }

    pub fn admits(&self, entry: &IndexEntry) -> bool {
        match self {
            ScanStart::Unbounded => true,
            ScanStart::At(target) => entry.cmp_target(target).is_ge(),
            ScanStart::After(target) => entry.cmp_target(target).is_gt(),
        }
    }
}
