//! Core index types: versions, composite keys, entries and value references

use std::cmp::Ordering;

use crate::io::IoAddress;
use crate::wal::ValueLogRecord;

/// Per-key monotonically increasing version (first write is 1)
pub type Version = u64;

/// Composite tree key: key ascending, then version descending.
///
/// With this order the newest version of a key sorts first, so "latest" and
/// "as of" are both a seek to the first entry at or after `(key, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedKey {
    pub key: Vec<u8>,
    pub version: Version,
}

impl VersionedKey {
    pub fn new(key: impl Into<Vec<u8>>, version: Version) -> Self {
        Self {
            key: key.into(),
            version,
        }
    }

    /// Sorts before every stored version of `key`
    pub fn latest(key: &[u8]) -> Self {
        Self::new(key, Version::MAX)
    }

    /// Sorts after every stored version of `key`
    pub fn oldest(key: &[u8]) -> Self {
        Self::new(key, 0)
    }
}

impl Ord for VersionedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.key, self.version, &other.key, other.version)
    }
}

impl PartialOrd for VersionedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Composite comparison without building a `VersionedKey`
#[inline]
pub fn compare(a_key: &[u8], a_version: Version, b_key: &[u8], b_version: Version) -> Ordering {
    a_key.cmp(b_key).then_with(|| b_version.cmp(&a_version))
}

/// Where a leaf entry's value lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    /// Small value stored in the leaf itself
    Inline(Vec<u8>),

    /// Address of the value-log record holding the value
    Logged(IoAddress),

    /// Deletion marker
    Tombstone,
}

/// One version of one key as stored in leaf nodes and leaf blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub version: Version,
    /// Wall-clock write time (unix millis)
    pub timestamp: u64,
    pub value: ValueRef,
}

impl IndexEntry {
    /// Build the leaf entry for a record appended at `address`
    pub fn from_record(record: &ValueLogRecord, address: IoAddress, inline_limit: usize) -> Self {
        let value = match &record.value {
            None => ValueRef::Tombstone,
            Some(v) if v.len() <= inline_limit => ValueRef::Inline(v.clone()),
            Some(_) => ValueRef::Logged(address),
        };
        Self {
            key: record.key.clone(),
            version: record.version,
            timestamp: record.timestamp,
            value,
        }
    }

    pub fn versioned_key(&self) -> VersionedKey {
        VersionedKey::new(self.key.clone(), self.version)
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.value, ValueRef::Tombstone)
    }

    /// Composite comparison against a seek target
    #[inline]
    pub fn cmp_target(&self, target: &VersionedKey) -> Ordering {
        compare(&self.key, self.version, &target.key, target.version)
    }
}

/// A resolved version of a key, as returned to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub version: Version,
    pub timestamp: u64,
    /// `None` for a tombstone
    pub value: Option<Vec<u8>>,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}
