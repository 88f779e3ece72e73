//! Lazy, restartable range scan

use crate::error::Result;

use super::range::{KeyRange, ScanStart};
use super::types::{Entry, IndexEntry};
use super::versioned::VersionedIndex;

/// Iterator over every version of every key in a range.
///
/// Entries are fetched a page at a time; no lock is held between pages, so
/// a long scan sees each page as a consistent snapshot and may observe
/// writes made after it started. [`resume_position`](Self::resume_position)
/// restarts a scan right after the last entry it yielded.
pub struct Scan<'a> {
    index: &'a VersionedIndex,
    range: KeyRange,
    /// Where the next page starts
    next_start: ScanStart,
    /// Position after the last yielded entry
    resume: ScanStart,
    page: std::vec::IntoIter<IndexEntry>,
    page_len: usize,
    exhausted: bool,
}

impl<'a> Scan<'a> {
    pub(crate) fn new(index: &'a VersionedIndex, range: KeyRange, start: ScanStart, page_len: usize) -> Self {
        Self {
            index,
            range,
            next_start: start.clone(),
            resume: start,
            page: Vec::new().into_iter(),
            page_len: page_len.max(1),
            exhausted: false,
        }
    }

    /// Pass to [`VersionedIndex::scan_from`] to continue after the last
    /// entry this scan returned
    pub fn resume_position(&self) -> ScanStart {
        self.resume.clone()
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }
}

impl Iterator for Scan<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.page.next() {
                self.resume = ScanStart::after(&entry.key, entry.version);
                return Some(self.index.resolve(entry));
            }
            if self.exhausted {
                return None;
            }

            let page = match self
                .index
                .backend()
                .scan_page(&self.range, &self.next_start, self.page_len)
            {
                Ok(page) => page,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            };
            match page.last() {
                Some(last) => self.next_start = ScanStart::after(&last.key, last.version),
                None => {
                    self.exhausted = true;
                    return None;
                }
            }
            self.page = page.into_iter();
        }
    }
}
