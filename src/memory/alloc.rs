//! Address-ordered first-fit allocator over page ranges.

use std::collections::BTreeMap;

/// Free page ranges, keyed by first page, coalesced with their neighbours.
#[derive(Debug, Default, Clone)]
pub struct FreeList {
    ranges: BTreeMap<u64, u64>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of free pages.
    pub fn free_pages(&self) -> u64 {
        self.ranges.values().sum()
    }

    /// Number of disjoint free ranges.
    pub fn fragments(&self) -> usize {
        self.ranges.len()
    }

    /// Allocate `count` contiguous pages at the lowest address that fits.
    pub fn alloc(&mut self, count: u64) -> Option<u64> {
        if count == 0 {
            return None;
        }

        let (&start, &len) = self.ranges.iter().find(|(_, &len)| len >= count)?;
        self.ranges.remove(&start);
        if len > count {
            self.ranges.insert(start + count, len - count);
        }
        Some(start)
    }

    /// Return `[start, start + count)` to the list.
    ///
    /// Returns false, leaving the list untouched, if any page of the range is
    /// already free.
    pub fn free(&mut self, start: u64, count: u64) -> bool {
        if count == 0 {
            return true;
        }
        let end = start + count;

        let prev = self.ranges.range(..end).next_back().map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len > start {
                return false;
            }
        }

        let mut new_start = start;
        let mut new_len = count;

        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                self.ranges.remove(&prev_start);
                new_start = prev_start;
                new_len += prev_len;
            }
        }

        if let Some(next_len) = self.ranges.remove(&end) {
            new_len += next_len;
        }

        self.ranges.insert(new_start, new_len);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit() {
        let mut list = FreeList::new();
        assert!(list.free(0, 16));

        assert_eq!(list.alloc(4), Some(0));
        assert_eq!(list.alloc(4), Some(4));
        assert_eq!(list.free_pages(), 8);

        // a hole at the front is preferred once it fits
        assert!(list.free(0, 4));
        assert_eq!(list.alloc(2), Some(0));
        assert_eq!(list.alloc(4), Some(8));
        assert_eq!(list.alloc(8), None);
    }

    #[test]
    fn test_free_coalesces() {
        let mut list = FreeList::new();
        assert!(list.free(0, 4));
        assert!(list.free(8, 4));
        assert_eq!(list.fragments(), 2);

        assert!(list.free(4, 4));
        assert_eq!(list.fragments(), 1);
        assert_eq!(list.alloc(12), Some(0));
    }

    #[test]
    fn test_double_free_rejected() {
        let mut list = FreeList::new();
        assert!(list.free(0, 8));

        assert!(!list.free(4, 2));
        assert!(!list.free(6, 4));
        assert_eq!(list.free_pages(), 8);
    }

    #[test]
    fn test_zero_pages() {
        let mut list = FreeList::new();
        assert!(list.free(0, 4));
        assert_eq!(list.alloc(0), None);
        assert!(list.free(10, 0));
        assert_eq!(list.free_pages(), 4);
    }
}
