//! Inclusive byte ranges that can grow at either end.

/// End of a range another range adjoins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The other range ends right before this one starts.
    Before,
    /// The other range starts right after this one ends.
    After,
}

/// A non-empty range of addresses `[first_byte, last_byte]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    first_byte: u64,
    last_byte: u64,
}

impl ByteRange {
    /// The range of `size` bytes starting at `start`. `None` if it is empty
    /// or wraps around the address space.
    pub fn new(start: u64, size: u64) -> Option<Self> {
        let last_byte = start.checked_add(size.checked_sub(1)?)?;
        Some(Self {
            first_byte: start,
            last_byte,
        })
    }

    pub fn start(&self) -> u64 {
        self.first_byte
    }

    pub fn last(&self) -> u64 {
        self.last_byte
    }

    pub fn size(&self) -> u64 {
        self.last_byte - self.first_byte + 1
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.first_byte && addr <= self.last_byte
    }

    /// Where `other` touches this range without overlapping, if it does.
    pub fn adjoins(&self, other: &ByteRange) -> Option<Side> {
        if self.last_byte.checked_add(1) == Some(other.first_byte) {
            Some(Side::After)
        } else if other.last_byte.checked_add(1) == Some(self.first_byte) {
            Some(Side::Before)
        } else {
            None
        }
    }

    /// Grow this range to cover `other`, which adjoins it on `side`.
    pub fn extend(&mut self, other: &ByteRange, side: Side) {
        match side {
            Side::Before => self.first_byte = other.first_byte,
            Side::After => self.last_byte = other.last_byte,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjoins() {
        let range = ByteRange::new(0x2000, 0x1000).unwrap();

        assert_eq!(range.adjoins(&ByteRange::new(0x3000, 0x1000).unwrap()), Some(Side::After));
        assert_eq!(range.adjoins(&ByteRange::new(0x1000, 0x1000).unwrap()), Some(Side::Before));
        assert_eq!(range.adjoins(&ByteRange::new(0x4000, 0x1000).unwrap()), None);
        assert_eq!(range.adjoins(&ByteRange::new(0x2000, 0x1000).unwrap()), None);
    }

    #[test]
    fn test_extend() {
        let mut range = ByteRange::new(0x2000, 0x1000).unwrap();
        range.extend(&ByteRange::new(0x1000, 0x1000).unwrap(), Side::Before);
        range.extend(&ByteRange::new(0x3000, 0x2000).unwrap(), Side::After);

        assert_eq!(range.start(), 0x1000);
        assert_eq!(range.last(), 0x4fff);
        assert_eq!(range.size(), 0x4000);
        assert!(range.contains(0x4fff));
        assert!(!range.contains(0x5000));
    }

    #[test]
    fn test_empty_or_wrapping() {
        assert!(ByteRange::new(0x1000, 0).is_none());
        assert!(ByteRange::new(u64::MAX - 0xfff, 0x2000).is_none());
        assert_eq!(ByteRange::new(u64::MAX - 0xfff, 0x1000).unwrap().last(), u64::MAX);
    }
}
