//! Guest memory: the VMM-local pool guest RAM is carved from, and the
//! coalescer that installs it into guest-physical space.

mod alloc;
mod gmm;
mod nem;
mod range;
mod slice;

pub use alloc::FreeList;
pub use gmm::{Gmm, GmmConfig};
pub use nem::Nem;
pub use range::{ByteRange, Side};
pub use slice::{LinearMap, Slice};

use bitflags::bitflags;

use crate::error::{Error, Result};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Page ids are grouped in chunks of 2 MiB.
pub const CHUNK_SHIFT: u32 = 21;
pub const CHUNK_ID_SHIFT: u32 = CHUNK_SHIFT - PAGE_SHIFT;

/// Added to every page index so no valid page lands in the nil chunk.
pub const PAGE_ID_BIAS: u64 = 1 << CHUNK_ID_SHIFT;

pub const DEFAULT_SLICE_SIZE: usize = 128 << 20;
pub const DEFAULT_LINEAR_MAP_SIZE: usize = 32 << 30;

/// Address in the VMM's own address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmmAddr(pub u64);

impl VmmAddr {
    pub fn offset(self, bytes: u64) -> VmmAddr {
        VmmAddr(self.0 + bytes)
    }
}

impl std::fmt::Display for VmmAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Guest-physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestAddr(pub u64);

impl GuestAddr {
    pub fn offset(self, bytes: u64) -> GuestAddr {
        GuestAddr(self.0 + bytes)
    }

    pub fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

impl std::fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A count of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pages(pub u64);

impl Pages {
    /// Size in bytes. Counts too large for the 64-bit address space are out
    /// of range.
    pub fn bytes(self) -> Result<u64> {
        self.0.checked_mul(PAGE_SIZE).ok_or(Error::OutOfRange(self.0))
    }

    /// Pages needed to hold `bytes`.
    pub fn from_bytes(bytes: u64) -> Pages {
        Pages(bytes.div_ceil(PAGE_SIZE))
    }
}

/// Compact 32-bit name of a page of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

impl PageId {
    /// The id no page ever has.
    pub const NIL: PageId = PageId(0);

    pub fn chunk_id(self) -> u32 {
        self.0 >> CHUNK_ID_SHIFT
    }

    /// Index of the page within its chunk.
    pub fn page_index(self) -> u32 {
        self.0 & ((1 << CHUNK_ID_SHIFT) - 1)
    }
}

bitflags! {
    /// Guest access rights of a mapping. Empty means no access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    pub const NONE: Protection = Protection::empty();

    pub fn is_none(self) -> bool {
        self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_fields() {
        let id = PageId((5 << CHUNK_ID_SHIFT) | 17);
        assert_eq!(id.chunk_id(), 5);
        assert_eq!(id.page_index(), 17);
        assert_eq!(PageId::NIL.chunk_id(), 0);
    }

    #[test]
    fn test_pages_from_bytes() {
        assert_eq!(Pages::from_bytes(1), Pages(1));
        assert_eq!(Pages::from_bytes(PAGE_SIZE), Pages(1));
        assert_eq!(Pages::from_bytes(PAGE_SIZE + 1), Pages(2));
        assert_eq!(Pages(3).bytes().unwrap(), 3 * PAGE_SIZE);
        assert!(Pages(1 << 52).bytes().unwrap_err().is_out_of_range());
    }
}
