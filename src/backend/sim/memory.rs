//! Simulated guest-physical address space.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::backend::GuestMemoryMap;
use crate::error::{Error, Result};
use crate::memory::{GuestAddr, Protection, Slice, VmmAddr, PAGE_SHIFT, PAGE_SIZE};

/// One mapping operation as the hypervisor received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOp {
    Map {
        slice: usize,
        offset: usize,
        size: usize,
        guest_addr: GuestAddr,
        prot: Protection,
    },
    Unmap {
        guest_addr: GuestAddr,
        size: u64,
    },
}

/// What a guest-physical address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestMapping {
    pub host: VmmAddr,
    pub prot: Protection,
}

#[derive(Debug, Default)]
struct Inner {
    ops: Vec<MapOp>,
    /// Guest page frame to mapping of the page
    pages: BTreeMap<u64, GuestMapping>,
}

/// Guest page table of the simulated hypervisor.
///
/// Records every operation in order, so callers can check how many
/// round trips a layout change took.
#[derive(Debug, Default)]
pub struct SimMemoryMap {
    inner: Mutex<Inner>,
}

impl SimMemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations received so far, oldest first.
    pub fn ops(&self) -> Vec<MapOp> {
        self.inner.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().ops.clear();
    }

    /// Number of guest pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Resolve a guest-physical address.
    pub fn translate(&self, addr: GuestAddr) -> Option<GuestMapping> {
        let inner = self.inner.lock();
        let mapping = inner.pages.get(&(addr.0 >> PAGE_SHIFT))?;
        Some(GuestMapping {
            host: mapping.host.offset(addr.0 % PAGE_SIZE),
            prot: mapping.prot,
        })
    }
}

fn check_aligned(what: &str, value: u64) -> Result<()> {
    if value % PAGE_SIZE != 0 {
        return Err(Error::hypervisor(format!("{what} {value:#x} is not page aligned")));
    }
    Ok(())
}

impl GuestMemoryMap for SimMemoryMap {
    fn map_range(
        &self,
        slice: &Slice,
        offset: usize,
        size: usize,
        guest_addr: GuestAddr,
        prot: Protection,
    ) -> Result<()> {
        check_aligned("offset", offset as u64)?;
        check_aligned("size", size as u64)?;
        check_aligned("guest address", guest_addr.0)?;
        if offset + size > slice.size() {
            return Err(Error::OutOfRange(slice.base().0 + (offset + size) as u64));
        }

        let mut inner = self.inner.lock();
        inner.ops.push(MapOp::Map {
            slice: slice.index(),
            offset,
            size,
            guest_addr,
            prot,
        });

        let host = slice.base().offset(offset as u64);
        for page in 0..(size as u64 >> PAGE_SHIFT) {
            let mapping = GuestMapping {
                host: host.offset(page << PAGE_SHIFT),
                prot,
            };
            inner.pages.insert((guest_addr.0 >> PAGE_SHIFT) + page, mapping);
        }
        Ok(())
    }

    fn unmap_range(&self, guest_addr: GuestAddr, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(MapOp::Unmap { guest_addr, size });

        let first = guest_addr.0 >> PAGE_SHIFT;
        let last = (guest_addr.0 + size).div_ceil(PAGE_SIZE);
        let doomed: Vec<u64> = inner.pages.range(first..last).map(|(&page, _)| page).collect();
        for page in doomed {
            inner.pages.remove(&page);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LinearMap;

    #[test]
    fn test_map_and_unmap() {
        let mut map = LinearMap::reserve(1 << 20).unwrap();
        let slice = map.attach(0, 0, 64 << 10).unwrap();
        let mapper = SimMemoryMap::new();

        mapper
            .map_range(&slice, 0x2000, 0x3000, GuestAddr(0x10000), Protection::READ)
            .unwrap();
        assert_eq!(mapper.mapped_pages(), 3);

        let mapping = mapper.translate(GuestAddr(0x11008)).unwrap();
        assert_eq!(mapping.host, slice.base().offset(0x3008));
        assert_eq!(mapping.prot, Protection::READ);

        mapper.unmap_range(GuestAddr(0x11000), 0x1000).unwrap();
        assert!(mapper.translate(GuestAddr(0x11000)).is_none());
        assert_eq!(mapper.mapped_pages(), 2);
        assert_eq!(mapper.ops().len(), 2);
    }

    #[test]
    fn test_map_rejects_bad_ranges() {
        let mut map = LinearMap::reserve(1 << 20).unwrap();
        let slice = map.attach(0, 0, 64 << 10).unwrap();
        let mapper = SimMemoryMap::new();

        assert!(mapper
            .map_range(&slice, 0x800, 0x1000, GuestAddr(0), Protection::READ)
            .is_err());
        assert!(mapper
            .map_range(&slice, 0xf000, 0x2000, GuestAddr(0), Protection::READ)
            .unwrap_err()
            .is_out_of_range());
        assert!(mapper.ops().is_empty());
    }
}
