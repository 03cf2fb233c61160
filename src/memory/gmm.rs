//! Guest memory pool.
//!
//! Guest RAM lives in one linear map in the VMM's address space. The map is
//! reserved up front and backed slice by slice as allocations need it; slices
//! are appended in address order and never released. Pages are handed out by
//! an address-ordered first-fit allocator over the backed part of the map.

use std::sync::Arc;

use crate::backend::GuestMemoryMap;
use crate::error::{Error, Result};

use super::{
    FreeList, GuestAddr, LinearMap, PageId, Pages, Protection, Slice, VmmAddr, DEFAULT_LINEAR_MAP_SIZE,
    DEFAULT_SLICE_SIZE, PAGE_ID_BIAS, PAGE_SHIFT, PAGE_SIZE,
};

/// Sizes of the linear map and its backing slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GmmConfig {
    /// Bytes added to the backing store per growth step.
    pub slice_size: usize,
    /// Upper bound of guest RAM, in bytes.
    pub linear_map_size: usize,
}

impl Default for GmmConfig {
    fn default() -> Self {
        Self {
            slice_size: DEFAULT_SLICE_SIZE,
            linear_map_size: DEFAULT_LINEAR_MAP_SIZE,
        }
    }
}

impl GmmConfig {
    pub fn validate(&self) -> Result<()> {
        let page_size = PAGE_SIZE as usize;

        if self.slice_size == 0 || self.slice_size % page_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "slice size {:#x} is not a multiple of the page size",
                self.slice_size
            )));
        }
        if self.linear_map_size == 0 || self.linear_map_size % page_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "linear map size {:#x} is not a multiple of the page size",
                self.linear_map_size
            )));
        }
        if self.linear_map_size % self.slice_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "slice size {:#x} does not divide linear map size {:#x}",
                self.slice_size, self.linear_map_size
            )));
        }

        let map_pages = (self.linear_map_size >> PAGE_SHIFT) as u64;
        if map_pages + PAGE_ID_BIAS > u64::from(u32::MAX) + 1 {
            return Err(Error::InvalidConfig(format!(
                "linear map of {map_pages} pages exceeds the page id space"
            )));
        }

        Ok(())
    }

    fn slice_pages(&self) -> u64 {
        (self.slice_size >> PAGE_SHIFT) as u64
    }

    fn map_pages(&self) -> u64 {
        (self.linear_map_size >> PAGE_SHIFT) as u64
    }
}

/// The guest memory pool.
pub struct Gmm {
    config: GmmConfig,
    map: LinearMap,
    slices: Vec<Slice>,
    free: FreeList,
    reserved_pages: u64,
    mapper: Arc<dyn GuestMemoryMap>,
}

impl std::fmt::Debug for Gmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gmm")
            .field("config", &self.config)
            .field("base", &self.base())
            .field("slices", &self.slices.len())
            .field("reserved_pages", &self.reserved_pages)
            .finish_non_exhaustive()
    }
}

impl Gmm {
    /// Reserve the linear map. No backing memory is attached yet.
    pub fn new(config: GmmConfig, mapper: Arc<dyn GuestMemoryMap>) -> Result<Self> {
        config.validate()?;
        let map = LinearMap::reserve(config.linear_map_size)?;

        tracing::debug!(
            base = %map.base(),
            size = config.linear_map_size,
            slice_size = config.slice_size,
            "linear map reserved"
        );

        Ok(Self {
            config,
            map,
            slices: Vec::new(),
            free: FreeList::new(),
            reserved_pages: 0,
            mapper,
        })
    }

    pub fn config(&self) -> &GmmConfig {
        &self.config
    }

    /// Start of the linear map.
    pub fn base(&self) -> VmmAddr {
        self.map.base()
    }

    /// Pages currently handed out.
    pub fn reserved_pages(&self) -> u64 {
        self.reserved_pages
    }

    /// Pages backed by attached slices.
    pub fn materialized_pages(&self) -> u64 {
        self.slices.len() as u64 * self.config.slice_pages()
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    pub fn slice(&self, index: usize) -> Option<&Slice> {
        self.slices.get(index)
    }

    /// Allocate `pages` contiguous pages, growing the backing store as needed.
    pub fn alloc(&mut self, pages: Pages) -> Result<VmmAddr> {
        if pages.0 == 0 {
            return Err(Error::AllocationFailed("cannot allocate zero pages".to_string()));
        }

        let needed = self
            .reserved_pages
            .checked_add(pages.0)
            .filter(|&needed| needed <= self.config.map_pages())
            .ok_or_else(|| {
                let beyond = self.reserved_pages.saturating_add(pages.0);
                Error::OutOfRange(self.base().0.saturating_add(beyond.saturating_mul(PAGE_SIZE)))
            })?;

        while self.materialized_pages() < needed {
            self.add_slice()?;
        }

        let start = loop {
            if let Some(start) = self.free.alloc(pages.0) {
                break start;
            }
            // enough free pages in total, but fragmented
            if self.materialized_pages() + self.config.slice_pages() > self.config.map_pages() {
                return Err(Error::AllocationFailed(format!(
                    "no contiguous range of {} pages ({} free)",
                    pages.0,
                    self.free.free_pages()
                )));
            }
            self.add_slice()?;
        };

        self.reserved_pages += pages.0;
        let addr = self.base().offset(start << PAGE_SHIFT);
        tracing::trace!(%addr, pages = pages.0, "allocated");
        Ok(addr)
    }

    /// Return pages obtained from [`Gmm::alloc`].
    pub fn free(&mut self, addr: VmmAddr, pages: Pages) -> Result<()> {
        let start = self.materialized_page(addr, pages)?;

        if !self.free.free(start, pages.0) {
            return Err(Error::AllocationFailed(format!("pages at {addr} are already free")));
        }
        self.reserved_pages -= pages.0;
        tracing::trace!(%addr, pages = pages.0, "freed");
        Ok(())
    }

    /// Attach the next slice right after the backed part of the map.
    fn add_slice(&mut self) -> Result<()> {
        let index = self.slices.len();
        let offset = index * self.config.slice_size;
        if offset + self.config.slice_size > self.config.linear_map_size {
            return Err(Error::OutOfRange(self.base().0 + offset as u64));
        }

        let slice = self.map.attach(index, offset, self.config.slice_size)?;
        let added = self
            .free
            .free((offset >> PAGE_SHIFT) as u64, self.config.slice_pages());
        debug_assert!(added);

        tracing::debug!(index, base = %slice.base(), "slice attached");
        self.slices.push(slice);
        Ok(())
    }

    /// Offset in the map of `addr`, if `[addr, addr + len)` is backed.
    fn backed_offset(&self, addr: VmmAddr, len: u64) -> Result<u64> {
        let base = self.base().0;
        let backed = self.materialized_pages() << PAGE_SHIFT;
        match addr.0.checked_sub(base) {
            Some(offset) if offset.checked_add(len).is_some_and(|end| end <= backed) => Ok(offset),
            _ => Err(Error::OutOfRange(addr.0)),
        }
    }

    /// Page index in the map of `addr`, if `pages` pages from there are backed.
    fn materialized_page(&self, addr: VmmAddr, pages: Pages) -> Result<u64> {
        if addr.0 % PAGE_SIZE != 0 {
            return Err(Error::OutOfRange(addr.0));
        }
        Ok(self.backed_offset(addr, pages.bytes()?)? >> PAGE_SHIFT)
    }

    /// Page id of the page containing `addr`.
    pub fn page_id(&self, addr: VmmAddr) -> Result<PageId> {
        let base = self.base().0;
        if addr.0 < base || addr.0 - base >= self.config.linear_map_size as u64 {
            return Err(Error::OutOfRange(addr.0));
        }

        let index = (addr.0 - base) >> PAGE_SHIFT;
        Ok(PageId((index + PAGE_ID_BIAS) as u32))
    }

    /// Address of the page named by `id`.
    pub fn vmm_addr(&self, id: PageId) -> Result<VmmAddr> {
        let raw = u64::from(id.0);
        if raw < PAGE_ID_BIAS || raw - PAGE_ID_BIAS >= self.config.map_pages() {
            return Err(Error::OutOfRange(raw));
        }

        Ok(self.base().offset((raw - PAGE_ID_BIAS) << PAGE_SHIFT))
    }

    /// Map `pages` pages at `host` to `guest` with `prot`.
    ///
    /// Whatever was mapped at the guest range before is revoked first.
    /// Protection none leaves the range unmapped. Invalid ranges fail before
    /// anything is revoked.
    pub fn map_to_guest(&self, host: VmmAddr, guest: GuestAddr, pages: Pages, prot: Protection) -> Result<()> {
        if pages.0 == 0 {
            return Ok(());
        }

        let size = pages.bytes()?;
        if guest.0.checked_add(size).is_none() {
            return Err(Error::OutOfRange(guest.0));
        }

        if prot.is_none() {
            self.mapper.unmap_range(guest, size)?;
            tracing::trace!(%guest, pages = pages.0, "guest range unmapped");
            return Ok(());
        }

        let start = self.materialized_page(host, pages)? << PAGE_SHIFT;
        self.mapper.unmap_range(guest, size)?;

        let end = start + size;
        let slice_size = self.config.slice_size as u64;

        let mut offset = start;
        let mut guest_addr = guest;
        while offset < end {
            let slice = &self.slices[(offset / slice_size) as usize];
            let in_slice = offset % slice_size;
            let len = (slice_size - in_slice).min(end - offset);

            self.mapper
                .map_range(slice, in_slice as usize, len as usize, guest_addr, prot)?;

            offset += len;
            guest_addr = guest_addr.offset(len);
        }

        tracing::trace!(%host, %guest, pages = pages.0, ?prot, "mapped to guest");
        Ok(())
    }

    /// Copy `data` into the pool at `addr`. The range may span slices but
    /// must be backed entirely.
    pub fn write(&mut self, addr: VmmAddr, data: &[u8]) -> Result<()> {
        let mut offset = self.backed_offset(addr, data.len() as u64)? as usize;
        let slice_size = self.config.slice_size;

        let mut data = data;
        while !data.is_empty() {
            let in_slice = offset % slice_size;
            let len = data.len().min(slice_size - in_slice);
            self.slices[offset / slice_size].write(in_slice, &data[..len])?;
            offset += len;
            data = &data[len..];
        }
        Ok(())
    }

    /// Copy bytes at `addr` out of the pool. The range may span slices but
    /// must be backed entirely.
    pub fn read(&self, addr: VmmAddr, buf: &mut [u8]) -> Result<()> {
        let mut offset = self.backed_offset(addr, buf.len() as u64)? as usize;
        let slice_size = self.config.slice_size;

        let mut buf = buf;
        while !buf.is_empty() {
            let in_slice = offset % slice_size;
            let len = buf.len().min(slice_size - in_slice);
            let (head, rest) = buf.split_at_mut(len);
            self.slices[offset / slice_size].read(in_slice, head)?;
            offset += len;
            buf = rest;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{MapOp, SimMemoryMap};

    const SLICE: usize = 64 << 10;
    const SLICE_PAGES: u64 = (SLICE >> PAGE_SHIFT) as u64;

    fn small_config() -> GmmConfig {
        GmmConfig {
            slice_size: SLICE,
            linear_map_size: 4 * SLICE,
        }
    }

    fn gmm() -> (Gmm, Arc<SimMemoryMap>) {
        let mapper = Arc::new(SimMemoryMap::new());
        let gmm = Gmm::new(small_config(), mapper.clone()).unwrap();
        (gmm, mapper)
    }

    #[test]
    fn test_config_validation() {
        assert!(GmmConfig::default().validate().is_ok());
        assert!(small_config().validate().is_ok());

        let unaligned = GmmConfig {
            slice_size: SLICE + 1,
            ..small_config()
        };
        assert!(matches!(unaligned.validate(), Err(Error::InvalidConfig(_))));

        let indivisible = GmmConfig {
            slice_size: 3 * 4096,
            linear_map_size: 16 * 4096,
        };
        assert!(matches!(indivisible.validate(), Err(Error::InvalidConfig(_))));

        let too_large = GmmConfig {
            slice_size: 1 << 30,
            linear_map_size: 1 << 44,
        };
        assert!(matches!(too_large.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_lazy_growth() {
        let (mut gmm, _) = gmm();
        assert_eq!(gmm.slice_count(), 0);

        let first = gmm.alloc(Pages(1)).unwrap();
        assert_eq!(first, gmm.base());
        assert_eq!(gmm.slice_count(), 1);

        // the rest of the first slice needs no growth
        gmm.alloc(Pages(SLICE_PAGES - 1)).unwrap();
        assert_eq!(gmm.slice_count(), 1);

        let next = gmm.alloc(Pages(1)).unwrap();
        assert_eq!(gmm.slice_count(), 2);
        assert_eq!(next, gmm.slice(1).unwrap().base());
        assert_eq!(gmm.reserved_pages(), SLICE_PAGES + 1);
        assert_eq!(gmm.materialized_pages(), 2 * SLICE_PAGES);
    }

    #[test]
    fn test_growth_stops_at_map_bound() {
        let (mut gmm, _) = gmm();

        let mut addrs = Vec::new();
        for _ in 0..4 {
            addrs.push(gmm.alloc(Pages(SLICE_PAGES)).unwrap());
        }
        assert_eq!(gmm.slice_count(), 4);
        // slices are appended in address order, without overlap
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(*addr, gmm.base().offset((i * SLICE) as u64));
        }

        let err = gmm.alloc(Pages(1)).unwrap_err();
        assert!(err.is_out_of_range());
        assert_eq!(gmm.slice_count(), 4);
        assert_eq!(gmm.reserved_pages(), 4 * SLICE_PAGES);
    }

    #[test]
    fn test_allocation_spanning_slices() {
        let (mut gmm, _) = gmm();

        let addr = gmm.alloc(Pages(SLICE_PAGES + 2)).unwrap();
        assert_eq!(addr, gmm.base());
        assert_eq!(gmm.slice_count(), 2);
    }

    #[test]
    fn test_fragmentation_grows_further() {
        let (mut gmm, _) = gmm();

        let a = gmm.alloc(Pages(4)).unwrap();
        let _b = gmm.alloc(Pages(SLICE_PAGES - 4)).unwrap();
        gmm.free(a, Pages(4)).unwrap();

        // 4 pages free in slice 0 but not 8 contiguous
        let c = gmm.alloc(Pages(8)).unwrap();
        assert_eq!(c, gmm.slice(1).unwrap().base());
    }

    #[test]
    fn test_fragmentation_at_bound_fails() {
        let (mut gmm, _) = gmm();

        let mut addrs = Vec::new();
        for _ in 0..4 {
            addrs.push(gmm.alloc(Pages(SLICE_PAGES)).unwrap());
        }
        gmm.free(addrs[0], Pages(2)).unwrap();
        gmm.free(addrs[2], Pages(2)).unwrap();

        let err = gmm.alloc(Pages(4)).unwrap_err();
        assert!(err.is_allocation_failed());
    }

    #[test]
    fn test_free_reuses_lowest_range() {
        let (mut gmm, _) = gmm();

        let a = gmm.alloc(Pages(2)).unwrap();
        let b = gmm.alloc(Pages(2)).unwrap();
        gmm.free(a, Pages(2)).unwrap();
        assert_eq!(gmm.reserved_pages(), 2);

        assert_eq!(gmm.alloc(Pages(1)).unwrap(), a);
        assert!(gmm.free(b, Pages(2)).is_ok());
        assert!(gmm.free(b, Pages(2)).unwrap_err().is_allocation_failed());
        assert!(gmm.free(gmm.base().offset((4 * SLICE) as u64), Pages(1)).is_err());
    }

    #[test]
    fn test_page_id_bijection() {
        let (mut gmm, _) = gmm();
        gmm.alloc(Pages(1)).unwrap();

        let base = gmm.base();
        for page in [0, 1, SLICE_PAGES, 4 * SLICE_PAGES - 1] {
            let addr = base.offset(page << PAGE_SHIFT);
            let id = gmm.page_id(addr).unwrap();
            assert_eq!(u64::from(id.0), page + PAGE_ID_BIAS);
            assert_eq!(gmm.vmm_addr(id).unwrap(), addr);
        }

        assert!(gmm.page_id(base.offset((4 * SLICE) as u64)).unwrap_err().is_out_of_range());
        assert!(gmm.page_id(VmmAddr(base.0 - PAGE_SIZE)).unwrap_err().is_out_of_range());
        assert!(gmm.vmm_addr(PageId::NIL).unwrap_err().is_out_of_range());
        assert!(gmm.vmm_addr(PageId((PAGE_ID_BIAS - 1) as u32)).unwrap_err().is_out_of_range());
        assert!(gmm
            .vmm_addr(PageId((PAGE_ID_BIAS + 4 * SLICE_PAGES) as u32))
            .unwrap_err()
            .is_out_of_range());
    }

    #[test]
    fn test_page_id_first_chunk_is_nil_free() {
        let (gmm, _) = gmm();
        let id = gmm.page_id(gmm.base()).unwrap();
        assert_eq!(id.chunk_id(), 1);
        assert_eq!(id.page_index(), 0);
    }

    #[test]
    fn test_map_to_guest_splits_at_slices() {
        let (mut gmm, mapper) = gmm();
        gmm.alloc(Pages(SLICE_PAGES - 2)).unwrap();
        let host = gmm.alloc(Pages(4)).unwrap();

        gmm.map_to_guest(host, GuestAddr(0x40_0000), Pages(4), Protection::READ)
            .unwrap();

        let ops = mapper.ops();
        assert_eq!(
            ops,
            vec![
                MapOp::Unmap {
                    guest_addr: GuestAddr(0x40_0000),
                    size: 4 * PAGE_SIZE,
                },
                MapOp::Map {
                    slice: 0,
                    offset: SLICE - 2 * PAGE_SIZE as usize,
                    size: 2 * PAGE_SIZE as usize,
                    guest_addr: GuestAddr(0x40_0000),
                    prot: Protection::READ,
                },
                MapOp::Map {
                    slice: 1,
                    offset: 0,
                    size: 2 * PAGE_SIZE as usize,
                    guest_addr: GuestAddr(0x40_2000),
                    prot: Protection::READ,
                },
            ]
        );
        assert_eq!(mapper.translate(GuestAddr(0x40_3000)).unwrap().host, host.offset(3 * PAGE_SIZE));
    }

    #[test]
    fn test_map_none_only_unmaps() {
        let (mut gmm, mapper) = gmm();
        let host = gmm.alloc(Pages(2)).unwrap();
        gmm.map_to_guest(host, GuestAddr(0x1000), Pages(2), Protection::READ | Protection::WRITE)
            .unwrap();
        assert_eq!(mapper.mapped_pages(), 2);

        gmm.map_to_guest(host, GuestAddr(0x1000), Pages(2), Protection::NONE)
            .unwrap();

        assert_eq!(mapper.mapped_pages(), 0);
        assert_eq!(
            mapper.ops().last(),
            Some(&MapOp::Unmap {
                guest_addr: GuestAddr(0x1000),
                size: 2 * PAGE_SIZE,
            })
        );
    }

    #[test]
    fn test_map_unbacked_host_range() {
        let (mut gmm, _) = gmm();
        gmm.alloc(Pages(1)).unwrap();

        let beyond = gmm.base().offset(SLICE as u64);
        let err = gmm
            .map_to_guest(beyond, GuestAddr(0), Pages(1), Protection::READ)
            .unwrap_err();
        assert!(err.is_out_of_range());
    }

    #[test]
    fn test_read_write() {
        let (mut gmm, _) = gmm();
        let addr = gmm.alloc(Pages(1)).unwrap();

        gmm.write(addr.offset(8), &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        gmm.read(addr.offset(8), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        assert!(gmm.write(gmm.base().offset(SLICE as u64), &buf).is_err());
    }

    #[test]
    fn test_read_write_across_slices() {
        let (mut gmm, _) = gmm();
        gmm.alloc(Pages(SLICE_PAGES + 1)).unwrap();

        let boundary = gmm.base().offset(SLICE as u64);
        let data = [0xa5u8; 16];
        gmm.write(VmmAddr(boundary.0 - 8), &data).unwrap();

        let mut buf = [0u8; 16];
        gmm.read(VmmAddr(boundary.0 - 8), &mut buf).unwrap();
        assert_eq!(buf, data);

        let mut tail = [0u8; 8];
        gmm.slice(1).unwrap().read(0, &mut tail).unwrap();
        assert_eq!(tail, [0xa5u8; 8]);
    }

    #[test]
    fn test_write_past_backed_region_writes_nothing() {
        let (mut gmm, _) = gmm();
        gmm.alloc(Pages(1)).unwrap();

        let boundary = gmm.base().offset(SLICE as u64);
        let err = gmm.write(VmmAddr(boundary.0 - 4), &[1u8; 8]).unwrap_err();
        assert!(err.is_out_of_range());

        let mut buf = [0xffu8; 4];
        gmm.read(VmmAddr(boundary.0 - 4), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn test_map_oversized_range_fails() {
        let (mut gmm, mapper) = gmm();
        let host = gmm.alloc(Pages(1)).unwrap();

        let err = gmm
            .map_to_guest(host, GuestAddr(0), Pages(1 << 52), Protection::READ)
            .unwrap_err();
        assert!(err.is_out_of_range());
        let err = gmm
            .map_to_guest(host, GuestAddr(u64::MAX - PAGE_SIZE + 1), Pages(2), Protection::READ)
            .unwrap_err();
        assert!(err.is_out_of_range());
        assert!(mapper.ops().is_empty());
    }

    #[test]
    fn test_map_invalid_host_keeps_guest_mapping() {
        let (mut gmm, mapper) = gmm();
        let host = gmm.alloc(Pages(1)).unwrap();
        gmm.map_to_guest(host, GuestAddr(0x1000), Pages(1), Protection::READ)
            .unwrap();
        mapper.clear_ops();

        let unbacked = gmm.base().offset(SLICE as u64);
        let err = gmm
            .map_to_guest(unbacked, GuestAddr(0x1000), Pages(1), Protection::WRITE)
            .unwrap_err();

        assert!(err.is_out_of_range());
        assert!(mapper.ops().is_empty());
        assert_eq!(mapper.translate(GuestAddr(0x1000)).unwrap().host, host);
    }

    #[test]
    fn test_alloc_huge_count_is_out_of_range() {
        let (mut gmm, _) = gmm();
        gmm.alloc(Pages(1)).unwrap();

        assert!(gmm.alloc(Pages(u64::MAX)).unwrap_err().is_out_of_range());
        assert_eq!(gmm.reserved_pages(), 1);
    }

    #[test]
    fn test_default_pool_scenario() {
        let mapper = Arc::new(SimMemoryMap::new());
        let mut gmm = Gmm::new(GmmConfig::default(), mapper.clone()).unwrap();

        let host = gmm.alloc(Pages(4)).unwrap();
        let slice = gmm.slice(0).unwrap();
        assert!(slice.contains(host));
        assert!(slice.contains(host.offset(4 * PAGE_SIZE - 1)));
        assert_eq!(gmm.slice_count(), 1);

        gmm.map_to_guest(host, GuestAddr(0x10_0000), Pages(4), Protection::READ | Protection::WRITE)
            .unwrap();
        let mapping = mapper.translate(GuestAddr(0x10_0000)).unwrap();
        assert_eq!(mapping.host, host);
        assert!(!mapping.prot.contains(Protection::EXECUTE));
        assert!(mapping.prot.contains(Protection::WRITE));

        let id = gmm.page_id(host).unwrap();
        assert_eq!(gmm.vmm_addr(id).unwrap(), host);
    }
}
