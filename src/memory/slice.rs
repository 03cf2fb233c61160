//! The VMM's linear map of guest RAM and the slices it is backed with.

use crate::error::{Error, Result};

use super::VmmAddr;

/// A reserved range of VMM address space that guest RAM grows into.
///
/// The whole range is reserved inaccessible up front so its base never
/// moves; slices are made accessible in place as the pool grows.
pub struct LinearMap {
    /// Base of the reservation
    ptr: *mut u8,
    /// Size of the reservation in bytes
    size: usize,
}

// Safety: LinearMap owns its reservation and can be sent between threads
unsafe impl Send for LinearMap {}
unsafe impl Sync for LinearMap {}

impl std::fmt::Debug for LinearMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearMap")
            .field("base", &self.base())
            .field("size", &self.size)
            .finish()
    }
}

impl LinearMap {
    /// Reserve `size` bytes of address space without committing memory.
    pub fn reserve(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".to_string()));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::AllocationFailed(format!(
                "reserving linear map of {size:#x} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub fn base(&self) -> VmmAddr {
        VmmAddr(self.ptr as u64)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Make `[offset, offset + size)` of the map accessible, zero-filled.
    pub fn attach(&mut self, index: usize, offset: usize, size: usize) -> Result<Slice> {
        if offset.checked_add(size).map_or(true, |end| end > self.size) {
            return Err(Error::OutOfRange(self.base().0 + offset as u64));
        }

        // Safety: the range lies within our own reservation
        let ptr = unsafe {
            libc::mmap(
                self.ptr.add(offset) as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::AllocationFailed(format!(
                "attaching slice {index} failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Slice {
            index,
            ptr: ptr as *mut u8,
            size,
        })
    }
}

impl Drop for LinearMap {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

/// One accessible piece of the linear map.
///
/// The memory belongs to the [`LinearMap`] the slice was attached to.
#[derive(Debug)]
pub struct Slice {
    index: usize,
    ptr: *mut u8,
    size: usize,
}

// Safety: the backing memory lives as long as the owning pool
unsafe impl Send for Slice {}
unsafe impl Sync for Slice {}

impl Slice {
    /// Position of the slice in the linear map.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn base(&self) -> VmmAddr {
        VmmAddr(self.ptr as u64)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: VmmAddr) -> bool {
        addr >= self.base() && addr.0 < self.base().0 + self.size as u64
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Read bytes at `offset` within the slice.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() > self.size {
            return Err(Error::OutOfRange(self.base().0 + (offset + buf.len()) as u64));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }

        Ok(())
    }

    /// Write bytes at `offset` within the slice.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.size {
            return Err(Error::OutOfRange(self.base().0 + (offset + data.len()) as u64));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }

        Ok(())
    }
}
