//! Hypervisor backend abstraction.
//!
//! This module defines the primitives the execution backend consumes from the
//! hypervisor: per-reason exit portals, recall, the dispatching thread's FPU
//! and guest-physical mapping. [`sim`] implements all of them in-process.

use std::sync::Arc;

use crate::error::Result;
use crate::memory::{GuestAddr, Protection, Slice};
use crate::vcpu::{Badge, ExitReason, VcpuId};

mod abi;
mod semaphore;
pub mod sim;

pub use abi::{DescriptorTable, ExitBuffer, FpuState, Mtd, Segment};
pub use semaphore::Semaphore;

/// Callback invoked by the hypervisor when an exit is delivered to a portal.
///
/// The entry reads the exit state from the buffer and leaves the reply in it.
pub type PortalEntry = Arc<dyn Fn(Badge, &mut ExitBuffer) -> Result<()> + Send + Sync>;

/// An exit portal: the transfer mask the hypervisor fills the buffer with,
/// and the entry it calls.
#[derive(Clone)]
pub struct Portal {
    pub mtd: Mtd,
    pub entry: PortalEntry,
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal").field("mtd", &self.mtd).finish_non_exhaustive()
    }
}

/// Where a portal is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortalSlot {
    /// The portal for one exit reason.
    Exit(ExitReason),
    /// The portal for every reason without a portal of its own.
    CatchAll,
}

/// Access to the dispatching thread's floating point context.
pub trait Fpu: Send + Sync {
    /// Save the current thread's FPU state into `image`.
    fn save(&self, image: &mut FpuState);

    /// Load `image` into the current thread's FPU.
    fn restore(&self, image: &FpuState);
}

/// Execution primitives a hypervisor provides for vCPUs.
pub trait Hypervisor: Send + Sync {
    /// Install an exit portal for `vcpu`.
    fn install_portal(&self, vcpu: VcpuId, slot: PortalSlot, portal: Portal) -> Result<()>;

    /// Start delivering exits for `vcpu`, beginning with a startup exit.
    fn start_vcpu(&self, vcpu: VcpuId) -> Result<()>;

    /// Force `vcpu` to take a recall exit.
    ///
    /// The recall exit must happen before the vCPU executes further guest
    /// instructions, including when it resumes after being blocked.
    fn recall(&self, vcpu: VcpuId);

    /// Tear down the execution context of `vcpu`.
    fn destroy_vcpu(&self, vcpu: VcpuId) -> Result<()>;

    /// FPU of the thread exits are dispatched on.
    fn fpu(&self) -> &dyn Fpu;

    /// Guest-physical address space of the VM this hypervisor runs.
    fn guest_memory_map(&self) -> Arc<dyn GuestMemoryMap>;

    /// Get the backend name (e.g., "sim").
    fn name(&self) -> &'static str;
}

/// Trait implemented by guest-physical memory mappers.
pub trait GuestMemoryMap: Send + Sync {
    /// Map `size` bytes at `offset` within `slice` to `guest_addr`.
    fn map_range(
        &self,
        slice: &Slice,
        offset: usize,
        size: usize,
        guest_addr: GuestAddr,
        prot: Protection,
    ) -> Result<()>;

    /// Revoke whatever is mapped in `[guest_addr, guest_addr + size)`.
    fn unmap_range(&self, guest_addr: GuestAddr, size: u64) -> Result<()>;
}

/// Check if a hypervisor backend is available on this platform.
pub fn is_available() -> bool {
    true
}

/// Get the name of the default backend.
pub fn name() -> Option<&'static str> {
    Some(sim::NAME)
}
