//! In-process software hypervisor.
//!
//! Every vCPU gets a dispatch thread that plays the part of the hypervisor:
//! it delivers a startup exit, then whatever exits are injected, and forces
//! a recall exit whenever one is requested. The register file of the guest
//! lives in the simulated vCPU and is filled into and updated from the exit
//! buffer by the portal's transfer mask, the same way hardware-assisted
//! backends exchange state with their exit handlers.

mod memory;
mod vcpu;

pub use memory::{GuestMapping, MapOp, SimMemoryMap};
pub use vcpu::{ExitRecord, SimFpu};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::{ExitBuffer, Fpu, GuestMemoryMap, Hypervisor, Mtd, Portal, PortalSlot};
use crate::error::{Error, Result};
use crate::vcpu::{ExitReason, VcpuId};

use vcpu::SimVcpu;

/// Backend name.
pub const NAME: &str = "sim";

/// The simulated hypervisor.
#[derive(Debug)]
pub struct SimHypervisor {
    vcpus: Mutex<HashMap<VcpuId, Arc<SimVcpu>>>,
    fpu: SimFpu,
    memory: Arc<SimMemoryMap>,
    deferred_start: bool,
}

impl Default for SimHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHypervisor {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A hypervisor whose vCPUs only start running on [`SimHypervisor::launch`].
    pub fn with_deferred_start() -> Self {
        Self::build(true)
    }

    fn build(deferred_start: bool) -> Self {
        Self {
            vcpus: Mutex::new(HashMap::new()),
            fpu: SimFpu,
            memory: Arc::new(SimMemoryMap::new()),
            deferred_start,
        }
    }

    /// Guest-physical address space shared by all vCPUs.
    pub fn memory_map(&self) -> Arc<SimMemoryMap> {
        self.memory.clone()
    }

    fn vcpu(&self, id: VcpuId) -> Result<Arc<SimVcpu>> {
        self.vcpus
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::hypervisor(format!("no execution context for vCPU {id}")))
    }

    /// Start the dispatch thread of a vCPU created with deferred start.
    pub fn launch(&self, id: VcpuId) -> Result<()> {
        self.vcpu(id)?.spawn()
    }

    /// Queue an exit for delivery.
    pub fn inject_exit(&self, id: VcpuId, reason: ExitReason) -> Result<()> {
        self.vcpu(id)?.inject(reason);
        Ok(())
    }

    /// Access the guest's architectural registers.
    pub fn with_registers<R>(&self, id: VcpuId, f: impl FnOnce(&mut ExitBuffer) -> R) -> Result<R> {
        let vcpu = self.vcpu(id)?;
        let mut registers = vcpu.registers();
        Ok(f(&mut registers))
    }

    /// Transfer mask of an installed portal.
    pub fn portal_mtd(&self, id: VcpuId, slot: PortalSlot) -> Option<Mtd> {
        self.vcpu(id).ok()?.portal_mtd(slot)
    }

    /// Whether a recall is waiting to be delivered.
    pub fn recall_pending(&self, id: VcpuId) -> bool {
        self.vcpu(id).map(|vcpu| vcpu.recall_pending()).unwrap_or(false)
    }

    /// Exits delivered so far, oldest first.
    pub fn exits(&self, id: VcpuId) -> Vec<ExitRecord> {
        self.vcpu(id).map(|vcpu| vcpu.exits()).unwrap_or_default()
    }

    /// Wait until `count` exits have been delivered.
    pub fn wait_for_exits(&self, id: VcpuId, count: usize, timeout: Duration) -> bool {
        self.vcpu(id)
            .map(|vcpu| vcpu.wait_for_exits(count, Instant::now() + timeout))
            .unwrap_or(false)
    }

    /// Wait until `count` exits have been answered.
    pub fn wait_for_replies(&self, id: VcpuId, count: usize, timeout: Duration) -> bool {
        self.vcpu(id)
            .map(|vcpu| vcpu.wait_for_replies(count, Instant::now() + timeout))
            .unwrap_or(false)
    }

    /// Wait for the dispatch thread to end and take its result.
    pub fn wait_stopped(&self, id: VcpuId, timeout: Duration) -> Option<Result<()>> {
        self.vcpu(id).ok()?.wait_stopped(Instant::now() + timeout)
    }
}

impl Hypervisor for SimHypervisor {
    fn install_portal(&self, vcpu: VcpuId, slot: PortalSlot, portal: Portal) -> Result<()> {
        let sim = self
            .vcpus
            .lock()
            .entry(vcpu)
            .or_insert_with(|| Arc::new(SimVcpu::new(vcpu)))
            .clone();
        sim.install(slot, portal);
        Ok(())
    }

    fn start_vcpu(&self, vcpu: VcpuId) -> Result<()> {
        let sim = self.vcpu(vcpu)?;
        if self.deferred_start {
            tracing::debug!(vcpu = %vcpu, "start deferred");
            return Ok(());
        }
        sim.spawn()
    }

    fn recall(&self, vcpu: VcpuId) {
        match self.vcpu(vcpu) {
            Ok(sim) => sim.recall(),
            Err(e) => tracing::warn!(vcpu = %vcpu, "recall ignored: {e}"),
        }
    }

    fn destroy_vcpu(&self, vcpu: VcpuId) -> Result<()> {
        let sim = self.vcpu(vcpu)?;
        sim.stop();

        let Some(handle) = sim.take_thread() else {
            return Ok(());
        };
        if handle.thread().id() == std::thread::current().id() {
            // torn down from its own exit handler; the loop ends on return
            return Ok(());
        }
        handle
            .join()
            .map_err(|_| Error::hypervisor(format!("dispatch thread of vCPU {vcpu} panicked")))
    }

    fn fpu(&self) -> &dyn Fpu {
        &self.fpu
    }

    fn guest_memory_map(&self) -> Arc<dyn GuestMemoryMap> {
        self.memory.clone()
    }

    fn name(&self) -> &'static str {
        NAME
    }
}

impl Drop for SimHypervisor {
    fn drop(&mut self) {
        for vcpu in self.vcpus.get_mut().values() {
            vcpu.stop();
        }
    }
}
