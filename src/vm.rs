//! VM facade: owns the vCPUs, the memory pool and the range coalescer.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::Hypervisor;
use crate::error::{Error, Result};
use crate::memory::{Gmm, GuestAddr, Nem, Pages, Protection, VmmAddr};
use crate::vcpu::{CpuState, ExitHandler, Vcpu, VcpuId, VcpuRegistry};

/// A virtual machine.
///
/// Use [`Vm::builder()`] to create one.
///
/// # Example
///
/// ```rust,no_run
/// use vmexec::Vm;
///
/// let vm = Vm::builder()
///     .slice_size(64 << 20)
///     .build()?;
/// # Ok::<(), vmexec::Error>(())
/// ```
pub struct Vm {
    hypervisor: Arc<dyn Hypervisor>,
    registry: Arc<VcpuRegistry>,
    /// Owning arena of the vCPUs; the registry only holds weak references.
    vcpus: Mutex<Vec<Arc<Vcpu>>>,
    gmm: Arc<Mutex<Gmm>>,
    nem: Mutex<Nem>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("backend", &self.hypervisor.name())
            .field("vcpus", &self.vcpu_count())
            .field("gmm", &self.gmm)
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Create a new VM builder.
    pub fn builder() -> crate::builder::VmBuilder {
        crate::builder::VmBuilder::new()
    }

    pub(crate) fn new(hypervisor: Arc<dyn Hypervisor>, gmm: Gmm) -> Self {
        let gmm = Arc::new(Mutex::new(gmm));
        Self {
            hypervisor,
            registry: Arc::new(VcpuRegistry::new()),
            vcpus: Mutex::new(Vec::new()),
            nem: Mutex::new(Nem::new(gmm.clone())),
            gmm,
        }
    }

    /// Create a vCPU whose exits go to `handler`. It starts running right
    /// away with a startup exit.
    pub fn create_vcpu(&self, handler: Arc<dyn ExitHandler>) -> Result<VcpuId> {
        let vcpu = Vcpu::create(self.hypervisor.clone(), &self.registry, handler)?;
        let id = vcpu.id();
        self.vcpus.lock().push(vcpu);
        Ok(id)
    }

    pub fn vcpu(&self, id: VcpuId) -> Option<Arc<Vcpu>> {
        self.registry.get(id)
    }

    fn lookup(&self, id: VcpuId) -> Result<Arc<Vcpu>> {
        self.vcpu(id).ok_or(Error::UnknownVcpu(id))
    }

    /// Resume a vCPU.
    pub fn run(&self, id: VcpuId) -> Result<()> {
        self.lookup(id)?.run();
        Ok(())
    }

    /// Pause a vCPU.
    pub fn pause(&self, id: VcpuId) -> Result<()> {
        self.lookup(id)?.pause();
        Ok(())
    }

    /// Register state of a vCPU.
    pub fn cpu_state(&self, id: VcpuId) -> Result<CpuState> {
        Ok(self.lookup(id)?.cpu_state())
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.lock().len()
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn registry(&self) -> &Arc<VcpuRegistry> {
        &self.registry
    }

    pub fn gmm(&self) -> &Arc<Mutex<Gmm>> {
        &self.gmm
    }

    /// Allocate guest RAM from the pool.
    pub fn alloc(&self, pages: Pages) -> Result<VmmAddr> {
        self.gmm.lock().alloc(pages)
    }

    /// Announce one page of the guest-physical layout.
    pub fn notify_page(&self, host: VmmAddr, guest: GuestAddr, prot: Protection) -> Result<()> {
        self.nem.lock().notify_page(host, guest, prot)
    }

    /// Announce a run of pages of the guest-physical layout.
    pub fn notify_range(&self, host: VmmAddr, guest: GuestAddr, pages: Pages, prot: Protection) -> Result<()> {
        self.nem.lock().notify_range(host, guest, pages, prot)
    }

    /// Flush announced layout changes to the hypervisor.
    pub fn commit_mappings(&self) -> Result<()> {
        self.nem.lock().commit()
    }

    /// Destroy every vCPU. Returns the first teardown error.
    pub fn shutdown(&self) -> Result<()> {
        let vcpus = std::mem::take(&mut *self.vcpus.lock());
        let mut result = Ok(());

        for vcpu in vcpus {
            if let Err(e) = vcpu.destroy(&self.registry) {
                tracing::warn!(vcpu = %vcpu.id(), "teardown failed: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
