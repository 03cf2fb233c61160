//! VM builder for configuring and creating VMs.

use std::sync::Arc;

use crate::backend::sim::SimHypervisor;
use crate::backend::{GuestMemoryMap, Hypervisor};
use crate::error::Result;
use crate::memory::{Gmm, GmmConfig};
use crate::vm::Vm;

/// Builder for creating a [`Vm`].
///
/// # Example
///
/// ```rust,no_run
/// use vmexec::Vm;
///
/// let vm = Vm::builder()
///     .slice_size(128 << 20)
///     .linear_map_size(32 << 30)
///     .build()?;
/// # Ok::<(), vmexec::Error>(())
/// ```
#[derive(Default)]
pub struct VmBuilder {
    hypervisor: Option<Arc<dyn Hypervisor>>,
    memory_map: Option<Arc<dyn GuestMemoryMap>>,
    slice_size: Option<usize>,
    linear_map_size: Option<usize>,
}

impl VmBuilder {
    /// Create a new VM builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hypervisor vCPUs run on.
    ///
    /// Default: a new in-process simulated hypervisor
    pub fn hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }

    /// Set the mapper that installs guest RAM into guest-physical space.
    ///
    /// Default: the guest memory map of the hypervisor
    pub fn memory_map(mut self, memory_map: Arc<dyn GuestMemoryMap>) -> Self {
        self.memory_map = Some(memory_map);
        self
    }

    /// Set how much backing memory is added per growth step, in bytes.
    ///
    /// Default: 128 MiB
    pub fn slice_size(mut self, bytes: usize) -> Self {
        self.slice_size = Some(bytes);
        self
    }

    /// Set the upper bound of guest RAM, in bytes.
    ///
    /// Default: 32 GiB
    pub fn linear_map_size(mut self, bytes: usize) -> Self {
        self.linear_map_size = Some(bytes);
        self
    }

    /// Build the VM.
    ///
    /// This validates the memory configuration and reserves the linear map.
    pub fn build(self) -> Result<Vm> {
        let defaults = GmmConfig::default();
        let config = GmmConfig {
            slice_size: self.slice_size.unwrap_or(defaults.slice_size),
            linear_map_size: self.linear_map_size.unwrap_or(defaults.linear_map_size),
        };
        config.validate()?;

        let hypervisor: Arc<dyn Hypervisor> = self
            .hypervisor
            .unwrap_or_else(|| Arc::new(SimHypervisor::new()));
        let memory_map = self
            .memory_map
            .unwrap_or_else(|| hypervisor.guest_memory_map());

        let gmm = Gmm::new(config, memory_map)?;
        tracing::info!(
            backend = hypervisor.name(),
            slice_size = config.slice_size,
            linear_map_size = config.linear_map_size,
            "VM created"
        );

        Ok(Vm::new(hypervisor, gmm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::{GuestAddr, Pages, Protection, DEFAULT_SLICE_SIZE};

    #[test]
    fn test_defaults() {
        let vm = VmBuilder::new().build().unwrap();
        let gmm = vm.gmm().lock();

        assert_eq!(*gmm.config(), GmmConfig::default());
        assert_eq!(gmm.slice_count(), 0);
        assert_eq!(vm.hypervisor().name(), "sim");
    }

    #[test]
    fn test_hypervisor_memory_map_is_default() {
        let sim = Arc::new(SimHypervisor::new());
        let vm = VmBuilder::new()
            .hypervisor(sim.clone())
            .slice_size(64 << 10)
            .linear_map_size(128 << 10)
            .build()
            .unwrap();

        let host = vm.alloc(Pages(2)).unwrap();
        vm.gmm()
            .lock()
            .map_to_guest(host, GuestAddr(0x2000), Pages(2), Protection::READ)
            .unwrap();

        assert_eq!(sim.memory_map().mapped_pages(), 2);
        assert_eq!(sim.memory_map().translate(GuestAddr(0x3000)).unwrap().host, host.offset(4096));
    }

    #[test]
    fn test_invalid_sizes() {
        let err = VmBuilder::new().slice_size(0).build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = VmBuilder::new()
            .slice_size(DEFAULT_SLICE_SIZE)
            .linear_map_size(DEFAULT_SLICE_SIZE + 4096)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_custom_sizes() {
        let vm = VmBuilder::new()
            .slice_size(64 << 10)
            .linear_map_size(128 << 10)
            .build()
            .unwrap();

        vm.alloc(Pages(32)).unwrap();
        assert!(vm.alloc(Pages(1)).unwrap_err().is_out_of_range());
    }
}
