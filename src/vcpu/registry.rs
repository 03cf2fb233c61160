//! Lookup table from vCPU id to live vCPU.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::backend::ExitBuffer;
use crate::error::Result;
use crate::vcpu::{Badge, Vcpu, VcpuId};

/// Non-owning table of the vCPUs of one VM, indexed by [`VcpuId`].
///
/// The VM owns its vCPUs; the registry only resolves badges delivered by the
/// hypervisor. Registration and removal happen at VM lifecycle boundaries.
#[derive(Debug, Default)]
pub struct VcpuRegistry {
    slots: RwLock<Vec<Option<Weak<Vcpu>>>>,
}

impl VcpuRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next vCPU id.
    pub(crate) fn next_id(&self) -> VcpuId {
        let mut slots = self.slots.write();
        slots.push(None);
        VcpuId((slots.len() - 1) as u32)
    }

    pub(crate) fn register(&self, vcpu: &Arc<Vcpu>) {
        let index = vcpu.id().index();
        let mut slots = self.slots.write();
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        slots[index] = Some(Arc::downgrade(vcpu));
    }

    pub(crate) fn unregister(&self, id: VcpuId) {
        if let Some(slot) = self.slots.write().get_mut(id.index()) {
            *slot = None;
        }
    }

    /// Resolve a vCPU id.
    pub fn get(&self, id: VcpuId) -> Option<Arc<Vcpu>> {
        self.slots
            .read()
            .get(id.index())
            .and_then(|slot| slot.as_ref())
            .and_then(Weak::upgrade)
    }

    /// Number of registered vCPUs.
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Portal entry: route a delivered exit to its vCPU.
    ///
    /// Exits carrying a badge of an unknown or destroyed vCPU are answered
    /// without any state transfer.
    pub fn dispatch(&self, badge: Badge, buf: &mut ExitBuffer) -> Result<()> {
        match self.get(badge.vcpu_id()) {
            Some(vcpu) => vcpu.handle_exit(buf),
            None => {
                tracing::warn!(
                    vcpu = %badge.vcpu_id(),
                    reason = %badge.exit_reason(),
                    "exit for unknown vCPU, replying without state"
                );
                buf.clear_transfer();
                Ok(())
            }
        }
    }
}
