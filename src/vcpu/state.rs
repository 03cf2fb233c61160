//! Portable vCPU register state.
//!
//! Registers are grouped the same way the transfer mask groups them. Every
//! group is wrapped in [`Charged`], which records whether the group holds a
//! value that must be transferred. Only charged groups ever reach the
//! hypervisor.

use crate::backend::{DescriptorTable, FpuState, Mtd, Segment};
use crate::vcpu::ExitReason;

/// A register group that is either charged with a value or empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charged<T>(Option<T>);

impl<T> Default for Charged<T> {
    fn default() -> Self {
        Charged(None)
    }
}

impl<T> Charged<T> {
    /// Set the value and mark it for transfer.
    pub fn charge(&mut self, value: T) {
        self.0 = Some(value);
    }

    /// Drop the value so it is not transferred.
    pub fn discharge(&mut self) {
        self.0 = None;
    }

    pub fn is_charged(&self) -> bool {
        self.0.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.0.as_ref()
    }

    /// Mutable access to a charged value. Empty groups stay empty.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.0.as_mut()
    }

    pub fn take(&mut self) -> Option<T> {
        self.0.take()
    }
}

impl<T: Default> Charged<T> {
    /// Charge the group (with a default value if it was empty) and update it.
    pub fn update(&mut self, f: impl FnOnce(&mut T)) {
        f(self.0.get_or_insert_with(T::default));
    }
}

impl<T> From<Option<T>> for Charged<T> {
    fn from(value: Option<T>) -> Self {
        Charged(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Acdb {
    pub ax: u64,
    pub cx: u64,
    pub dx: u64,
    pub bx: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BpSiDi {
    pub bp: u64,
    pub si: u64,
    pub di: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionPointer {
    pub ip: u64,
    /// Length of the instruction that caused the exit.
    pub len: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentPair {
    pub first: Segment,
    pub second: Segment,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sysenter {
    pub cs: u64,
    pub sp: u64,
    pub ip: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Qualification {
    pub primary: u64,
    pub secondary: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecControls {
    pub primary: u32,
    pub secondary: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Injection {
    pub info: u32,
    pub error: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub intr_state: u32,
    pub actv_state: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tsc {
    pub value: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Syscall {
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tpr {
    pub tpr: u32,
    pub threshold: u32,
}

macro_rules! register_groups {
    ($($(#[$doc:meta])* $field:ident: $ty:ty => $bit:ident,)*) => {
        /// Register state of one vCPU, as seen by exit handlers.
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct VcpuState {
            /// Reason of the most recent exit. Always transferred.
            pub exit_reason: ExitReason,
            $($(#[$doc])* pub $field: Charged<$ty>,)*
        }

        impl VcpuState {
            /// Discharge every register group.
            pub fn discharge(&mut self) {
                $(self.$field.discharge();)*
            }

            /// Mask of the groups currently charged.
            pub fn charged(&self) -> Mtd {
                let mut mtd = Mtd::empty();
                $(
                    if self.$field.is_charged() {
                        mtd |= Mtd::$bit;
                    }
                )*
                mtd
            }
        }
    };
}

register_groups! {
    acdb: Acdb => ACDB,
    bp_si_di: BpSiDi => EBSD,
    sp: u64 => ESP,
    ip: InstructionPointer => EIP,
    flags: u64 => EFL,
    /// es and ds
    es_ds: SegmentPair => ESDS,
    /// fs and gs
    fs_gs: SegmentPair => FSGS,
    /// cs and ss
    cs_ss: SegmentPair => CSSS,
    tr: Segment => TR,
    ldtr: Segment => LDTR,
    gdtr: DescriptorTable => GDTR,
    idtr: DescriptorTable => IDTR,
    cr: ControlRegisters => CR,
    dr7: u64 => DR,
    sysenter: Sysenter => SYSENTER,
    qual: Qualification => QUAL,
    ctrl: ExecControls => CTRL,
    inj: Injection => INJ,
    activity: Activity => STA,
    tsc: Tsc => TSC,
    efer: u64 => EFER,
    pdpte: [u64; 4] => PDPTE,
    r8_r15: [u64; 8] => R8_R15,
    syscall: Syscall => SYSCALL_SWAPGS,
    tpr: Tpr => TPR,
    fpu: FpuState => FPU,
}
