//! Hypervisor-native exit buffer layout.
//!
//! The exit buffer is what the hypervisor hands to an exit portal and reads
//! back on reply. Only the register groups named in [`ExitBuffer::mtd`] carry
//! meaningful values; everything else is left untouched on both sides.

use bitflags::bitflags;

bitflags! {
    /// Message transfer descriptor: one bit per register group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Mtd: u32 {
        /// rax, rcx, rdx, rbx
        const ACDB = 1 << 0;
        /// rbp, rsi, rdi
        const EBSD = 1 << 1;
        const ESP = 1 << 2;
        /// Instruction pointer and instruction length.
        const EIP = 1 << 3;
        const EFL = 1 << 4;
        const ESDS = 1 << 5;
        const FSGS = 1 << 6;
        const CSSS = 1 << 7;
        const TR = 1 << 8;
        const LDTR = 1 << 9;
        const GDTR = 1 << 10;
        const IDTR = 1 << 11;
        const CR = 1 << 12;
        const DR = 1 << 13;
        const SYSENTER = 1 << 14;
        /// Exit qualification.
        const QUAL = 1 << 15;
        /// Primary and secondary execution controls.
        const CTRL = 1 << 16;
        /// Event injection.
        const INJ = 1 << 17;
        /// Interruptibility and activity state.
        const STA = 1 << 18;
        const TSC = 1 << 19;
        const EFER = 1 << 20;
        const PDPTE = 1 << 21;
        const R8_R15 = 1 << 22;
        const SYSCALL_SWAPGS = 1 << 23;
        const TPR = 1 << 24;
        /// Floating point state. Not part of the buffer itself.
        const FPU = 1 << 31;
    }
}

impl Mtd {
    /// Every register group.
    pub const ALL: Mtd = Mtd::all();
}

/// A segment register with its hidden descriptor part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub sel: u16,
    pub ar: u16,
    pub limit: u32,
    pub base: u64,
}

impl Segment {
    pub const fn new(sel: u16, ar: u16, limit: u32, base: u64) -> Self {
        Self {
            sel,
            ar,
            limit,
            base,
        }
    }
}

/// GDTR/IDTR contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub limit: u32,
    pub base: u64,
}

/// FXSAVE image of the floating point unit.
#[repr(C, align(16))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FpuState {
    pub bytes: [u8; 512],
}

impl Default for FpuState {
    fn default() -> Self {
        Self { bytes: [0; 512] }
    }
}

impl std::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // fcw, fsw and mxcsr are enough to tell two images apart in logs
        f.debug_struct("FpuState")
            .field("fcw", &u16::from_le_bytes([self.bytes[0], self.bytes[1]]))
            .field("fsw", &u16::from_le_bytes([self.bytes[2], self.bytes[3]]))
            .field(
                "mxcsr",
                &u32::from_le_bytes([self.bytes[24], self.bytes[25], self.bytes[26], self.bytes[27]]),
            )
            .finish_non_exhaustive()
    }
}

/// The per-exit message buffer exchanged with the hypervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitBuffer {
    /// Groups that carry valid state, on delivery and on reply.
    pub mtd: Mtd,
    pub exit_reason: u32,

    pub ax: u64,
    pub cx: u64,
    pub dx: u64,
    pub bx: u64,
    pub bp: u64,
    pub si: u64,
    pub di: u64,
    pub sp: u64,
    pub ip: u64,
    pub ip_len: u64,
    pub flags: u64,

    pub es: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldtr: Segment,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,

    pub sysenter_cs: u64,
    pub sysenter_sp: u64,
    pub sysenter_ip: u64,

    pub qual: [u64; 2],
    pub ctrl: [u32; 2],
    pub inj_info: u32,
    pub inj_error: u32,
    pub intr_state: u32,
    pub actv_state: u32,

    pub tsc_val: u64,
    pub tsc_off: u64,
    pub efer: u64,
    pub pdpte: [u64; 4],
    pub r8_r15: [u64; 8],

    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,

    pub tpr: u32,
    pub tpr_threshold: u32,
}

impl ExitBuffer {
    /// A buffer for `exit_reason` with nothing marked valid.
    pub fn for_exit(exit_reason: u32) -> Self {
        Self {
            exit_reason,
            ..Default::default()
        }
    }

    /// Reply without any state transfer.
    pub fn clear_transfer(&mut self) {
        self.mtd = Mtd::empty();
    }

    /// Copy the register groups selected by `mask` from `src`.
    ///
    /// This is the hypervisor side of a transfer: filling a buffer from the
    /// vCPU's register file on exit, and applying a reply back to it.
    pub fn copy_groups(&mut self, src: &ExitBuffer, mask: Mtd) {
        if mask.contains(Mtd::ACDB) {
            self.ax = src.ax;
            self.cx = src.cx;
            self.dx = src.dx;
            self.bx = src.bx;
        }
        if mask.contains(Mtd::EBSD) {
            self.bp = src.bp;
            self.si = src.si;
            self.di = src.di;
        }
        if mask.contains(Mtd::ESP) {
            self.sp = src.sp;
        }
        if mask.contains(Mtd::EIP) {
            self.ip = src.ip;
            self.ip_len = src.ip_len;
        }
        if mask.contains(Mtd::EFL) {
            self.flags = src.flags;
        }
        if mask.contains(Mtd::ESDS) {
            self.es = src.es;
            self.ds = src.ds;
        }
        if mask.contains(Mtd::FSGS) {
            self.fs = src.fs;
            self.gs = src.gs;
        }
        if mask.contains(Mtd::CSSS) {
            self.cs = src.cs;
            self.ss = src.ss;
        }
        if mask.contains(Mtd::TR) {
            self.tr = src.tr;
        }
        if mask.contains(Mtd::LDTR) {
            self.ldtr = src.ldtr;
        }
        if mask.contains(Mtd::GDTR) {
            self.gdtr = src.gdtr;
        }
        if mask.contains(Mtd::IDTR) {
            self.idtr = src.idtr;
        }
        if mask.contains(Mtd::CR) {
            self.cr0 = src.cr0;
            self.cr2 = src.cr2;
            self.cr3 = src.cr3;
            self.cr4 = src.cr4;
        }
        if mask.contains(Mtd::DR) {
            self.dr7 = src.dr7;
        }
        if mask.contains(Mtd::SYSENTER) {
            self.sysenter_cs = src.sysenter_cs;
            self.sysenter_sp = src.sysenter_sp;
            self.sysenter_ip = src.sysenter_ip;
        }
        if mask.contains(Mtd::QUAL) {
            self.qual = src.qual;
        }
        if mask.contains(Mtd::CTRL) {
            self.ctrl = src.ctrl;
        }
        if mask.contains(Mtd::INJ) {
            self.inj_info = src.inj_info;
            self.inj_error = src.inj_error;
        }
        if mask.contains(Mtd::STA) {
            self.intr_state = src.intr_state;
            self.actv_state = src.actv_state;
        }
        if mask.contains(Mtd::TSC) {
            self.tsc_val = src.tsc_val;
            self.tsc_off = src.tsc_off;
        }
        if mask.contains(Mtd::EFER) {
            self.efer = src.efer;
        }
        if mask.contains(Mtd::PDPTE) {
            self.pdpte = src.pdpte;
        }
        if mask.contains(Mtd::R8_R15) {
            self.r8_r15 = src.r8_r15;
        }
        if mask.contains(Mtd::SYSCALL_SWAPGS) {
            self.star = src.star;
            self.lstar = src.lstar;
            self.cstar = src.cstar;
            self.fmask = src.fmask;
            self.kernel_gs_base = src.kernel_gs_base;
        }
        if mask.contains(Mtd::TPR) {
            self.tpr = src.tpr;
            self.tpr_threshold = src.tpr_threshold;
        }
    }
}
