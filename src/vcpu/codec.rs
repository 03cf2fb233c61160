//! Register transfer between [`VcpuState`] and the hypervisor exit buffer.
//!
//! Decoding charges exactly the groups the buffer marks valid. Encoding writes
//! exactly the charged groups and publishes their union as the buffer's
//! validity mask. Groups that are absent on either side are skipped, never
//! reported.
//!
//! The FPU group is special: floating point state is not part of the exit
//! buffer but lives in the dispatching thread's FPU, so it is exchanged
//! through [`Fpu`] instead.

use crate::backend::{ExitBuffer, Fpu, FpuState, Mtd};
use crate::vcpu::state::{
    Acdb, Activity, BpSiDi, Charged, ControlRegisters, ExecControls, Injection,
    InstructionPointer, Qualification, SegmentPair, Syscall, Sysenter, Tpr, Tsc, VcpuState,
};
use crate::vcpu::ExitReason;

fn load<T>(valid: Mtd, bit: Mtd, group: &mut Charged<T>, read: impl FnOnce() -> T) {
    if valid.contains(bit) {
        group.charge(read());
    }
}

fn store<T>(group: &Charged<T>, bit: Mtd, written: &mut Mtd, write: impl FnOnce(&T)) {
    if let Some(value) = group.get() {
        write(value);
        *written |= bit;
    }
}

/// Fill `state` from `buf`.
///
/// `state` is discharged first, so afterwards exactly the groups valid in
/// `buf.mtd` are charged.
pub fn decode(buf: &ExitBuffer, fpu: &dyn Fpu, state: &mut VcpuState) {
    let valid = buf.mtd;

    state.discharge();
    state.exit_reason = ExitReason::from_raw(buf.exit_reason);

    load(valid, Mtd::ACDB, &mut state.acdb, || Acdb {
        ax: buf.ax,
        cx: buf.cx,
        dx: buf.dx,
        bx: buf.bx,
    });
    load(valid, Mtd::EBSD, &mut state.bp_si_di, || BpSiDi {
        bp: buf.bp,
        si: buf.si,
        di: buf.di,
    });
    load(valid, Mtd::ESP, &mut state.sp, || buf.sp);
    load(valid, Mtd::EIP, &mut state.ip, || InstructionPointer {
        ip: buf.ip,
        len: buf.ip_len,
    });
    load(valid, Mtd::EFL, &mut state.flags, || buf.flags);
    load(valid, Mtd::ESDS, &mut state.es_ds, || SegmentPair {
        first: buf.es,
        second: buf.ds,
    });
    load(valid, Mtd::FSGS, &mut state.fs_gs, || SegmentPair {
        first: buf.fs,
        second: buf.gs,
    });
    load(valid, Mtd::CSSS, &mut state.cs_ss, || SegmentPair {
        first: buf.cs,
        second: buf.ss,
    });
    load(valid, Mtd::TR, &mut state.tr, || buf.tr);
    load(valid, Mtd::LDTR, &mut state.ldtr, || buf.ldtr);
    load(valid, Mtd::GDTR, &mut state.gdtr, || buf.gdtr);
    load(valid, Mtd::IDTR, &mut state.idtr, || buf.idtr);
    load(valid, Mtd::CR, &mut state.cr, || ControlRegisters {
        cr0: buf.cr0,
        cr2: buf.cr2,
        cr3: buf.cr3,
        cr4: buf.cr4,
    });
    load(valid, Mtd::DR, &mut state.dr7, || buf.dr7);
    load(valid, Mtd::SYSENTER, &mut state.sysenter, || Sysenter {
        cs: buf.sysenter_cs,
        sp: buf.sysenter_sp,
        ip: buf.sysenter_ip,
    });
    load(valid, Mtd::QUAL, &mut state.qual, || Qualification {
        primary: buf.qual[0],
        secondary: buf.qual[1],
    });
    load(valid, Mtd::CTRL, &mut state.ctrl, || ExecControls {
        primary: buf.ctrl[0],
        secondary: buf.ctrl[1],
    });
    load(valid, Mtd::INJ, &mut state.inj, || Injection {
        info: buf.inj_info,
        error: buf.inj_error,
    });
    load(valid, Mtd::STA, &mut state.activity, || Activity {
        intr_state: buf.intr_state,
        actv_state: buf.actv_state,
    });
    load(valid, Mtd::TSC, &mut state.tsc, || Tsc {
        value: buf.tsc_val,
        offset: buf.tsc_off,
    });
    load(valid, Mtd::EFER, &mut state.efer, || buf.efer);
    load(valid, Mtd::PDPTE, &mut state.pdpte, || buf.pdpte);
    load(valid, Mtd::R8_R15, &mut state.r8_r15, || buf.r8_r15);
    load(valid, Mtd::SYSCALL_SWAPGS, &mut state.syscall, || Syscall {
        star: buf.star,
        lstar: buf.lstar,
        cstar: buf.cstar,
        fmask: buf.fmask,
        kernel_gs_base: buf.kernel_gs_base,
    });
    load(valid, Mtd::TPR, &mut state.tpr, || Tpr {
        tpr: buf.tpr,
        threshold: buf.tpr_threshold,
    });
    load(valid, Mtd::FPU, &mut state.fpu, || {
        let mut image = FpuState::default();
        fpu.save(&mut image);
        image
    });
}

/// Write the charged groups of `state` into `buf`.
///
/// `buf.mtd` is replaced by the union of the groups written.
pub fn encode(state: &VcpuState, buf: &mut ExitBuffer, fpu: &dyn Fpu) {
    let mut written = Mtd::empty();

    store(&state.acdb, Mtd::ACDB, &mut written, |v| {
        buf.ax = v.ax;
        buf.cx = v.cx;
        buf.dx = v.dx;
        buf.bx = v.bx;
    });
    store(&state.bp_si_di, Mtd::EBSD, &mut written, |v| {
        buf.bp = v.bp;
        buf.si = v.si;
        buf.di = v.di;
    });
    store(&state.sp, Mtd::ESP, &mut written, |v| buf.sp = *v);
    store(&state.ip, Mtd::EIP, &mut written, |v| {
        buf.ip = v.ip;
        buf.ip_len = v.len;
    });
    store(&state.flags, Mtd::EFL, &mut written, |v| buf.flags = *v);
    store(&state.es_ds, Mtd::ESDS, &mut written, |v| {
        buf.es = v.first;
        buf.ds = v.second;
    });
    store(&state.fs_gs, Mtd::FSGS, &mut written, |v| {
        buf.fs = v.first;
        buf.gs = v.second;
    });
    store(&state.cs_ss, Mtd::CSSS, &mut written, |v| {
        buf.cs = v.first;
        buf.ss = v.second;
    });
    store(&state.tr, Mtd::TR, &mut written, |v| buf.tr = *v);
    store(&state.ldtr, Mtd::LDTR, &mut written, |v| buf.ldtr = *v);
    store(&state.gdtr, Mtd::GDTR, &mut written, |v| buf.gdtr = *v);
    store(&state.idtr, Mtd::IDTR, &mut written, |v| buf.idtr = *v);
    store(&state.cr, Mtd::CR, &mut written, |v| {
        buf.cr0 = v.cr0;
        buf.cr2 = v.cr2;
        buf.cr3 = v.cr3;
        buf.cr4 = v.cr4;
    });
    store(&state.dr7, Mtd::DR, &mut written, |v| buf.dr7 = *v);
    store(&state.sysenter, Mtd::SYSENTER, &mut written, |v| {
        buf.sysenter_cs = v.cs;
        buf.sysenter_sp = v.sp;
        buf.sysenter_ip = v.ip;
    });
    store(&state.qual, Mtd::QUAL, &mut written, |v| {
        buf.qual = [v.primary, v.secondary];
    });
    store(&state.ctrl, Mtd::CTRL, &mut written, |v| {
        buf.ctrl = [v.primary, v.secondary];
    });
    store(&state.inj, Mtd::INJ, &mut written, |v| {
        buf.inj_info = v.info;
        buf.inj_error = v.error;
    });
    store(&state.activity, Mtd::STA, &mut written, |v| {
        buf.intr_state = v.intr_state;
        buf.actv_state = v.actv_state;
    });
    store(&state.tsc, Mtd::TSC, &mut written, |v| {
        buf.tsc_val = v.value;
        buf.tsc_off = v.offset;
    });
    store(&state.efer, Mtd::EFER, &mut written, |v| buf.efer = *v);
    store(&state.pdpte, Mtd::PDPTE, &mut written, |v| buf.pdpte = *v);
    store(&state.r8_r15, Mtd::R8_R15, &mut written, |v| buf.r8_r15 = *v);
    store(&state.syscall, Mtd::SYSCALL_SWAPGS, &mut written, |v| {
        buf.star = v.star;
        buf.lstar = v.lstar;
        buf.cstar = v.cstar;
        buf.fmask = v.fmask;
        buf.kernel_gs_base = v.kernel_gs_base;
    });
    store(&state.tpr, Mtd::TPR, &mut written, |v| {
        buf.tpr = v.tpr;
        buf.tpr_threshold = v.threshold;
    });
    store(&state.fpu, Mtd::FPU, &mut written, |v| fpu.restore(v));

    buf.mtd = written;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DescriptorTable, Segment};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct TestFpu {
        hw: Mutex<FpuState>,
        saves: Mutex<u32>,
        restores: Mutex<u32>,
    }

    impl Fpu for TestFpu {
        fn save(&self, image: &mut FpuState) {
            *image = *self.hw.lock();
            *self.saves.lock() += 1;
        }

        fn restore(&self, image: &FpuState) {
            *self.hw.lock() = *image;
            *self.restores.lock() += 1;
        }
    }

    fn sample_state(groups: Mtd) -> VcpuState {
        let mut state = VcpuState::default();
        if groups.contains(Mtd::ACDB) {
            state.acdb.charge(Acdb {
                ax: 0xa,
                cx: 0xc,
                dx: 0xd,
                bx: 0xb,
            });
        }
        if groups.contains(Mtd::ESP) {
            state.sp.charge(0x7000);
        }
        if groups.contains(Mtd::EIP) {
            state.ip.charge(InstructionPointer { ip: 0xfff0, len: 3 });
        }
        if groups.contains(Mtd::CSSS) {
            state.cs_ss.charge(SegmentPair {
                first: Segment::new(0x10, 0xa09b, 0xffff_ffff, 0),
                second: Segment::new(0x18, 0xc093, 0xffff_ffff, 0),
            });
        }
        if groups.contains(Mtd::GDTR) {
            state.gdtr.charge(DescriptorTable {
                limit: 31,
                base: 0x500,
            });
        }
        if groups.contains(Mtd::CR) {
            state.cr.charge(ControlRegisters {
                cr0: 0x8000_0011,
                cr2: 0,
                cr3: 0x1000,
                cr4: 0x20,
            });
        }
        if groups.contains(Mtd::R8_R15) {
            state.r8_r15.charge([8, 9, 10, 11, 12, 13, 14, 15]);
        }
        if groups.contains(Mtd::TPR) {
            state.tpr.charge(Tpr {
                tpr: 2,
                threshold: 1,
            });
        }
        if groups.contains(Mtd::FPU) {
            let mut image = FpuState::default();
            image.bytes[0] = 0x7f;
            image.bytes[1] = 0x03;
            state.fpu.charge(image);
        }
        state
    }

    #[test]
    fn test_round_trip_subsets() {
        let all = Mtd::ACDB
            | Mtd::ESP
            | Mtd::EIP
            | Mtd::CSSS
            | Mtd::GDTR
            | Mtd::CR
            | Mtd::R8_R15
            | Mtd::TPR
            | Mtd::FPU;
        let subsets = [
            Mtd::empty(),
            Mtd::EIP,
            Mtd::ACDB | Mtd::ESP,
            Mtd::CSSS | Mtd::GDTR | Mtd::CR,
            Mtd::R8_R15 | Mtd::FPU,
            all,
        ];

        for subset in subsets {
            let fpu = TestFpu::default();
            let state = sample_state(subset);

            let mut buf = ExitBuffer::default();
            encode(&state, &mut buf, &fpu);
            assert_eq!(buf.mtd, subset);

            let mut decoded = VcpuState::default();
            decode(&buf, &fpu, &mut decoded);

            assert_eq!(decoded.charged(), subset);
            assert_eq!(decoded, state, "subset {subset:?}");
        }
    }

    #[test]
    fn test_decode_discharges_destination() {
        let fpu = TestFpu::default();
        let mut state = sample_state(Mtd::ACDB | Mtd::CR);

        let buf = ExitBuffer {
            mtd: Mtd::EIP,
            exit_reason: ExitReason::HLT.raw(),
            ip: 0x1234,
            ip_len: 1,
            ..Default::default()
        };
        decode(&buf, &fpu, &mut state);

        assert_eq!(state.charged(), Mtd::EIP);
        assert_eq!(state.exit_reason, ExitReason::HLT);
        assert_eq!(state.ip.get(), Some(&InstructionPointer { ip: 0x1234, len: 1 }));
    }

    #[test]
    fn test_encode_leaves_uncharged_fields_alone() {
        let fpu = TestFpu::default();
        let mut buf = ExitBuffer {
            mtd: Mtd::ALL,
            ax: 0x55,
            ..Default::default()
        };

        let mut state = VcpuState::default();
        state.sp.charge(0x9000);
        encode(&state, &mut buf, &fpu);

        assert_eq!(buf.mtd, Mtd::ESP);
        assert_eq!(buf.sp, 0x9000);
        assert_eq!(buf.ax, 0x55);
    }

    #[test]
    fn test_fpu_exchanged_only_when_requested() {
        let fpu = TestFpu::default();
        let mut state = VcpuState::default();

        let buf = ExitBuffer {
            mtd: Mtd::EIP,
            ..Default::default()
        };
        decode(&buf, &fpu, &mut state);
        let mut out = ExitBuffer::default();
        encode(&state, &mut out, &fpu);

        assert_eq!(*fpu.saves.lock(), 0);
        assert_eq!(*fpu.restores.lock(), 0);

        let buf = ExitBuffer {
            mtd: Mtd::FPU,
            ..Default::default()
        };
        decode(&buf, &fpu, &mut state);
        encode(&state, &mut out, &fpu);

        assert_eq!(*fpu.saves.lock(), 1);
        assert_eq!(*fpu.restores.lock(), 1);
        assert_eq!(out.mtd, Mtd::FPU);
    }
}
