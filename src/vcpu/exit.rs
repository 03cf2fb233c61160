//! vCPU identities, exit reasons and portal badges.

use std::fmt;

/// Per-VM vCPU sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(pub u32);

impl VcpuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why control returned from the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExitReason(pub u8);

impl ExitReason {
    pub const CPUID: ExitReason = ExitReason(10);
    pub const HLT: ExitReason = ExitReason(12);
    pub const INVLPG: ExitReason = ExitReason(14);
    pub const RDTSC: ExitReason = ExitReason(16);
    pub const MOV_CR: ExitReason = ExitReason(28);
    pub const IO: ExitReason = ExitReason(30);
    pub const RDMSR: ExitReason = ExitReason(31);
    pub const WRMSR: ExitReason = ExitReason(32);
    pub const EPT_VIOLATION: ExitReason = ExitReason(48);
    /// First exit of a freshly started vCPU.
    pub const STARTUP: ExitReason = ExitReason(0xfe);
    /// Forced exit used to deliver remote run/pause requests.
    pub const RECALL: ExitReason = ExitReason(0xff);

    /// Number of bits an exit reason occupies in a badge.
    pub const BITS: u32 = u8::BITS;

    /// Every exit reason a portal can be installed for.
    pub fn all() -> impl Iterator<Item = ExitReason> {
        (0..=u8::MAX).map(ExitReason)
    }

    pub fn from_raw(raw: u32) -> Self {
        ExitReason((raw & 0xff) as u8)
    }

    pub fn raw(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ExitReason::STARTUP => write!(f, "startup"),
            ExitReason::RECALL => write!(f, "recall"),
            ExitReason(raw) => write!(f, "{:#x}", raw),
        }
    }
}

/// Portal badge identifying the vCPU and exit reason of a delivered exit.
///
/// The hypervisor hands the badge back as a single integer, so the pair is
/// packed as `vcpu << ExitReason::BITS | reason`. Use the accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Badge(u64);

impl Badge {
    pub fn new(vcpu: VcpuId, reason: ExitReason) -> Self {
        Badge((u64::from(vcpu.0) << ExitReason::BITS) | u64::from(reason.0))
    }

    pub fn from_raw(raw: u64) -> Self {
        Badge(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn vcpu_id(self) -> VcpuId {
        VcpuId((self.0 >> ExitReason::BITS) as u32)
    }

    pub fn exit_reason(self) -> ExitReason {
        ExitReason((self.0 & u64::from(u8::MAX)) as u8)
    }
}

/// Request left by a controller thread for the vCPU's next recall exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteRequest {
    None = 0,
    Pause = 1,
    Run = 2,
}

impl RemoteRequest {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RemoteRequest::Pause,
            2 => RemoteRequest::Run,
            _ => RemoteRequest::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_badge_packing() {
        let badge = Badge::new(VcpuId(3), ExitReason::RECALL);
        assert_eq!(badge.raw(), (3 << 8) | 0xff);
        assert_eq!(badge.vcpu_id(), VcpuId(3));
        assert_eq!(badge.exit_reason(), ExitReason::RECALL);

        let badge = Badge::from_raw(badge.raw());
        assert_eq!(badge.vcpu_id(), VcpuId(3));
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(ExitReason::STARTUP.to_string(), "startup");
        assert_eq!(ExitReason::IO.to_string(), "0x1e");
        assert_eq!(ExitReason::all().count(), 256);
    }
}
