//! Error types for vmexec.

use thiserror::Error;

use crate::vcpu::{ExitReason, VcpuId};

/// Result type alias using vmexec's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by an exit handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the execution backend.
#[derive(Error, Debug)]
pub enum Error {
    // Guest memory errors
    #[error("address or page id out of range: 0x{0:x}")]
    OutOfRange(u64),

    #[error("guest memory allocation failed: {0}")]
    AllocationFailed(String),

    // vCPU errors
    #[error("unknown vCPU: {0}")]
    UnknownVcpu(VcpuId),

    #[error("exit handler of vCPU {vcpu} failed on exit reason {reason}")]
    Handler {
        vcpu: VcpuId,
        reason: ExitReason,
        #[source]
        source: HandlerError,
    },

    // Platform errors
    #[error("hypervisor error: {0}")]
    HypervisorError(String),

    // Configuration errors
    #[error("invalid memory configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a hypervisor error from a platform message.
    pub fn hypervisor(msg: impl Into<String>) -> Self {
        Error::HypervisorError(msg.into())
    }

    /// Returns true if this is an `OutOfRange` error.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Error::OutOfRange(_))
    }

    /// Returns true if this is an `AllocationFailed` error.
    pub fn is_allocation_failed(&self) -> bool {
        matches!(self, Error::AllocationFailed(_))
    }
}
