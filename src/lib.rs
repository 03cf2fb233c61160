//! # vmexec
//!
//! vCPU execution and guest memory backend for a VMM running on a
//! capability-based hypervisor.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vmexec::vcpu::{ExitHandler, Vcpu, VcpuState};
//! use vmexec::{HandlerError, Result, Vm};
//!
//! struct Handler;
//!
//! impl ExitHandler for Handler {
//!     fn handle_exit(&self, vcpu: &Vcpu, _state: &mut VcpuState) -> std::result::Result<(), HandlerError> {
//!         vcpu.run();
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     vmexec::debug::init();
//!     let vm = Vm::builder().build()?;
//!     let vcpu = vm.create_vcpu(Arc::new(Handler))?;
//!     vm.pause(vcpu)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Components
//!
//! - [`vcpu`]: per-vCPU run/pause state machine, exit dispatch and the
//!   register transfer codec
//! - [`memory`]: the guest memory pool and the mapping coalescer
//! - [`backend`]: what the hypervisor has to provide, and an in-process
//!   simulated hypervisor

mod builder;
pub mod debug;
mod error;
mod vm;

pub mod backend;
pub mod memory;
pub mod vcpu;

// Re-exports
pub use builder::VmBuilder;
pub use error::{Error, HandlerError, Result};
pub use vm::Vm;

/// Check if a hypervisor backend is usable on this platform.
pub fn is_supported() -> bool {
    backend::is_available()
}

/// Get the name of the default hypervisor backend.
///
/// Returns `None` if no backend is available.
pub fn backend_name() -> Option<&'static str> {
    backend::name()
}
