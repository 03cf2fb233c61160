//! Virtual CPU lifecycle: run, pause, recall and block.
//!
//! Every exit is dispatched on the vCPU's own thread by the hypervisor.
//! Controller threads never touch the vCPU directly: they leave a
//! [`RemoteRequest`] and force a recall exit, and the dispatching thread acts
//! on the request. The last request written before the recall exit drains its
//! wake signals is the one that takes effect.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard};

use crate::backend::{ExitBuffer, Hypervisor, Mtd, Portal, PortalEntry, PortalSlot, Semaphore};
use crate::debug::{is_debug_enabled, DebugCategory};
use crate::error::{Error, HandlerError, Result};

pub mod codec;
mod exit;
mod registry;
pub mod state;

pub use exit::{Badge, ExitReason, RemoteRequest, VcpuId};
pub use registry::VcpuRegistry;
pub use state::{Charged, VcpuState};

/// Transfer mask of the portal shared by all exits nobody is interested in.
pub const CATCH_ALL_MTD: Mtd = Mtd::EIP;

/// Handles the exits of a vCPU.
pub trait ExitHandler: Send + Sync {
    /// Register groups needed to handle `reason`.
    ///
    /// `None` routes the reason to the catch-all portal, which only transfers
    /// the instruction pointer. An empty mask means "everything".
    fn interest(&self, reason: ExitReason) -> Option<Mtd> {
        let _ = reason;
        Some(Mtd::empty())
    }

    /// Handle one exit.
    ///
    /// The vCPU blocks after this returns unless the handler calls
    /// [`Vcpu::run`]. Groups left charged in `state` are written back.
    fn handle_exit(&self, vcpu: &Vcpu, state: &mut VcpuState) -> std::result::Result<(), HandlerError>;
}

/// Transfer mask of the portal for a handler's declared interest.
pub fn portal_mtd(interest: Option<Mtd>) -> Mtd {
    match interest {
        None => CATCH_ALL_MTD,
        Some(groups) if groups.is_empty() => Mtd::ALL,
        Some(groups) => groups,
    }
}

/// Shared view of a vCPU's register state.
///
/// Controllers may inspect and modify the state while the vCPU is paused.
/// Modified groups must be charged to reach the guest on the next run.
#[derive(Debug, Clone, Default)]
pub struct CpuState(Arc<Mutex<VcpuState>>);

impl CpuState {
    pub fn lock(&self) -> MutexGuard<'_, VcpuState> {
        self.0.lock()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut VcpuState) -> R) -> R {
        f(&mut self.0.lock())
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> VcpuState {
        self.0.lock().clone()
    }
}

/// Marks the current thread as dispatching for as long as it lives.
struct DispatchGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
}

impl<'a> DispatchGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *slot.lock() = Some(thread::current().id());
        Self { slot }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// A virtual CPU.
pub struct Vcpu {
    id: VcpuId,
    hypervisor: Arc<dyn Hypervisor>,
    handler: Arc<dyn ExitHandler>,
    state: CpuState,
    semaphore: Semaphore,
    blocked: AtomicBool,
    remote: AtomicU8,
    started: AtomicBool,
    destroyed: AtomicBool,
    dispatching: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("blocked", &self.is_blocked())
            .field("remote", &self.remote_request())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl Vcpu {
    /// Create a vCPU, register it and install its exit portals.
    ///
    /// Each reason the handler is interested in gets a portal with the
    /// handler's mask; the rest share the catch-all portal.
    pub(crate) fn create(
        hypervisor: Arc<dyn Hypervisor>,
        registry: &Arc<VcpuRegistry>,
        handler: Arc<dyn ExitHandler>,
    ) -> Result<Arc<Vcpu>> {
        let id = registry.next_id();
        let vcpu = Arc::new(Vcpu {
            id,
            hypervisor: hypervisor.clone(),
            handler: handler.clone(),
            state: CpuState::default(),
            semaphore: Semaphore::new(),
            blocked: AtomicBool::new(false),
            remote: AtomicU8::new(RemoteRequest::None as u8),
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            dispatching: Mutex::new(None),
        });
        registry.register(&vcpu);

        let entry: PortalEntry = {
            let registry = registry.clone();
            Arc::new(move |badge, buf: &mut ExitBuffer| registry.dispatch(badge, buf))
        };

        let installed = Self::install_portals(&*hypervisor, id, &*handler, entry)
            .and_then(|()| hypervisor.start_vcpu(id));
        if let Err(e) = installed {
            registry.unregister(id);
            return Err(e);
        }

        tracing::debug!(vcpu = %id, backend = hypervisor.name(), "vCPU created");
        Ok(vcpu)
    }

    fn install_portals(
        hypervisor: &dyn Hypervisor,
        id: VcpuId,
        handler: &dyn ExitHandler,
        entry: PortalEntry,
    ) -> Result<()> {
        let mut needs_catch_all = false;
        for reason in ExitReason::all() {
            match handler.interest(reason) {
                Some(groups) => {
                    let portal = Portal {
                        mtd: portal_mtd(Some(groups)),
                        entry: entry.clone(),
                    };
                    hypervisor.install_portal(id, PortalSlot::Exit(reason), portal)?;
                }
                None => needs_catch_all = true,
            }
        }

        if needs_catch_all {
            let portal = Portal {
                mtd: CATCH_ALL_MTD,
                entry,
            };
            hypervisor.install_portal(id, PortalSlot::CatchAll, portal)?;
        }
        Ok(())
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// Whether the vCPU is (or will be, at the end of this exit) waiting to
    /// be resumed.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Whether the vCPU has taken its first exit.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether an exit is being dispatched right now.
    pub fn is_dispatching(&self) -> bool {
        self.dispatching.lock().is_some()
    }

    /// Request not yet consumed by a recall exit.
    pub fn remote_request(&self) -> RemoteRequest {
        RemoteRequest::from_u8(self.remote.load(Ordering::SeqCst))
    }

    /// The register state region.
    pub fn cpu_state(&self) -> CpuState {
        self.state.clone()
    }

    fn on_dispatching_thread(&self) -> bool {
        *self.dispatching.lock() == Some(thread::current().id())
    }

    /// Resume the vCPU.
    ///
    /// From the exit handler this just cancels the block at the end of the
    /// exit. From any other thread it leaves a run request and recalls the
    /// vCPU, unless the vCPU is already running with nothing pending.
    pub fn run(&self) {
        if !self.is_started() {
            // resumed by its startup exit
            return;
        }

        if self.on_dispatching_thread() {
            self.blocked.store(false, Ordering::SeqCst);
            return;
        }

        if !self.is_blocked() && self.remote_request() == RemoteRequest::None {
            return;
        }

        self.request(RemoteRequest::Run);
    }

    /// Pause the vCPU.
    ///
    /// From the exit handler, a vCPU that still blocks at the end of this
    /// exit needs nothing more; one the handler already resumed is paused at
    /// its next exit. Other threads leave a pause request and recall it.
    pub fn pause(&self) {
        if self.on_dispatching_thread() && self.is_blocked() {
            return;
        }

        self.request(RemoteRequest::Pause);
    }

    fn request(&self, request: RemoteRequest) {
        tracing::trace!(vcpu = %self.id, ?request, "remote request");
        self.remote.store(request as u8, Ordering::SeqCst);
        self.hypervisor.recall(self.id);
        self.semaphore.up();
    }

    fn take_remote_request(&self) -> RemoteRequest {
        RemoteRequest::from_u8(self.remote.swap(RemoteRequest::None as u8, Ordering::SeqCst))
    }

    /// Tear down: stop routing exits here, wake the vCPU if it is blocked and
    /// release its execution context.
    pub(crate) fn destroy(&self, registry: &VcpuRegistry) -> Result<()> {
        registry.unregister(self.id);
        self.destroyed.store(true, Ordering::SeqCst);
        self.semaphore.up();

        tracing::debug!(vcpu = %self.id, "destroying vCPU");
        self.hypervisor.destroy_vcpu(self.id)
    }

    /// Handle an exit delivered to one of this vCPU's portals.
    pub(crate) fn handle_exit(&self, buf: &mut ExitBuffer) -> Result<()> {
        let reason = ExitReason::from_raw(buf.exit_reason);
        self.started.store(true, Ordering::SeqCst);

        if reason == ExitReason::RECALL && self.handle_recall(buf) {
            return Ok(());
        }

        self.dispatch(reason, buf)?;

        if !self.is_blocked() {
            self.transfer(buf);
            return Ok(());
        }

        tracing::trace!(vcpu = %self.id, %reason, "blocking");
        buf.clear_transfer();
        self.block();
        Ok(())
    }

    /// Returns true if the recall was fully answered.
    fn handle_recall(&self, buf: &mut ExitBuffer) -> bool {
        let was_blocked = self.is_blocked();
        if !was_blocked {
            self.state.lock().exit_reason = ExitReason::RECALL;
        }

        let drained = self.semaphore.drain();
        let request = self.take_remote_request();
        tracing::trace!(vcpu = %self.id, was_blocked, drained, ?request, "recall");

        match request {
            RemoteRequest::Run => {
                self.blocked.store(false, Ordering::SeqCst);
                if was_blocked {
                    self.transfer(buf);
                } else {
                    buf.clear_transfer();
                }
                true
            }
            RemoteRequest::Pause | RemoteRequest::None => false,
        }
    }

    fn dispatch(&self, reason: ExitReason, buf: &ExitBuffer) -> Result<()> {
        let _dispatching = DispatchGuard::enter(&self.dispatching);

        let mut state = self.state.lock();
        codec::decode(buf, self.hypervisor.fpu(), &mut state);
        if is_debug_enabled(DebugCategory::Vcpu) {
            tracing::trace!(vcpu = %self.id, %reason, loaded = ?state.charged(), "exit state decoded");
        }
        self.blocked.store(true, Ordering::SeqCst);

        self.handler
            .handle_exit(self, &mut state)
            .map_err(|source| Error::Handler {
                vcpu: self.id,
                reason,
                source,
            })
    }

    fn transfer(&self, buf: &mut ExitBuffer) {
        let mut state = self.state.lock();
        codec::encode(&state, buf, self.hypervisor.fpu());
        state.discharge();
    }

    fn block(&self) {
        loop {
            self.semaphore.down();
            if self.destroyed.load(Ordering::SeqCst) || self.remote_request() != RemoteRequest::None {
                return;
            }
            // signal of a request an earlier recall already served
            tracing::trace!(vcpu = %self.id, "stale wakeup");
        }
    }
}
