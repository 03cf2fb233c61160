//! Simulated vCPU: a dispatch thread that delivers exits to portals.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::backend::{ExitBuffer, Fpu, FpuState, Mtd, Portal, PortalSlot};
use crate::error::Result;
use crate::vcpu::{Badge, ExitReason, VcpuId};

thread_local! {
    /// FPU of the guest running on this dispatch thread.
    static GUEST_FPU: RefCell<FpuState> = RefCell::new(FpuState::default());
}

/// FPU access for exit handlers running on a simulated dispatch thread.
#[derive(Debug, Default)]
pub struct SimFpu;

impl Fpu for SimFpu {
    fn save(&self, image: &mut FpuState) {
        GUEST_FPU.with(|fpu| *image = *fpu.borrow());
    }

    fn restore(&self, image: &FpuState) {
        GUEST_FPU.with(|fpu| *fpu.borrow_mut() = *image);
    }
}

/// One delivered exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub reason: ExitReason,
    /// Groups the portal filled in.
    pub delivered: Mtd,
    /// Groups written back, once the exit has been answered.
    pub reply: Option<Mtd>,
}

#[derive(Debug, Default)]
struct PortalTable {
    by_reason: HashMap<ExitReason, Portal>,
    catch_all: Option<Portal>,
}

impl PortalTable {
    fn lookup(&self, reason: ExitReason) -> Option<Portal> {
        self.by_reason.get(&reason).or(self.catch_all.as_ref()).cloned()
    }
}

#[derive(Debug, Default)]
struct Control {
    pending: VecDeque<ExitReason>,
    recall: bool,
    stop: bool,
}

#[derive(Debug, Default)]
struct ExitLog {
    records: Vec<ExitRecord>,
    stopped: bool,
    outcome: Option<Result<()>>,
}

#[derive(Debug)]
pub(super) struct SimVcpu {
    id: VcpuId,
    portals: Mutex<PortalTable>,
    control: Mutex<Control>,
    wake: Condvar,
    /// Architectural registers of the guest.
    registers: Mutex<ExitBuffer>,
    log: Mutex<ExitLog>,
    logged: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimVcpu {
    pub(super) fn new(id: VcpuId) -> Self {
        Self {
            id,
            portals: Mutex::new(PortalTable::default()),
            control: Mutex::new(Control::default()),
            wake: Condvar::new(),
            registers: Mutex::new(ExitBuffer::default()),
            log: Mutex::new(ExitLog::default()),
            logged: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    pub(super) fn install(&self, slot: PortalSlot, portal: Portal) {
        let mut portals = self.portals.lock();
        match slot {
            PortalSlot::Exit(reason) => {
                portals.by_reason.insert(reason, portal);
            }
            PortalSlot::CatchAll => portals.catch_all = Some(portal),
        }
    }

    pub(super) fn portal_mtd(&self, slot: PortalSlot) -> Option<Mtd> {
        let portals = self.portals.lock();
        match slot {
            PortalSlot::Exit(reason) => portals.by_reason.get(&reason).map(|p| p.mtd),
            PortalSlot::CatchAll => portals.catch_all.as_ref().map(|p| p.mtd),
        }
    }

    pub(super) fn registers(&self) -> parking_lot::MutexGuard<'_, ExitBuffer> {
        self.registers.lock()
    }

    pub(super) fn inject(&self, reason: ExitReason) {
        self.control.lock().pending.push_back(reason);
        self.wake.notify_all();
    }

    pub(super) fn recall(&self) {
        self.control.lock().recall = true;
        self.wake.notify_all();
    }

    pub(super) fn recall_pending(&self) -> bool {
        self.control.lock().recall
    }

    pub(super) fn stop(&self) {
        self.control.lock().stop = true;
        self.wake.notify_all();
    }

    pub(super) fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread.lock().take()
    }

    pub(super) fn exits(&self) -> Vec<ExitRecord> {
        self.log.lock().records.clone()
    }

    /// Wait until `pred` holds for the log or `deadline` passes.
    fn wait_log(&self, deadline: Instant, pred: impl Fn(&ExitLog) -> bool) -> bool {
        let mut log = self.log.lock();
        while !pred(&log) {
            if self.logged.wait_until(&mut log, deadline).timed_out() {
                return pred(&log);
            }
        }
        true
    }

    pub(super) fn wait_for_exits(&self, count: usize, deadline: Instant) -> bool {
        self.wait_log(deadline, |log| log.records.len() >= count)
    }

    pub(super) fn wait_for_replies(&self, count: usize, deadline: Instant) -> bool {
        self.wait_log(deadline, |log| {
            log.records.iter().filter(|r| r.reply.is_some()).count() >= count
        })
    }

    pub(super) fn wait_stopped(&self, deadline: Instant) -> Option<Result<()>> {
        if !self.wait_log(deadline, |log| log.stopped) {
            return None;
        }
        self.log.lock().outcome.take()
    }

    /// Start the dispatch thread.
    pub(super) fn spawn(self: &Arc<Self>) -> Result<()> {
        let vcpu = self.clone();
        let handle = thread::Builder::new()
            .name(format!("vcpu-{}", self.id))
            .spawn(move || {
                let outcome = vcpu.dispatch_loop();
                if let Err(e) = &outcome {
                    tracing::error!(vcpu = %vcpu.id, "dispatch loop failed: {e}");
                }

                let mut log = vcpu.log.lock();
                log.stopped = true;
                log.outcome = Some(outcome);
                vcpu.logged.notify_all();
            })?;

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn dispatch_loop(&self) -> Result<()> {
        tracing::debug!(vcpu = %self.id, "dispatch thread started");
        self.deliver(ExitReason::STARTUP)?;
        while let Some(reason) = self.next_exit() {
            self.deliver(reason)?;
        }
        tracing::debug!(vcpu = %self.id, "dispatch thread stopped");
        Ok(())
    }

    /// Wait for the next exit. A pending recall goes before anything else.
    fn next_exit(&self) -> Option<ExitReason> {
        let mut control = self.control.lock();
        loop {
            if control.stop {
                return None;
            }
            if std::mem::take(&mut control.recall) {
                return Some(ExitReason::RECALL);
            }
            if let Some(reason) = control.pending.pop_front() {
                return Some(reason);
            }
            self.wake.wait(&mut control);
        }
    }

    fn deliver(&self, reason: ExitReason) -> Result<()> {
        let Some(portal) = self.portals.lock().lookup(reason) else {
            tracing::warn!(vcpu = %self.id, %reason, "no portal for exit, dropped");
            return Ok(());
        };

        let mut buf = ExitBuffer::for_exit(reason.raw());
        buf.copy_groups(&self.registers.lock(), portal.mtd);
        buf.mtd = portal.mtd;

        let index = {
            let mut log = self.log.lock();
            log.records.push(ExitRecord {
                reason,
                delivered: portal.mtd,
                reply: None,
            });
            self.logged.notify_all();
            log.records.len() - 1
        };

        (portal.entry)(Badge::new(self.id, reason), &mut buf)?;

        self.registers.lock().copy_groups(&buf, buf.mtd);

        let mut log = self.log.lock();
        log.records[index].reply = Some(buf.mtd);
        self.logged.notify_all();
        Ok(())
    }
}
