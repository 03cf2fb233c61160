//! Coalescing of per-page guest mapping notifications.
//!
//! Guest memory layout is announced one page at a time, but each mapping
//! operation is a round trip to the hypervisor. [`Nem`] accumulates pages
//! that are contiguous on both the host and guest side and share one
//! protection, and hands the whole extent to [`Gmm::map_to_guest`] at once.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::{ByteRange, GuestAddr, Gmm, Pages, Protection, VmmAddr, PAGE_SHIFT};

#[derive(Debug, Clone, Copy)]
struct PendingRange {
    host: ByteRange,
    guest: ByteRange,
    prot: Protection,
}

impl PendingRange {
    /// Grow by a host/guest pair that continues this range on the same side.
    fn extend(&mut self, host: &ByteRange, guest: &ByteRange, prot: Protection) -> bool {
        if prot != self.prot {
            return false;
        }

        match (self.host.adjoins(host), self.guest.adjoins(guest)) {
            (Some(host_side), Some(guest_side)) if host_side == guest_side => {
                self.host.extend(host, host_side);
                self.guest.extend(guest, guest_side);
                true
            }
            _ => false,
        }
    }
}

/// Range coalescer in front of the guest memory pool.
#[derive(Debug)]
pub struct Nem {
    gmm: Arc<Mutex<Gmm>>,
    pending: Option<PendingRange>,
    commits: u64,
}

impl Nem {
    pub fn new(gmm: Arc<Mutex<Gmm>>) -> Self {
        Self {
            gmm,
            pending: None,
            commits: 0,
        }
    }

    /// Announce that the page at `host` should appear at `guest` with `prot`.
    pub fn notify_page(&mut self, host: VmmAddr, guest: GuestAddr, prot: Protection) -> Result<()> {
        self.notify_range(host, guest, Pages(1), prot)
    }

    /// Announce a run of pages. Coalesces like `pages` single-page
    /// notifications.
    pub fn notify_range(&mut self, host: VmmAddr, guest: GuestAddr, pages: Pages, prot: Protection) -> Result<()> {
        if pages.0 == 0 {
            return Ok(());
        }

        let size = pages.bytes()?;
        let host = ByteRange::new(host.0, size).ok_or(Error::OutOfRange(host.0))?;
        let guest = ByteRange::new(guest.0, size).ok_or(Error::OutOfRange(guest.0))?;

        if let Some(pending) = &mut self.pending {
            if pending.extend(&host, &guest, prot) {
                return Ok(());
            }
        }

        // the new range is accumulated even if the previous one fails to map
        let committed = self.commit();
        self.pending = Some(PendingRange { host, guest, prot });
        committed
    }

    /// Map the accumulated range, if any.
    ///
    /// The range is consumed either way. A range that fails to map is
    /// dropped so later notifications are not held back by it.
    pub fn commit(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        let pages = Pages(pending.host.size() >> PAGE_SHIFT);
        let result = self.gmm.lock().map_to_guest(
            VmmAddr(pending.host.start()),
            GuestAddr(pending.guest.start()),
            pages,
            pending.prot,
        );

        match result {
            Ok(()) => {
                self.commits += 1;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    host = %VmmAddr(pending.host.start()),
                    guest = %GuestAddr(pending.guest.start()),
                    pages = pages.0,
                    "dropping range that failed to map: {e}"
                );
                Err(e)
            }
        }
    }

    /// The range accumulated so far: host start, guest start, size and
    /// protection.
    pub fn pending(&self) -> Option<(VmmAddr, GuestAddr, Pages, Protection)> {
        self.pending.map(|p| {
            (
                VmmAddr(p.host.start()),
                GuestAddr(p.guest.start()),
                Pages(p.host.size() >> PAGE_SHIFT),
                p.prot,
            )
        })
    }

    /// Number of ranges committed so far.
    pub fn commits(&self) -> u64 {
        self.commits
    }
}
