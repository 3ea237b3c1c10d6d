//! Read-copy-update grace period synchronization.
//!
//! Two contracts: a bounded, non-blocking read section, and
//! [`RcuGp::wait_grace_period`], which returns only once every read section
//! that began before the call has ended. The runtime uses it solely to
//! delay reclaiming retired callback vectors and statedump handles after a
//! replacement pointer has been published.
//!
//! Publication pairs a release store on the protected pointer with an
//! acquire load on the reader side; the grace period machinery itself runs
//! on sequentially consistent counter updates.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::hint;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// Busy-loop attempts before a waiter falls back to timed sleeps.
pub(crate) const RETRY_BUSY_LOOP_ATTEMPTS: u32 = 100;
/// Sleep length once busy looping gives up.
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(1);

/// One grace-period domain.
///
/// Readers count themselves into the phase selected by the period word;
/// a grace-period waiter flips the period and drains the previous phase.
pub(crate) struct RcuGp {
    /// Current period; bit 0 selects the active reader counter.
    period: AtomicUsize,
    /// Active reader counts, one per phase.
    readers: [AtomicUsize; 2],
    /// Serializes grace-period waiters.
    writer_lock: Mutex<()>,
}

/// Open read section; ends on drop.
pub(crate) struct RcuReadGuard<'a> {
    gp: &'a RcuGp,
    phase: usize,
}

impl RcuGp {
    pub(crate) const fn new() -> Self {
        Self {
            period: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            writer_lock: Mutex::new(()),
        }
    }

    /// Enter a read section. Never blocks.
    pub(crate) fn read_lock(&self) -> RcuReadGuard<'_> {
        loop {
            let phase = self.period.load(Ordering::SeqCst) & 1;
            self.readers[phase].fetch_add(1, Ordering::SeqCst);
            // The period may have flipped between the load and the
            // increment, in which case a waiter draining `phase` can have
            // missed this reader. Re-validate and retry on the new phase.
            if self.period.load(Ordering::SeqCst) & 1 == phase {
                return RcuReadGuard { gp: self, phase };
            }
            self.readers[phase].fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Wait until every read section that began before this call has
    /// ended. Must not be called from inside a read section of the same
    /// domain.
    pub(crate) fn wait_grace_period(&self) {
        let _writer = self.writer_lock.lock();
        let old_phase = self.period.fetch_add(1, Ordering::SeqCst) & 1;
        let mut attempt = 0u32;
        while self.readers[old_phase].load(Ordering::SeqCst) != 0 {
            if attempt > RETRY_BUSY_LOOP_ATTEMPTS {
                thread::sleep(RETRY_DELAY);
                continue;
            }
            attempt += 1;
            hint::spin_loop();
        }
    }
}

impl RcuGp {
    /// Finalization check. The domain is statically allocated, so there
    /// is nothing to free; verify instead that no read section is still
    /// open, which the teardown contract forbids.
    fn release(&self) {
        assert_eq!(
            self.readers[0].load(Ordering::SeqCst),
            0,
            "read section still open at finalization"
        );
        assert_eq!(
            self.readers[1].load(Ordering::SeqCst),
            0,
            "read section still open at finalization"
        );
    }
}

impl Drop for RcuReadGuard<'_> {
    fn drop(&mut self) {
        self.gp.readers[self.phase].fetch_sub(1, Ordering::SeqCst);
    }
}

/// Domain protecting event callback vectors.
static EVENT_GP: RcuGp = RcuGp::new();
/// Domain protecting the statedump handle list. Distinct from the event
/// domain so a grace wait on one cannot transitively deadlock the other.
static STATEDUMP_GP: RcuGp = RcuGp::new();

pub(crate) fn event_gp() -> &'static RcuGp {
    &EVENT_GP
}

pub(crate) fn statedump_gp() -> &'static RcuGp {
    &STATEDUMP_GP
}

/// Release both domains at finalization. Bring-up is the statics' const
/// initialization; this is the matching teardown half.
pub(crate) fn exit_domains() {
    EVENT_GP.release();
    STATEDUMP_GP.release();
}
