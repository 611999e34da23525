use core::{future::poll_fn, task::Poll};

use portable_atomic::{AtomicBool, AtomicU16, Ordering};

use atomic_waker::AtomicWaker;

use crate::regs::IrqStatus;

/// Hand off from the interrupt handler to the deferred worker.
///
/// Interrupts are coalesced. However many arrive, before the worker gets to run, it will only
/// run once. Reason bits reported by the interrupt handler accumulate, so that the command path
/// can see a completion, that the handler already observed.
pub struct IrqSignal {
    pending: AtomicBool,
    observed: AtomicU16,
    waker: AtomicWaker,
}
impl IrqSignal {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            observed: AtomicU16::new(0),
            waker: AtomicWaker::new(),
        }
    }
    /// Note the reasons and wake the worker.
    pub fn raise(&self, reasons: IrqStatus) {
        self.observed.fetch_or(reasons.into_bits(), Ordering::AcqRel);
        self.kick();
    }
    /// Wake the worker without any hardware reason, e.g. because frames were queued.
    pub fn kick(&self) {
        self.pending.store(true, Ordering::Release);
        self.waker.wake();
    }
    /// Take the specified reasons out of the observed set.
    ///
    /// Returns whether any of them were set.
    pub fn take_observed(&self, reasons: IrqStatus) -> bool {
        let bits = reasons.into_bits();
        self.observed.fetch_and(!bits, Ordering::AcqRel) & bits != 0
    }
    /// Take all observed reasons.
    pub fn take_all_observed(&self) -> IrqStatus {
        IrqStatus::from_bits(self.observed.swap(0, Ordering::AcqRel))
    }
    /// Asynchronously wait for the next signal.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            if self.pending.swap(false, Ordering::AcqRel) {
                Poll::Ready(())
            } else {
                self.waker.register(cx.waker());
                // Check again, in case we raced with the interrupt handler.
                if self.pending.swap(false, Ordering::AcqRel) {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        })
        .await
    }
}
impl Default for IrqSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// What the host MAC layer has to be told after a gate update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GateTransition {
    Stopped,
    Woken,
}

/// The TX queue gate.
///
/// Closes when the free descriptor count drops below the stop threshold and only reopens, once
/// it has climbed back to the start threshold, which is strictly higher.
pub struct QueueGate {
    stopped: AtomicBool,
    stop_below: usize,
    start_at: usize,
}
impl QueueGate {
    /// Create a new gate.
    ///
    /// `start_at` must be greater than `stop_below`.
    pub const fn new(stop_below: usize, start_at: usize) -> Self {
        assert!(start_at > stop_below);
        Self {
            stopped: AtomicBool::new(false),
            stop_below,
            start_at,
        }
    }
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
    /// Feed the current free count.
    pub fn update(&self, free: usize) -> Option<GateTransition> {
        if self.is_stopped() {
            if free >= self.start_at {
                self.stopped.store(false, Ordering::Release);
                return Some(GateTransition::Woken);
            }
        } else if free < self.stop_below {
            self.stopped.store(true, Ordering::Release);
            return Some(GateTransition::Stopped);
        }
        None
    }
}
