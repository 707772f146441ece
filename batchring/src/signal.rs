//! One-shot completion signal.
//!
//! Each ring slot owns one [`Completion`]. The producer arms it before
//! publishing the slot, then blocks in [`Completion::wait`]. Whoever finishes
//! the request fires it exactly once with an [`Outcome`], releasing the
//! producer.
//!
//! Waiting spins with [`Backoff`] first, since a batching consumer usually
//! answers within a few microseconds, and parks the thread once the backoff
//! is exhausted.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, Thread};

use crossbeam_utils::Backoff;

/// How a request finished.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Not fired yet.
    Pending = 0,
    /// A response was written to the slot.
    Responded = 1,
    /// A consumer released the request without a response.
    Abandoned = 2,
    /// The mailbox shut down before the request was consumed.
    Closed = 3,
}

impl Outcome {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Responded,
            2 => Self::Abandoned,
            3 => Self::Closed,
            _ => Self::Pending,
        }
    }
}

/// Single-fire wait/notify cell, reused once per slot era.
pub(crate) struct Completion {
    state: AtomicU8,
    /// Thread to unpark on fire. Written by the arming producer before the
    /// slot is published, read by the firing party before `state` changes.
    waiter: UnsafeCell<Option<Thread>>,
}

impl Completion {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(Outcome::Pending as u8),
            waiter: UnsafeCell::new(None),
        }
    }

    /// Resets the signal to pending and registers the calling thread.
    ///
    /// # Safety
    ///
    /// Caller must own the slot (claimed it, not yet published). The
    /// publish store that follows makes these writes visible to consumers.
    pub(crate) unsafe fn arm(&self) {
        // SAFETY: the caller owns the slot, nobody else touches `waiter`.
        unsafe {
            *self.waiter.get() = Some(thread::current());
        }
        self.state.store(Outcome::Pending as u8, Ordering::Relaxed);
    }

    /// Blocks until the signal fires and returns the outcome.
    ///
    /// Acquire ordering pairs with the release in [`Completion::fire`], so
    /// everything written to the slot before firing is visible on return.
    pub(crate) fn wait(&self) -> Outcome {
        let backoff = Backoff::new();
        loop {
            let outcome = self.outcome();
            if outcome != Outcome::Pending {
                return outcome;
            }
            if backoff.is_completed() {
                break;
            }
            backoff.snooze();
        }
        loop {
            let outcome = self.outcome();
            if outcome != Outcome::Pending {
                return outcome;
            }
            // Spurious wakeups are fine, the state is re-checked.
            thread::park();
        }
    }

    /// Fires the signal with `outcome`, waking the armed producer.
    ///
    /// # Safety
    ///
    /// Caller must own the slot on the consumer side and fire at most once
    /// per arm. The producer may reuse the slot as soon as the state store
    /// lands, so nothing in the slot is touched afterwards.
    pub(crate) unsafe fn fire(&self, outcome: Outcome) {
        debug_assert_ne!(outcome, Outcome::Pending);
        // SAFETY: the producer does not touch `waiter` until the state
        // leaves pending, which happens below.
        let waiter = unsafe { (*self.waiter.get()).clone() };
        let prev = self.state.swap(outcome as u8, Ordering::Release);
        debug_assert_eq!(prev, Outcome::Pending as u8, "completion fired twice");
        if let Some(thread) = waiter {
            thread.unpark();
        }
    }

    fn outcome(&self) -> Outcome {
        Outcome::from_u8(self.state.load(Ordering::Acquire))
    }
}

// SAFETY: `waiter` is only accessed under the slot handoff protocol: the
// producer before publish, the consumer between claim and fire.
unsafe impl Sync for Completion {}
unsafe impl Send for Completion {}
