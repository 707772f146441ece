//! Ring cell holding one in-flight request.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::signal::Completion;

/// One cell of the ring.
///
/// Ownership passes along a fixed chain, never shared for writing:
/// producer (claim to publish) → consumer (claim to fire) → producer
/// (wake to release). `vacant` closes the loop by naming the logical index
/// allowed to claim the cell next.
#[repr(C)]
#[repr(align(64))] // Slots sit on separate cache lines, producers hit neighbours concurrently
pub(crate) struct Slot<Req, Resp> {
    /// Logical index that may write this cell next.
    /// - Initial: physical index
    /// - After the producer of `n` takes its response: `n + capacity`
    vacant: AtomicU64,

    /// Initialized from `fill` until `take_request`.
    request: UnsafeCell<MaybeUninit<Req>>,
    response: UnsafeCell<Option<Resp>>,

    pub(crate) signal: Completion,
}

impl<Req, Resp> Slot<Req, Resp> {
    pub(crate) const fn new(index: u64) -> Self {
        Self {
            vacant: AtomicU64::new(index),
            request: UnsafeCell::new(MaybeUninit::uninit()),
            response: UnsafeCell::new(None),
            signal: Completion::new(),
        }
    }

    /// Returns `true` once the previous occupant has released the cell to `seq`.
    #[inline]
    pub(crate) fn is_vacant_for(&self, seq: u64) -> bool {
        self.vacant.load(Ordering::Acquire) == seq
    }

    /// Hands the cell to the logical index `next`.
    #[inline]
    pub(crate) fn release(&self, next: u64) {
        self.vacant.store(next, Ordering::Release);
    }

    /// Stores a fresh request, clears the previous response and arms the signal.
    ///
    /// # Safety
    ///
    /// Caller must have claimed the cell and observed it vacant for its index.
    pub(crate) unsafe fn fill(&self, request: Req) {
        // SAFETY: claimed and vacant, so this producer is the only accessor.
        unsafe {
            (*self.request.get()).write(request);
            *self.response.get() = None;
            self.signal.arm();
        }
    }

    /// Moves the request out, leaving the cell uninitialized.
    ///
    /// # Safety
    ///
    /// Caller must hold the cell on the consumer side, or be its producer
    /// after a [`Outcome::Closed`](crate::signal::Outcome::Closed) fire, and
    /// the request must not have been taken since the last `fill`.
    pub(crate) unsafe fn take_request(&self) -> Req {
        // SAFETY: exclusive and initialized per the caller contract.
        unsafe { (*self.request.get()).assume_init_read() }
    }

    /// Writes the response ahead of firing the signal.
    ///
    /// # Safety
    ///
    /// Caller must hold the cell on the consumer side and not have fired yet.
    pub(crate) unsafe fn put_response(&self, response: Resp) {
        // SAFETY: exclusive per the caller contract.
        unsafe {
            *self.response.get() = Some(response);
        }
    }

    /// Moves the response out.
    ///
    /// # Safety
    ///
    /// Caller must be the producer, after its signal fired.
    pub(crate) unsafe fn take_response(&self) -> Option<Resp> {
        // SAFETY: exclusive per the caller contract.
        unsafe { (*self.response.get()).take() }
    }
}

// SAFETY: the request/response cells are accessed by one party at a time,
// with the commit track (publish) and the completion signal (fire) providing
// the release/acquire edges between successive owners.
unsafe impl<Req: Send, Resp: Send> Sync for Slot<Req, Resp> {}
unsafe impl<Req: Send, Resp: Send> Send for Slot<Req, Resp> {}
