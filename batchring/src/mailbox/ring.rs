//! Core request/response ring algorithm.
//!
//! # Algorithm
//!
//! - Producers `fetch_add` the write cursor to obtain a unique logical index
//! - A producer waits until its index is within `capacity` of the read
//!   cursor and its cell has been released to it, writes the request, then
//!   publishes by storing the index into the commit track
//! - Consumers treat index `n` as ready iff `committed[n & mask] == n`
//! - Single-slot consumers claim with a CAS on the read cursor; the batch
//!   consumer scans a contiguous published run and advances with one store
//! - The consumer fires the slot's completion signal; the woken producer
//!   takes its response and releases the cell to `n + capacity`
//!
//! # Sealing
//!
//! The top bit of the write cursor marks the ring as sealed. Claims that
//! observe it are refused, and the cursor value at the moment of sealing is
//! recorded as the end of the stream. Every index below the end is
//! guaranteed to be published eventually.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use super::slot::Slot;
use crate::error::SubmitError;
use crate::signal::Outcome;
use crate::trace::debug;

/// Commit-track value for a cell with nothing published.
///
/// Logical indices stay below [`SEALED`], so no index ever matches it and the
/// first use of cell 0 cannot be mistaken for a published index 0.
pub(crate) const UNPUBLISHED: u64 = u64::MAX;

/// Write-cursor bit set once the ring stops accepting requests.
pub(crate) const SEALED: u64 = 1 << 63;

/// `end` value while the ring is open.
const OPEN: u64 = u64::MAX;

/// Producer-side state.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct ProducerState {
    /// Next logical index to hand out, plus the [`SEALED`] bit.
    write: AtomicU64,

    /// Write cursor value when the ring was sealed, [`OPEN`] before that.
    end: AtomicU64,
}

impl ProducerState {
    const fn new() -> Self {
        Self {
            write: AtomicU64::new(0),
            end: AtomicU64::new(OPEN),
        }
    }
}

/// Consumer-side state.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct ConsumerState {
    /// Next logical index to consume.
    read: AtomicU64,
}

impl ConsumerState {
    const fn new() -> Self {
        Self {
            read: AtomicU64::new(0),
        }
    }
}

/// Per-cell record of the last logical index published there.
pub(crate) struct CommitTrack {
    marks: Box<[AtomicU64]>,
    mask: u64,
}

impl CommitTrack {
    fn new(capacity: usize) -> Self {
        Self {
            marks: (0..capacity).map(|_| AtomicU64::new(UNPUBLISHED)).collect(),
            mask: capacity as u64 - 1,
        }
    }

    /// Marks `seq` readable. Release ordering publishes the slot contents.
    #[inline]
    fn publish(&self, seq: u64) {
        self.marks[(seq & self.mask) as usize].store(seq, Ordering::Release);
    }

    #[inline]
    fn is_published(&self, seq: u64) -> bool {
        self.marks[(seq & self.mask) as usize].load(Ordering::Acquire) == seq
    }
}

/// Result of a single-slot claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The caller now owns this logical index.
    Ready(u64),
    /// Nothing published at the head yet, or another consumer won the race.
    Pending,
    /// Sealed and every index below the end has been consumed.
    Drained,
}

/// Fixed-capacity request/response ring.
pub(crate) struct Ring<Req, Resp> {
    producer: ProducerState,
    consumer: ConsumerState,
    committed: CommitTrack,
    slots: Box<[Slot<Req, Resp>]>,
    mask: u64,
}

impl<Req, Resp> Ring<Req, Resp> {
    /// Creates a ring of `capacity` slots.
    ///
    /// `capacity` must be a power of two; [`crate::Config`] guarantees it.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            producer: ProducerState::new(),
            consumer: ConsumerState::new(),
            committed: CommitTrack::new(capacity),
            slots: (0..capacity as u64).map(Slot::new).collect(),
            mask: capacity as u64 - 1,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn slot(&self, seq: u64) -> &Slot<Req, Resp> {
        &self.slots[(seq & self.mask) as usize]
    }

    /// Submits `request` and blocks until a consumer fires its slot.
    pub(crate) fn submit_and_wait(&self, request: Req) -> Result<Resp, SubmitError<Req>> {
        let Some(seq) = self.claim() else {
            return Err(SubmitError::Closed(request));
        };
        self.wait_for_vacancy(seq);

        let slot = self.slot(seq);
        // SAFETY: `seq` is ours alone and the cell was released to it.
        unsafe { slot.fill(request) };
        self.publish(seq);

        let outcome = slot.signal.wait();
        // SAFETY: the signal fired, so the consumer side is done with the
        // cell and nobody else can claim it until we release it below.
        let result = unsafe {
            match outcome {
                Outcome::Responded => slot.take_response().ok_or(SubmitError::Abandoned),
                Outcome::Closed => Err(SubmitError::Closed(slot.take_request())),
                Outcome::Abandoned | Outcome::Pending => Err(SubmitError::Abandoned),
            }
        };
        slot.release(seq + self.capacity() as u64);
        result
    }

    /// Reserves the next logical index, or `None` once sealed.
    #[inline]
    pub(crate) fn claim(&self) -> Option<u64> {
        let prev = self.producer.write.fetch_add(1, Ordering::AcqRel);
        (prev & SEALED == 0).then_some(prev)
    }

    /// Spins until `seq` fits in the ring and its cell has been released.
    pub(crate) fn wait_for_vacancy(&self, seq: u64) {
        let capacity = self.capacity() as u64;
        let slot = self.slot(seq);
        let backoff = Backoff::new();
        while seq.saturating_sub(self.consumer.read.load(Ordering::Acquire)) >= capacity
            || !slot.is_vacant_for(seq)
        {
            backoff.snooze();
        }
    }

    #[inline]
    pub(crate) fn publish(&self, seq: u64) {
        self.committed.publish(seq);
    }

    /// Attempts to claim the head index for one of many consumers.
    pub(crate) fn try_claim_one(&self) -> Claim {
        let head = self.consumer.read.load(Ordering::Acquire);
        if !self.committed.is_published(head) {
            return if self.end() == Some(head) {
                Claim::Drained
            } else {
                Claim::Pending
            };
        }
        match self.consumer.read.compare_exchange(
            head,
            head + 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => Claim::Ready(head),
            Err(_) => Claim::Pending,
        }
    }

    /// Claims the contiguous run of published indices at the head.
    ///
    /// The scan stops at the first unpublished index, so the run never
    /// contains a gap. Returns an empty range when the head is unpublished.
    ///
    /// # Safety
    ///
    /// Caller must be the only consumer of this ring. The read cursor is
    /// advanced with a plain store.
    pub(crate) unsafe fn claim_run(&self) -> Range<u64> {
        let head = self.consumer.read.load(Ordering::Relaxed);
        let capacity = self.capacity() as u64;
        let mut tail = head;
        while tail - head < capacity && self.committed.is_published(tail) {
            tail += 1;
        }
        if tail != head {
            self.consumer.read.store(tail, Ordering::Release);
        }
        head..tail
    }

    /// Stops accepting requests and returns the end of the stream.
    pub(crate) fn seal(&self) -> u64 {
        let prev = self.producer.write.fetch_or(SEALED, Ordering::AcqRel);
        if prev & SEALED != 0 {
            return self.wait_end();
        }
        self.producer.end.store(prev, Ordering::Release);
        debug!(end = prev, "mailbox sealed");
        prev
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.producer.write.load(Ordering::Acquire) & SEALED != 0
    }

    /// End of the stream if sealed.
    pub(crate) fn end(&self) -> Option<u64> {
        self.is_sealed().then(|| self.wait_end())
    }

    /// Returns `true` once sealed and every index before the end is consumed.
    pub(crate) fn is_drained(&self) -> bool {
        self.end() == Some(self.consumer.read.load(Ordering::Acquire))
    }

    /// Requests claimed by producers and not yet consumed.
    pub(crate) fn len(&self) -> usize {
        let write = self.producer.write.load(Ordering::Acquire);
        let tail = if write & SEALED == 0 {
            write
        } else {
            self.wait_end()
        };
        tail.saturating_sub(self.consumer.read.load(Ordering::Acquire)) as usize
    }

    /// Seals the ring and hands every unconsumed request back to its producer.
    ///
    /// Waits for producers that claimed an index before the seal to publish,
    /// then fires their signals with [`Outcome::Closed`]. Returns how many
    /// requests were handed back.
    ///
    /// # Safety
    ///
    /// No consumer may be active on this ring, now or later.
    pub(crate) unsafe fn shutdown(&self) -> usize {
        let end = self.seal();
        let mut head = self.consumer.read.load(Ordering::Acquire);
        let mut returned = 0;
        let backoff = Backoff::new();
        while head < end {
            if !self.committed.is_published(head) {
                backoff.snooze();
                continue;
            }
            backoff.reset();
            // SAFETY: no consumer remains, so the published cell is ours.
            unsafe { self.slot(head).signal.fire(Outcome::Closed) };
            head += 1;
            self.consumer.read.store(head, Ordering::Release);
            returned += 1;
        }
        debug!(returned, "mailbox shut down");
        returned
    }

    /// Spins until the sealing thread records the end.
    fn wait_end(&self) -> u64 {
        let backoff = Backoff::new();
        loop {
            let end = self.producer.end.load(Ordering::Acquire);
            if end != OPEN {
                return end;
            }
            backoff.snooze();
        }
    }
}

impl<Req, Resp> Drop for Ring<Req, Resp> {
    fn drop(&mut self) {
        // Published requests no consumer claimed are still owned by their cells.
        // Handle-owned rings are shut down first, so this only finds work when
        // a ring is dropped with no consumer pass after the last publish.
        let write = *self.producer.write.get_mut();
        let tail = if write & SEALED == 0 {
            write
        } else {
            *self.producer.end.get_mut()
        };
        let head = *self.consumer.read.get_mut();
        let tail = tail.min(head + self.capacity() as u64);
        for seq in head..tail {
            if self.committed.is_published(seq) {
                // SAFETY: published and never claimed, so still initialized.
                drop(unsafe { self.slot(seq).take_request() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Runs the producer half up to (not including) publish.
    fn stage(ring: &Ring<u64, u64>, value: u64) -> u64 {
        let seq = ring.claim().unwrap();
        ring.wait_for_vacancy(seq);
        unsafe { ring.slot(seq).fill(value) };
        seq
    }

    /// Consumer half: answers every index in `run` with `request * 10`.
    fn answer(ring: &Ring<u64, u64>, run: Range<u64>) {
        for seq in run {
            let slot = ring.slot(seq);
            unsafe {
                let request = slot.take_request();
                slot.put_response(request * 10);
                slot.signal.fire(Outcome::Responded);
            }
        }
    }

    /// Producer tail: collect the response and release the cell.
    fn collect(ring: &Ring<u64, u64>, seq: u64) -> u64 {
        let slot = ring.slot(seq);
        assert_eq!(slot.signal.wait(), Outcome::Responded);
        let response = unsafe { slot.take_response().unwrap() };
        slot.release(seq + ring.capacity() as u64);
        response
    }

    #[test]
    fn test_fresh_ring_has_nothing_published() {
        let ring: Ring<u64, u64> = Ring::new(8);
        for seq in 0..8 {
            assert!(!ring.committed.is_published(seq));
        }
        assert_eq!(unsafe { ring.claim_run() }, 0..0);
        assert_eq!(ring.try_claim_one(), Claim::Pending);
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_run_stops_at_gap() {
        let ring: Ring<u64, u64> = Ring::new(8);
        let a = stage(&ring, 1);
        let b = stage(&ring, 2);
        let c = stage(&ring, 3);
        ring.publish(a);
        ring.publish(c);

        // `b` is unpublished, so `c` must not be drained past it.
        assert_eq!(unsafe { ring.claim_run() }, 0..1);
        assert_eq!(unsafe { ring.claim_run() }, 1..1);

        ring.publish(b);
        assert_eq!(unsafe { ring.claim_run() }, 1..3);
        answer(&ring, 0..3);
        assert_eq!(collect(&ring, a), 10);
        assert_eq!(collect(&ring, b), 20);
        assert_eq!(collect(&ring, c), 30);
    }

    #[test]
    fn test_run_is_bounded_by_capacity() {
        let ring: Ring<u64, u64> = Ring::new(4);
        for v in 0..4 {
            let seq = stage(&ring, v);
            ring.publish(seq);
        }
        assert_eq!(unsafe { ring.claim_run() }, 0..4);
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_wraparound_does_not_match_stale_marks() {
        let ring: Ring<u64, u64> = Ring::new(4);
        let capacity = ring.capacity() as u64;

        for round in 0..capacity * 3 {
            let seq = stage(&ring, round);
            assert_eq!(seq, round);
            // The cell still carries `seq - capacity` from the previous era.
            assert_eq!(unsafe { ring.claim_run() }, seq..seq);
            assert_eq!(ring.try_claim_one(), Claim::Pending);

            ring.publish(seq);
            assert_eq!(ring.try_claim_one(), Claim::Ready(seq));
            answer(&ring, seq..seq + 1);
            assert_eq!(collect(&ring, seq), round * 10);
        }
    }

    #[test]
    fn test_claim_refused_after_seal() {
        let ring: Ring<u64, u64> = Ring::new(4);
        let seq = stage(&ring, 5);
        assert_eq!(ring.seal(), 1);
        assert_eq!(ring.seal(), 1);
        assert!(ring.claim().is_none());
        assert_eq!(ring.end(), Some(1));
        assert_eq!(ring.len(), 1);

        assert_eq!(ring.try_claim_one(), Claim::Pending);
        ring.publish(seq);
        assert_eq!(ring.try_claim_one(), Claim::Ready(0));
        assert_eq!(ring.try_claim_one(), Claim::Drained);
        assert!(ring.is_drained());
    }

    #[test]
    fn test_submit_and_wait_echo() {
        let ring: Arc<Ring<u64, u64>> = Arc::new(Ring::new(4));

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut answered = 0;
                while answered < 3 {
                    let run = unsafe { ring.claim_run() };
                    answered += run.end - run.start;
                    answer(&ring, run);
                    thread::yield_now();
                }
            })
        };

        assert_eq!(ring.submit_and_wait(1).unwrap(), 10);
        assert_eq!(ring.submit_and_wait(2).unwrap(), 20);
        assert_eq!(ring.submit_and_wait(3).unwrap(), 30);
        consumer.join().unwrap();
    }

    #[test]
    fn test_shutdown_hands_requests_back() {
        let ring: Arc<Ring<u64, u64>> = Arc::new(Ring::new(2));
        let started = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4u64)
            .map(|v| {
                let ring = Arc::clone(&ring);
                let started = Arc::clone(&started);
                thread::spawn(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    ring.submit_and_wait(v)
                })
            })
            .collect();

        while started.load(Ordering::SeqCst) < 4 || ring.len() < 4 {
            thread::yield_now();
        }

        let returned = unsafe { ring.shutdown() };
        assert_eq!(returned, 4);

        let mut handed_back: Vec<u64> = producers
            .into_iter()
            .map(|h| h.join().unwrap().unwrap_err().into_inner().unwrap())
            .collect();
        handed_back.sort_unstable();
        assert_eq!(handed_back, vec![0, 1, 2, 3]);
        assert!(ring.is_drained());
    }

    #[test]
    fn test_drop_frees_unclaimed_requests() {
        let token = Arc::new(());
        let ring: Ring<Arc<()>, ()> = Ring::new(4);
        for _ in 0..3 {
            let seq = ring.claim().unwrap();
            ring.wait_for_vacancy(seq);
            unsafe { ring.slot(seq).fill(Arc::clone(&token)) };
            ring.publish(seq);
        }
        // Index 3 claimed but never published: its cell holds nothing.
        let _unpublished = ring.claim().unwrap();

        let Claim::Ready(seq) = ring.try_claim_one() else {
            panic!("head should be published");
        };
        let taken = unsafe { ring.slot(seq).take_request() };
        assert_eq!(Arc::strong_count(&token), 4);

        drop(ring);
        assert_eq!(Arc::strong_count(&token), 2);
        drop(taken);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_single_slot_claims_are_unique() {
        let ring: Arc<Ring<u64, u64>> = Arc::new(Ring::new(64));
        for v in 0..48 {
            let seq = stage(&ring, v);
            ring.publish(seq);
        }

        let claimers: Vec<_> = (0..8)
            .map(|_| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    for _ in 0..6 {
                        loop {
                            if let Claim::Ready(seq) = ring.try_claim_one() {
                                mine.push(seq);
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<u64> = claimers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..48).collect::<Vec<_>>());
    }
}
