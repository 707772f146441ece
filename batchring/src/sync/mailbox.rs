//! Request/response mailbox for in-process batching.
//!
//! Many threads submit a request and block until a consumer answers it. The
//! consumer drains whatever has accumulated, processes it as one batch, and
//! wakes every submitter with its own response.
//!
//! # Overview
//!
//! - [`Submitter`] - Request end (clone freely, call from any thread)
//! - [`BatchConsumer`] - Drains contiguous runs of requests (single consumer)
//! - [`SharedConsumer`] - Claims one request per call (many consumers)
//! - [`Element`] - A claimed request awaiting its response
//!
//! The two consumer kinds come from different constructors, so one mailbox
//! never mixes the batch and single-slot disciplines.
//!
//! # Example
//!
//! ```
//! use batchring::{Config, sync::mailbox};
//!
//! let (submitter, consumer) = mailbox::channel::<u64, u64>(Config::from_exponent(4)?);
//!
//! let worker = std::thread::spawn(move || {
//!     let mut total = 0;
//!     for mut element in consumer.consume_batch_timeout(mailbox::Timeout::Infinite) {
//!         total += *element.request();
//!         element.respond(total);
//!         element.commit();
//!     }
//! });
//!
//! assert_eq!(submitter.submit_and_wait(5).unwrap(), 5);
//! worker.join().unwrap();
//! # Ok::<(), batchring::ConfigError>(())
//! ```
//!
//! # Shutdown
//!
//! [`BatchConsumer::close`] / [`SharedConsumer::close`] stop new submissions
//! while consumers finish what was already submitted. Dropping the last
//! [`Submitter`] closes the mailbox too. Dropping the last consumer handle
//! hands every unconsumed request back to its submitter as
//! [`SubmitError::Closed`].

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_utils::Backoff;
use minstant::Instant;

use crate::config::Config;
use crate::error::SubmitError;
use crate::mailbox::ring::{Claim, Ring};
use crate::signal::Outcome;
use crate::trace::{debug, trace, warn};

/// Timeout specification for blocking consumer operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(Instant::now() + d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Ring plus handle counts driving close and shutdown.
struct Shared<Req, Resp> {
    ring: Ring<Req, Resp>,
    submitters: AtomicUsize,
    consumers: AtomicUsize,
}

impl<Req, Resp> Shared<Req, Resp> {
    fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            ring: Ring::new(config.capacity()),
            submitters: AtomicUsize::new(1),
            consumers: AtomicUsize::new(1),
        })
    }

    fn drop_submitter(&self) {
        if self.submitters.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.ring.seal();
        }
    }

    fn drop_consumer(&self) {
        if self.consumers.fetch_sub(1, Ordering::AcqRel) == 1 {
            // SAFETY: that was the last consumer handle, and elements borrow
            // their handle, so nothing can claim from the ring any more.
            unsafe { self.ring.shutdown() };
        }
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Creates a mailbox drained by a single [`BatchConsumer`].
#[must_use]
pub fn channel<Req: Send, Resp: Send>(
    config: Config,
) -> (Submitter<Req, Resp>, BatchConsumer<Req, Resp>) {
    let shared = Shared::new(config);
    debug!(capacity = config.capacity(), "batch mailbox created");
    let submitter = Submitter {
        shared: Arc::clone(&shared),
    };
    let consumer = BatchConsumer {
        shared,
        _unsync: PhantomData,
    };
    (submitter, consumer)
}

/// Creates a mailbox drained by any number of [`SharedConsumer`] clones.
#[must_use]
pub fn shared_channel<Req: Send, Resp: Send>(
    config: Config,
) -> (Submitter<Req, Resp>, SharedConsumer<Req, Resp>) {
    let shared = Shared::new(config);
    debug!(capacity = config.capacity(), "shared mailbox created");
    let submitter = Submitter {
        shared: Arc::clone(&shared),
    };
    let consumer = SharedConsumer { shared };
    (submitter, consumer)
}

/// Request end of a mailbox.
///
/// Cheap to clone; every clone submits into the same ring. The mailbox
/// closes when the last clone is dropped.
pub struct Submitter<Req, Resp> {
    shared: Arc<Shared<Req, Resp>>,
}

impl<Req: Send, Resp: Send> Submitter<Req, Resp> {
    /// Submits `request` and blocks until a consumer answers it.
    ///
    /// Spins while the ring is full, then waits for the response. There is
    /// no deadline: a stalled consumer stalls every submitter.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::Closed`] if the mailbox is closed, or every consumer
    ///   went away before this request was claimed. The request is returned.
    /// - [`SubmitError::Abandoned`] if a consumer released the request
    ///   without responding.
    pub fn submit_and_wait(&self, request: Req) -> Result<Resp, SubmitError<Req>> {
        self.shared.ring.submit_and_wait(request)
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Requests submitted and not yet claimed by a consumer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    /// Returns `true` if nothing is waiting for a consumer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the mailbox refuses new requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.ring.is_sealed()
    }
}

impl<Req, Resp> Clone for Submitter<Req, Resp> {
    fn clone(&self) -> Self {
        self.shared.submitters.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Req, Resp> Drop for Submitter<Req, Resp> {
    fn drop(&mut self) {
        self.shared.drop_submitter();
    }
}

impl<Req, Resp> fmt::Debug for Submitter<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submitter")
            .field("capacity", &self.shared.ring.capacity())
            .field("closed", &self.shared.ring.is_sealed())
            .finish()
    }
}

/// Single consumer that drains requests in contiguous batches.
///
/// # Thread Safety
///
/// `BatchConsumer` is [`Send`] but neither [`Sync`] nor [`Clone`]: the batch
/// path advances the read cursor with a plain store, which is only correct
/// with exactly one caller.
pub struct BatchConsumer<Req, Resp> {
    shared: Arc<Shared<Req, Resp>>,
    _unsync: PhantomUnsync,
}

impl<Req: Send, Resp: Send> BatchConsumer<Req, Resp> {
    /// Claims every request published at the head of the ring, in order.
    ///
    /// Never blocks. The batch stops at the first request that is claimed
    /// but not yet published, and is empty if there is none at the head.
    #[must_use]
    pub fn consume_batch(&self) -> Vec<Element<'_, Req, Resp>> {
        let ring = &self.shared.ring;
        // SAFETY: this handle is the ring's only consumer and is not Sync.
        let run = unsafe { ring.claim_run() };
        if !run.is_empty() {
            trace!(start = run.start, len = run.end - run.start, "batch drained");
        }
        run.map(|seq| {
            // SAFETY: `claim_run` handed these indices to us.
            unsafe { Element::claimed(ring, seq) }
        })
        .collect()
    }

    /// Spins until a non-empty batch is available.
    ///
    /// Returns an empty batch on timeout, or once the mailbox is closed and
    /// fully drained.
    #[must_use]
    pub fn consume_batch_timeout(&self, timeout: Timeout) -> Vec<Element<'_, Req, Resp>> {
        let deadline = timeout.deadline();
        let backoff = Backoff::new();
        loop {
            let batch = self.consume_batch();
            if !batch.is_empty() || self.is_drained() {
                return batch;
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return batch;
            }
            backoff.snooze();
        }
    }

    /// Fires every element, waking its submitter.
    pub fn commit<'e>(&self, elements: impl IntoIterator<Item = Element<'e, Req, Resp>>)
    where
        Req: 'e,
        Resp: 'e,
    {
        commit(elements);
    }

    /// Stops accepting new requests. Already submitted ones can still be drained.
    pub fn close(&self) {
        self.shared.ring.seal();
    }

    /// Returns `true` once the mailbox refuses new requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.ring.is_sealed()
    }

    /// Returns `true` once closed and every submitted request was consumed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.shared.ring.is_drained()
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Requests submitted and not yet consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    /// Returns `true` if nothing is waiting for a consumer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Req, Resp> Drop for BatchConsumer<Req, Resp> {
    fn drop(&mut self) {
        self.shared.drop_consumer();
    }
}

/// Consumer that claims one request per call; clone it across threads.
///
/// Claims use compare-and-swap on the read cursor, so any number of
/// clones may consume concurrently and each request goes to exactly one.
pub struct SharedConsumer<Req, Resp> {
    shared: Arc<Shared<Req, Resp>>,
}

impl<Req: Send, Resp: Send> SharedConsumer<Req, Resp> {
    /// Spins until a request is claimed.
    ///
    /// Returns `None` once the mailbox is closed and fully drained.
    #[must_use]
    pub fn consume_one(&self) -> Option<Element<'_, Req, Resp>> {
        self.consume_one_timeout(Timeout::Infinite)
    }

    /// Like [`consume_one`](Self::consume_one), but gives up after `timeout`.
    #[must_use]
    pub fn consume_one_timeout(&self, timeout: Timeout) -> Option<Element<'_, Req, Resp>> {
        let ring = &self.shared.ring;
        let deadline = timeout.deadline();
        let backoff = Backoff::new();
        loop {
            match ring.try_claim_one() {
                // SAFETY: the CAS on the read cursor gave `seq` to us alone.
                Claim::Ready(seq) => return Some(unsafe { Element::claimed(ring, seq) }),
                Claim::Drained => return None,
                Claim::Pending => {}
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Fires every element, waking its submitter.
    pub fn commit<'e>(&self, elements: impl IntoIterator<Item = Element<'e, Req, Resp>>)
    where
        Req: 'e,
        Resp: 'e,
    {
        commit(elements);
    }

    /// Stops accepting new requests. Already submitted ones can still be drained.
    pub fn close(&self) {
        self.shared.ring.seal();
    }

    /// Returns `true` once the mailbox refuses new requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.ring.is_sealed()
    }

    /// Returns `true` once closed and every submitted request was consumed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.shared.ring.is_drained()
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    /// Requests submitted and not yet claimed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    /// Returns `true` if nothing is waiting for a consumer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Req, Resp> Clone for SharedConsumer<Req, Resp> {
    fn clone(&self) -> Self {
        self.shared.consumers.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Req, Resp> Drop for SharedConsumer<Req, Resp> {
    fn drop(&mut self) {
        self.shared.drop_consumer();
    }
}

fn commit<'e, Req: 'e, Resp: 'e>(elements: impl IntoIterator<Item = Element<'e, Req, Resp>>) {
    for element in elements {
        element.commit();
    }
}

/// A claimed request.
///
/// The element owns the request until it is committed. Its submitter stays
/// blocked until then. Committing, or dropping the element, fires the slot
/// exactly once: with the response if [`respond`](Self::respond) was called,
/// otherwise the submitter receives [`SubmitError::Abandoned`].
pub struct Element<'a, Req, Resp> {
    ring: &'a Ring<Req, Resp>,
    seq: u64,
    request: Req,
    response: Option<Resp>,
    fired: bool,
}

impl<'a, Req, Resp> Element<'a, Req, Resp> {
    /// # Safety
    ///
    /// Caller must have claimed `seq` on the consumer side.
    unsafe fn claimed(ring: &'a Ring<Req, Resp>, seq: u64) -> Self {
        // SAFETY: claimed and published, so the request is initialized and ours.
        let request = unsafe { ring.slot(seq).take_request() };
        Self {
            ring,
            seq,
            request,
            response: None,
            fired: false,
        }
    }

    /// Logical index of the request; strictly increasing in submission order.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The submitted request.
    #[must_use]
    pub fn request(&self) -> &Req {
        &self.request
    }

    /// Mutable access to the request, e.g. to move buffers out of it.
    pub fn request_mut(&mut self) -> &mut Req {
        &mut self.request
    }

    /// Sets the response delivered on commit, replacing any earlier one.
    pub fn respond(&mut self, response: Resp) {
        self.response = Some(response);
    }

    /// The response set so far, if any.
    #[must_use]
    pub fn response(&self) -> Option<&Resp> {
        self.response.as_ref()
    }

    /// Wakes the submitter with the response.
    pub fn commit(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if self.fired {
            return;
        }
        self.fired = true;
        let slot = self.ring.slot(self.seq);
        // SAFETY: we hold the slot on the consumer side and fire it once,
        // guarded by `fired`. The element touches nothing in the slot after.
        unsafe {
            let outcome = match self.response.take() {
                Some(response) => {
                    slot.put_response(response);
                    Outcome::Responded
                }
                None => Outcome::Abandoned,
            };
            slot.signal.fire(outcome);
        }
    }
}

impl<Req, Resp> Drop for Element<'_, Req, Resp> {
    fn drop(&mut self) {
        if !self.fired && self.response.is_none() {
            warn!(seq = self.seq, "element dropped without a response");
        }
        self.fire();
    }
}

impl<Req: fmt::Debug, Resp: fmt::Debug> fmt::Debug for Element<'_, Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("seq", &self.seq)
            .field("request", &self.request)
            .field("response", &self.response)
            .finish()
    }
}
