//! # batchring - request/response batching ring
//!
//! A fixed-capacity ring that lets many threads submit a request, block until
//! a consumer processes it, and receive their own response. Consumers drain
//! everything that accumulated since their last pass, so one expensive
//! operation (a flush, a syscall, a lock acquisition) is paid once per batch
//! instead of once per caller.
//!
//! ## Design
//!
//! - Power-of-two ring of slots, each holding a request, a response and a
//!   one-shot completion signal
//! - Producers reserve logical indices with a single `fetch_add` and publish
//!   through a per-slot commit track, without locks
//! - Full ring: producers spin with backoff until a slot frees up
//! - Consumers drain in strict submission order; a batch never skips an
//!   unpublished slot
//! - Submitters block on their slot's completion signal (spin, then park)
//!
//! ## Consumers
//!
//! - [`channel`] pairs submitters with one [`BatchConsumer`] that claims
//!   whole contiguous runs with a single cursor store
//! - [`shared_channel`] pairs them with a cloneable [`SharedConsumer`] that
//!   claims one request per call via compare-and-swap
//!
//! ## Example
//!
//! ```
//! use batchring::{Config, Timeout, channel};
//!
//! let (submitter, consumer) = channel::<u32, u32>(Config::with_slots(64)?);
//!
//! let worker = std::thread::spawn(move || {
//!     let mut total = 0;
//!     while !consumer.is_drained() {
//!         let mut batch = consumer.consume_batch_timeout(Timeout::Infinite);
//!         for element in &mut batch {
//!             total += *element.request();
//!             element.respond(total);
//!         }
//!         consumer.commit(batch);
//!     }
//! });
//!
//! assert_eq!(submitter.submit_and_wait(2).unwrap(), 2);
//! assert_eq!(submitter.submit_and_wait(3).unwrap(), 5);
//! drop(submitter); // closes the mailbox, the worker drains and exits
//! worker.join().unwrap();
//! # Ok::<(), batchring::ConfigError>(())
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod sync;

mod mailbox;
mod signal;
mod trace;

pub use config::Config;
pub use error::{ConfigError, SubmitError};
pub use sync::mailbox::{
    BatchConsumer, Element, SharedConsumer, Submitter, Timeout, channel, shared_channel,
};
pub use trace::init_tracing;
