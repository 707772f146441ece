//! Core request/response ring primitives.
//!
//! This module contains the fixed-capacity ring, its commit track and slot
//! cells. Producers claim and publish slots, consumers drain them and fire
//! each slot's completion signal.
//!
//! Used by:
//! - [`crate::sync::mailbox`] - Thread-facing submitter and consumer handles

pub(crate) mod ring;
pub(crate) mod slot;
