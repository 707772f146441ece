//! Error types for mailbox construction and submission.

use std::fmt;

use thiserror::Error;

/// Invalid mailbox capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Size exponent would produce a ring larger than supported.
    #[error("size exponent {exponent} exceeds the maximum of {max}")]
    ExponentTooLarge {
        /// Requested exponent.
        exponent: u32,
        /// Largest accepted exponent.
        max: u32,
    },
    /// A ring must hold at least one slot.
    #[error("slot count must be non-zero")]
    ZeroSlots,
    /// Slot count rounds up past the largest supported ring.
    #[error("slot count {slots} exceeds the maximum of {max}")]
    TooManySlots {
        /// Requested slot count.
        slots: usize,
        /// Largest accepted slot count.
        max: usize,
    },
}

/// Failure of [`Submitter::submit_and_wait`](crate::sync::mailbox::Submitter::submit_and_wait).
#[derive(Error)]
pub enum SubmitError<T> {
    /// The mailbox stopped accepting requests, or shut down before any
    /// consumer claimed this one. The request is handed back untouched.
    #[error("mailbox is closed")]
    Closed(T),
    /// A consumer claimed the request and released it without a response.
    #[error("consumer released the request without a response")]
    Abandoned,
}

impl<T> SubmitError<T> {
    /// Recovers the request if it never reached a consumer.
    pub fn into_inner(self) -> Option<T> {
        match self {
            Self::Closed(request) => Some(request),
            Self::Abandoned => None,
        }
    }

    /// Returns `true` if the mailbox was closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl<T> fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Abandoned => f.write_str("Abandoned"),
        }
    }
}

impl<T: PartialEq> PartialEq for SubmitError<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Closed(a), Self::Closed(b)) => a == b,
            (Self::Abandoned, Self::Abandoned) => true,
            _ => false,
        }
    }
}
