//! Thread-facing handles for in-process request batching.
//!
//! This module provides the submitter and consumer ends of a mailbox for
//! communication between threads within the same process.

pub mod mailbox;
