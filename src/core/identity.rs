// src/core/identity.rs

//! Strictly increasing sequence numbers scoped to a single owner.

use crate::core::errors::{ClientError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// A per-owner counter. Each connection and session holds its own instances;
/// there is no process-wide sequence.
#[derive(Debug, Default)]
pub struct IdentityGenerator {
    next: AtomicU64,
}

impl IdentityGenerator {
    /// Creates a generator whose first value is `0`.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a generator whose first value is `origin`.
    pub fn starting_at(origin: u64) -> Self {
        Self {
            next: AtomicU64::new(origin),
        }
    }

    /// Returns the next value in the sequence.
    ///
    /// Fails with [`ClientError::Overflow`] once the counter is exhausted instead
    /// of wrapping back to zero.
    pub fn next(&self) -> Result<u64> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1))
            .map_err(|_| ClientError::Overflow)
    }

    /// The value the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}
