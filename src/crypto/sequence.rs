//! Send sequence counter for the shared UDP socket
//!
//! One counter serves every session of a process. Its values feed the AEAD
//! nonce, so a value must never be handed out twice.

use super::{random_u64, CryptoError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic, non-wrapping 64-bit counter
///
/// Seeded at a random point in the lower half of the range, so at least 2^63
/// values are available before [`CryptoError::NonceExhausted`] is returned.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    /// Create a counter with a random seed
    pub fn random() -> Result<Self, CryptoError> {
        Ok(Self::starting_at(random_u64()? >> 1))
    }

    /// Create a counter whose first value is `seed`
    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    /// Draw the next value
    pub fn next(&self) -> Result<u64, CryptoError> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1))
            .map_err(|_| CryptoError::NonceExhausted)
    }

    /// Value the next call to [`next`](Self::next) will return
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}
