//! Token-bucket rate limiter gating batch shipments.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket with whole-token integer accounting.
///
/// The bucket starts full and refills at `refill_rate` tokens per second up
/// to `capacity`. Contention is negligible — the shipper consumes one token
/// per batch.
pub struct TokenBucket {
    capacity: u64,
    refill_rate: u64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    /// Consumes `tokens` if available, returning whether the caller may
    /// proceed.
    pub fn allow(&self, tokens: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= tokens {
            state.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Returns how long to wait until `tokens` would be available, or zero
    /// if they already are.
    pub fn wait_time(&self, tokens: u64) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= tokens {
            return Duration::ZERO;
        }
        if self.refill_rate == 0 {
            // Nothing will ever refill; report a full-batch backoff and let
            // the caller re-check.
            return Duration::from_secs(1);
        }

        let needed = tokens - state.tokens;
        Duration::from_secs_f64(needed as f64 / self.refill_rate as f64)
    }

    /// Adds whole tokens for the elapsed time; the refill clock only
    /// advances when at least one token accrued, so fractional progress is
    /// never lost.
    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        let accrued = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;

        if accrued > 0 {
            state.tokens = self.capacity.min(state.tokens + accrued);
            state.last_refill = Instant::now();
        }
    }
}
