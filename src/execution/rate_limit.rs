//! Lock-free token-bucket rate limiter, one per venue per process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Micro-tokens per token, for fractional refill without floats in the
/// atomic path.
const MICRO: u64 = 1_000_000;

/// Token bucket refilled continuously at a sustained rate, with a burst
/// capacity. `try_acquire` never blocks; callers sleep on the returned
/// retry hint.
pub struct TokenBucket {
    /// Sustained refill rate, micro-tokens per millisecond.
    refill_per_ms: u64,
    /// Capacity in micro-tokens.
    capacity: u64,
    /// Available micro-tokens.
    tokens: AtomicU64,
    /// Last refill instant, milliseconds from an arbitrary epoch.
    last_refill_ms: AtomicU64,
    /// Monotonic clock base.
    started: std::time::Instant,
}

impl TokenBucket {
    /// `sustained_per_sec` requests per second, bursting to `burst`.
    #[must_use]
    pub fn new(sustained_per_sec: u32, burst: u32) -> Self {
        Self {
            refill_per_ms: u64::from(sustained_per_sec) * MICRO / 1_000,
            capacity: u64::from(burst) * MICRO,
            tokens: AtomicU64::new(u64::from(burst) * MICRO),
            last_refill_ms: AtomicU64::new(0),
            started: std::time::Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Credit elapsed time to the bucket. One caller wins each interval;
    /// the rest see the updated balance.
    fn refill(&self) {
        let now = self.now_ms();
        let last = self.last_refill_ms.load(Ordering::Acquire);
        if now <= last {
            return;
        }
        if self
            .last_refill_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let credit = (now - last).saturating_mul(self.refill_per_ms);
            let mut current = self.tokens.load(Ordering::Acquire);
            loop {
                let next = (current + credit).min(self.capacity);
                match self.tokens.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(seen) => current = seen,
                }
            }
        }
    }

    /// Take one token. On refusal returns the wait before the next token
    /// accrues.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.refill();

        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < MICRO {
                let deficit = MICRO - current;
                let wait_ms = deficit.div_ceil(self.refill_per_ms.max(1));
                return Err(Duration::from_millis(wait_ms.max(1)));
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - MICRO,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => current = seen,
            }
        }
    }

    /// Acquire a token, sleeping as needed, up to `deadline_ms` of total
    /// waiting. Returns false if the deadline would be exceeded.
    pub async fn acquire_within(&self, deadline: Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            match self.try_acquire() {
                Ok(()) => return true,
                Err(wait) => {
                    if start.elapsed() + wait > deadline {
                        return false;
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
