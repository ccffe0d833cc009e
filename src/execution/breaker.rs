//! Per-venue circuit breaker for order placement.
//!
//! Trips on consecutive non-rate-limit failures and blocks placements for a
//! cooldown, then lets a single half-open probe through. Rate-limit (429)
//! responses never count.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
    venue: &'static str,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(venue: &'static str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
            venue,
        }
    }

    /// True when a placement may proceed. An expired cooldown transitions
    /// to half-open and admits exactly one probe.
    #[must_use]
    pub fn allows(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    info!(venue = self.venue, "circuit breaker half-open, probing");
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if matches!(*state, BreakerState::HalfOpen) {
            info!(venue = self.venue, "circuit breaker closed after probe");
        }
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    /// A probe that ended without a venue verdict (rate-limited to its
    /// deadline) reopens with no extra cooldown so the next placement
    /// probes again.
    pub fn abandon_probe(&self) {
        let mut state = self.state.lock();
        if matches!(*state, BreakerState::HalfOpen) {
            *state = BreakerState::Open {
                until: Instant::now(),
            };
        }
    }

    /// Count a non-429 failure; trips when the threshold is reached.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let failures = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => consecutive_failures + 1,
            // A failed half-open probe reopens immediately.
            BreakerState::HalfOpen => self.threshold,
            BreakerState::Open { .. } => return,
        };

        if failures >= self.threshold {
            warn!(
                venue = self.venue,
                failures, "circuit breaker tripped, pausing placements"
            );
            *state = BreakerState::Open {
                until: Instant::now() + self.cooldown,
            };
        } else {
            *state = BreakerState::Closed {
                consecutive_failures: failures,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new("direct", 5, cooldown)
    }

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let b = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            b.record_failure();
            assert!(b.allows());
        }
        b.record_failure();
        assert!(!b.allows());
    }

    #[test]
    fn success_resets_the_count() {
        let b = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            b.record_failure();
        }
        b.record_success();
        for _ in 0..4 {
            b.record_failure();
            assert!(b.allows());
        }
    }

    #[test]
    fn half_open_admits_one_probe() {
        let b = breaker(Duration::from_millis(0));
        for _ in 0..5 {
            b.record_failure();
        }
        // Cooldown of zero: first check transitions to half-open.
        assert!(b.allows());
        // Second concurrent placement is refused while the probe is out.
        assert!(!b.allows());

        b.record_success();
        assert!(b.allows());
    }

    #[test]
    fn abandoned_probe_reopens_without_cooldown() {
        let b = breaker(Duration::from_millis(0));
        for _ in 0..5 {
            b.record_failure();
        }
        assert!(b.allows()); // half-open probe goes out
        b.abandon_probe(); // probe was rate-limited, no verdict
        assert!(b.allows()); // next placement probes again
    }

    #[test]
    fn failed_probe_reopens() {
        let b = breaker(Duration::from_millis(0));
        for _ in 0..5 {
            b.record_failure();
        }
        assert!(b.allows()); // half-open probe
        b.record_failure();
        // Reopened; zero cooldown means the next check probes again.
        assert!(b.allows());
        assert!(!b.allows());
    }
}
