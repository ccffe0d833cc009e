//! External event-state providers.
//!
//! The scoreboard provider polls one request per sport per tick and fans
//! the response out into per-event states and plays. The crypto provider
//! tracks spot prices and realised volatility for strike/expiry markets.
//! Poll cadence is dynamic: slow when nothing is live, fast during live
//! play, fastest in the closing minutes.

mod crypto;
mod scoreboard;

pub use crypto::CryptoProvider;
pub use scoreboard::ScoreboardProvider;

use std::time::Duration;

use serde::Deserialize;

/// Dynamic poll cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollCadence {
    pub idle_secs: u64,
    pub live_secs: u64,
    pub crunch_secs: u64,
    /// Fraction of game time remaining below which "crunch" pacing kicks in.
    pub crunch_fraction: f64,
}

impl Default for PollCadence {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            live_secs: 3,
            crunch_secs: 1,
            crunch_fraction: 0.05,
        }
    }
}

impl PollCadence {
    /// Interval for the current mix of tracked events.
    #[must_use]
    pub fn interval(&self, any_live: bool, any_crunch: bool) -> Duration {
        if any_crunch {
            Duration::from_secs(self.crunch_secs)
        } else if any_live {
            Duration::from_secs(self.live_secs)
        } else {
            Duration::from_secs(self.idle_secs)
        }
    }

    /// Is a live game inside the crunch window?
    #[must_use]
    pub fn is_crunch(&self, seconds_remaining: u32, regulation_seconds: u32) -> bool {
        if regulation_seconds == 0 {
            return false;
        }
        f64::from(seconds_remaining) / f64::from(regulation_seconds) <= self.crunch_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_prefers_fastest_applicable() {
        let cadence = PollCadence::default();
        assert_eq!(cadence.interval(false, false), Duration::from_secs(30));
        assert_eq!(cadence.interval(true, false), Duration::from_secs(3));
        assert_eq!(cadence.interval(true, true), Duration::from_secs(1));
    }

    #[test]
    fn crunch_window_is_final_five_percent() {
        let cadence = PollCadence::default();
        // NBA regulation 2880 s: crunch under 144 s remaining.
        assert!(cadence.is_crunch(144, 2_880));
        assert!(!cadence.is_crunch(145, 2_880));
    }
}
