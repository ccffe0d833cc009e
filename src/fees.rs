//! Venue fee schedules.
//!
//! The direct venue charges integer cents by price tier: tiny notionals pay
//! a flat minimum, everything else pays roughly `7% * p * (1 - p)` of payout
//! per contract (about 1% of notional near mid prices). The proxied venue
//! charges a flat percentage of notional on entry and on exit.
//!
//! Edge math uses the exact fractional rate; money attribution uses the
//! integer-cent schedule with venue-favorable (ceiling) rounding.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::{Cents, Venue};

/// Fee configuration, defaults match the live venues.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeModel {
    /// Direct-venue multiplier `m` in `m * p * (1 - p)` per contract.
    #[serde(default = "default_direct_multiplier")]
    pub direct_multiplier: f64,
    /// Flat fee in cents for direct-venue orders at or below `$1` notional.
    #[serde(default = "default_direct_flat_cents")]
    pub direct_flat_cents: i64,
    /// Proxied-venue taker rate per side (entry and exit each).
    #[serde(default = "default_proxied_rate")]
    pub proxied_rate: f64,
    /// Which real venue the paper venue mirrors for fee attribution.
    #[serde(default = "default_paper_mirrors")]
    pub paper_mirrors: Venue,
}

fn default_direct_multiplier() -> f64 {
    0.07
}

fn default_direct_flat_cents() -> i64 {
    100
}

fn default_proxied_rate() -> f64 {
    0.02
}

fn default_paper_mirrors() -> Venue {
    Venue::Direct
}

impl Default for FeeModel {
    fn default() -> Self {
        Self {
            direct_multiplier: default_direct_multiplier(),
            direct_flat_cents: default_direct_flat_cents(),
            proxied_rate: default_proxied_rate(),
            paper_mirrors: default_paper_mirrors(),
        }
    }
}

impl FeeModel {
    fn effective_venue(&self, venue: Venue) -> Venue {
        match venue {
            Venue::Paper => self.paper_mirrors,
            other => other,
        }
    }

    /// Per-side fee as a fraction of contract payout, at a given price.
    ///
    /// This is the quantity subtracted from raw edge: one entry side plus
    /// one exit side makes the round trip.
    #[must_use]
    pub fn side_rate(&self, venue: Venue, price: Decimal) -> f64 {
        let p = price.to_f64().unwrap_or(0.0).clamp(0.0, 1.0);
        match self.effective_venue(venue) {
            Venue::Direct => self.direct_multiplier * p * (1.0 - p),
            Venue::Proxied => self.proxied_rate * p,
            Venue::Paper => unreachable!("paper resolves to a real venue"),
        }
    }

    /// Entry plus exit fees as a fraction of payout.
    #[must_use]
    pub fn round_trip_rate(&self, venue: Venue, price: Decimal) -> f64 {
        2.0 * self.side_rate(venue, price)
    }

    /// Integer-cent fee charged on one order.
    #[must_use]
    pub fn order_fee(&self, venue: Venue, price: Cents, qty: i64) -> Cents {
        if qty <= 0 {
            return Cents::ZERO;
        }
        let notional = price.times(qty);
        match self.effective_venue(venue) {
            Venue::Direct => {
                if notional <= Cents::PAYOUT {
                    return Cents::new(self.direct_flat_cents);
                }
                let p = price.value();
                // m * p * (100 - p) * qty / 100 cents, rounded up.
                let numerator = self.direct_multiplier * (p * (100 - p) * qty) as f64 / 100.0;
                Cents::new(numerator.ceil() as i64)
            }
            Venue::Proxied => {
                Cents::new((notional.value() as f64 * self.proxied_rate).ceil() as i64)
            }
            Venue::Paper => unreachable!("paper resolves to a real venue"),
        }
    }
}
