//! Normalized market price snapshots emitted to consumers.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::book::LocalOrderBook;
use super::id::{EventId, MarketId};
use super::market::Venue;
use super::money::{Cents, Price, Volume};

/// Validation failures for [`MarketPrice`] construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PriceError {
    #[error("prices out of order: bid {bid} > ask {ask}")]
    Crossed { bid: Decimal, ask: Decimal },

    #[error("price {price} outside [0, 1]")]
    OutOfRange { price: Decimal },

    #[error("negative liquidity")]
    NegativeLiquidity,
}

/// Snapshot of one market's top-of-book, normalized to [0, 1] prices.
///
/// Derived from a [`LocalOrderBook`]; never persisted as a source of truth.
/// Consumers drop snapshots whose venue `sequence` is older than one already
/// seen for the same market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPrice {
    pub venue: Venue,
    pub market_id: MarketId,
    pub event_id: EventId,
    /// Team or asset the YES contract pays out on.
    pub contract_entity: String,
    pub yes_bid: Price,
    pub yes_ask: Price,
    pub yes_bid_size: Volume,
    pub yes_ask_size: Volume,
    pub mid: Price,
    pub liquidity: Volume,
    pub sequence: u64,
    pub updated_utc: DateTime<Utc>,
}

impl MarketPrice {
    /// Validate the `0 <= bid <= ask <= 1` and `liquidity >= 0` invariants.
    pub fn validate(&self) -> Result<(), PriceError> {
        for price in [self.yes_bid, self.yes_ask] {
            if price < Decimal::ZERO || price > Decimal::ONE {
                return Err(PriceError::OutOfRange { price });
            }
        }
        if self.yes_bid > self.yes_ask {
            return Err(PriceError::Crossed {
                bid: self.yes_bid,
                ask: self.yes_ask,
            });
        }
        if self.liquidity < Decimal::ZERO {
            return Err(PriceError::NegativeLiquidity);
        }
        Ok(())
    }

    /// Build from a two-sided local book. `None` when either side is empty.
    #[must_use]
    pub fn from_book(
        book: &LocalOrderBook,
        event_id: EventId,
        contract_entity: impl Into<String>,
    ) -> Option<Self> {
        let (bid_cents, bid_size) = book.best_bid()?;
        let (ask_cents, ask_size) = book.best_ask()?;

        let yes_bid = Decimal::new(bid_cents, 2);
        let yes_ask = Decimal::new(ask_cents, 2);

        Some(Self {
            venue: book.venue(),
            market_id: book.market_id().clone(),
            event_id,
            contract_entity: contract_entity.into(),
            yes_bid,
            yes_ask,
            yes_bid_size: Decimal::from(bid_size),
            yes_ask_size: Decimal::from(ask_size),
            mid: (yes_bid + yes_ask) / Decimal::TWO,
            liquidity: Decimal::from(book.top_liquidity()),
            sequence: book.sequence(),
            updated_utc: book.last_update_utc(),
        })
    }

    /// Freshness check with strict inequality: a price exactly at the TTL
    /// boundary is already stale.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.updated_utc < ttl
    }

    #[must_use]
    pub fn yes_bid_cents(&self) -> Cents {
        Cents::from_price(self.yes_bid).unwrap_or(Cents::ZERO)
    }

    #[must_use]
    pub fn yes_ask_cents(&self) -> Cents {
        Cents::from_price(self.yes_ask).unwrap_or(Cents::PAYOUT)
    }

    /// NO ask implied by the YES bid (`1 - yes_bid`), in cents.
    #[must_use]
    pub fn no_ask_cents(&self) -> Cents {
        Cents::PAYOUT - self.yes_bid_cents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Venue;
    use rust_decimal_macros::dec;

    fn price(bid: Decimal, ask: Decimal) -> MarketPrice {
        MarketPrice {
            venue: Venue::Direct,
            market_id: MarketId::from("m1"),
            event_id: EventId::from("e1"),
            contract_entity: "Lakers".into(),
            yes_bid: bid,
            yes_ask: ask,
            yes_bid_size: dec!(500),
            yes_ask_size: dec!(500),
            mid: (bid + ask) / dec!(2),
            liquidity: dec!(1000),
            sequence: 1,
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn validate_accepts_ordered_prices() {
        assert!(price(dec!(0.70), dec!(0.72)).validate().is_ok());
    }

    #[test]
    fn validate_rejects_crossed_and_out_of_range() {
        assert_eq!(
            price(dec!(0.75), dec!(0.72)).validate(),
            Err(PriceError::Crossed {
                bid: dec!(0.75),
                ask: dec!(0.72)
            })
        );
        assert!(price(dec!(0.70), dec!(1.02)).validate().is_err());
    }

    #[test]
    fn staleness_is_strict_at_the_boundary() {
        let p = price(dec!(0.70), dec!(0.72));
        let ttl = Duration::seconds(30);
        assert!(p.is_fresh(p.updated_utc + Duration::seconds(29), ttl));
        // Exactly at the TTL: rejected.
        assert!(!p.is_fresh(p.updated_utc + ttl, ttl));
    }

    #[test]
    fn cents_conversions() {
        let p = price(dec!(0.45), dec!(0.47));
        assert_eq!(p.yes_ask_cents().value(), 47);
        assert_eq!(p.no_ask_cents().value(), 55);
    }

    #[test]
    fn from_book_requires_two_sides() {
        use crate::domain::book::LocalOrderBook;
        let mut book = LocalOrderBook::new(Venue::Proxied, MarketId::from("tok-1"));
        book.apply_snapshot(vec![(45, 300)], vec![], 1, Utc::now());
        assert!(MarketPrice::from_book(&book, EventId::from("e1"), "BTC").is_none());

        book.apply_snapshot(vec![(45, 300)], vec![(47, 200)], 2, Utc::now());
        let p = MarketPrice::from_book(&book, EventId::from("e1"), "BTC").unwrap();
        assert_eq!(p.yes_bid, dec!(0.45));
        assert_eq!(p.yes_ask, dec!(0.47));
        assert_eq!(p.mid, dec!(0.46));
        assert_eq!(p.liquidity, dec!(500));
    }
}
