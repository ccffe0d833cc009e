//! Local orderbook state with delta reconciliation.
//!
//! Books are keyed by `(venue, market_id)` and hold integer-cent price
//! ladders. Venues that publish only bids on both outcomes (the direct
//! venue's yes/no ladders) get YES asks derived as `ask[100 - p] = no_bid[p]`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::id::MarketId;
use super::market::Venue;
use crate::error::FeedError;

/// Book side for delta messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Orderbook for one market on one venue, prices in cents.
#[derive(Debug, Clone)]
pub struct LocalOrderBook {
    venue: Venue,
    market_id: MarketId,
    /// price_cents -> size; zero-size levels are removed.
    bids: BTreeMap<i64, i64>,
    asks: BTreeMap<i64, i64>,
    sequence: u64,
    last_update_utc: DateTime<Utc>,
}

impl LocalOrderBook {
    #[must_use]
    pub fn new(venue: Venue, market_id: MarketId) -> Self {
        Self {
            venue,
            market_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: 0,
            last_update_utc: Utc::now(),
        }
    }

    #[must_use]
    pub const fn venue(&self) -> Venue {
        self.venue
    }

    #[must_use]
    pub const fn market_id(&self) -> &MarketId {
        &self.market_id
    }

    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub const fn last_update_utc(&self) -> DateTime<Utc> {
        self.last_update_utc
    }

    /// Replace state from a full snapshot of bid and ask ladders.
    pub fn apply_snapshot(
        &mut self,
        bids: impl IntoIterator<Item = (i64, i64)>,
        asks: impl IntoIterator<Item = (i64, i64)>,
        sequence: u64,
        at: DateTime<Utc>,
    ) {
        self.bids = bids.into_iter().filter(|&(_, size)| size > 0).collect();
        self.asks = asks.into_iter().filter(|&(_, size)| size > 0).collect();
        self.sequence = sequence;
        self.last_update_utc = at;
    }

    /// Replace state from a snapshot that carries only YES bids and NO bids.
    ///
    /// YES asks are the mirror of NO bids: `ask[100 - p] = no_bid[p]`.
    pub fn apply_two_sided_bid_snapshot(
        &mut self,
        yes_bids: impl IntoIterator<Item = (i64, i64)>,
        no_bids: impl IntoIterator<Item = (i64, i64)>,
        sequence: u64,
        at: DateTime<Utc>,
    ) {
        let asks = no_bids.into_iter().map(|(p, size)| (100 - p, size));
        self.apply_snapshot(yes_bids, asks, sequence, at);
    }

    /// Apply an incremental `{price -> size delta}` change.
    ///
    /// The delta must carry `sequence == self.sequence + 1`; anything else is
    /// a gap and the caller must request a fresh snapshot.
    pub fn apply_delta(
        &mut self,
        side: BookSide,
        price_cents: i64,
        delta: i64,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), FeedError> {
        let expected = self.sequence + 1;
        if sequence != expected {
            return Err(FeedError::SequenceGap {
                market_id: self.market_id.to_string(),
                expected,
                got: sequence,
            });
        }

        let ladder = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        let size = ladder.get(&price_cents).copied().unwrap_or(0) + delta;
        if size > 0 {
            ladder.insert(price_cents, size);
        } else {
            ladder.remove(&price_cents);
        }

        self.sequence = sequence;
        self.last_update_utc = at;
        Ok(())
    }

    /// Overwrite one level with an absolute size, for venues that publish
    /// level states instead of deltas. Same sequence contract as
    /// [`Self::apply_delta`].
    pub fn set_level(
        &mut self,
        side: BookSide,
        price_cents: i64,
        size: i64,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), FeedError> {
        let expected = self.sequence + 1;
        if sequence != expected {
            return Err(FeedError::SequenceGap {
                market_id: self.market_id.to_string(),
                expected,
                got: sequence,
            });
        }

        let ladder = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if size > 0 {
            ladder.insert(price_cents, size);
        } else {
            ladder.remove(&price_cents);
        }

        self.sequence = sequence;
        self.last_update_utc = at;
        Ok(())
    }

    /// Apply a delta expressed on the NO ladder of a bids-only venue.
    ///
    /// A NO bid at `p` is a YES ask at `100 - p`.
    pub fn apply_no_side_delta(
        &mut self,
        price_cents: i64,
        delta: i64,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), FeedError> {
        self.apply_delta(BookSide::Ask, 100 - price_cents, delta, sequence, at)
    }

    /// Best bid as `(price_cents, size)`.
    #[must_use]
    pub fn best_bid(&self) -> Option<(i64, i64)> {
        self.bids.iter().next_back().map(|(&p, &s)| (p, s))
    }

    /// Best ask as `(price_cents, size)`.
    #[must_use]
    pub fn best_ask(&self) -> Option<(i64, i64)> {
        self.asks.iter().next().map(|(&p, &s)| (p, s))
    }

    /// Midpoint in cents, fractional.
    #[must_use]
    pub fn mid_cents(&self) -> Option<f64> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some((bid + ask) as f64 / 2.0)
    }

    /// Total size at top-of-book on both sides.
    #[must_use]
    pub fn top_liquidity(&self) -> i64 {
        let bid = self.best_bid().map_or(0, |(_, s)| s);
        let ask = self.best_ask().map_or(0, |(_, s)| s);
        bid + ask
    }

    /// True when both sides have at least one level.
    #[must_use]
    pub fn is_two_sided(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> LocalOrderBook {
        LocalOrderBook::new(Venue::Direct, MarketId::from("MKT-LAL"))
    }

    #[test]
    fn snapshot_then_best_prices() {
        let mut b = book();
        b.apply_snapshot(
            vec![(70, 500), (69, 200)],
            vec![(72, 500), (73, 100)],
            10,
            Utc::now(),
        );
        assert_eq!(b.best_bid(), Some((70, 500)));
        assert_eq!(b.best_ask(), Some((72, 500)));
        assert_eq!(b.mid_cents(), Some(71.0));
        assert_eq!(b.top_liquidity(), 1000);
    }

    #[test]
    fn asks_derived_from_no_bids() {
        let mut b = book();
        // NO bid at 28 cents means YES ask at 72 cents.
        b.apply_two_sided_bid_snapshot(vec![(70, 500)], vec![(28, 500)], 1, Utc::now());
        assert_eq!(b.best_ask(), Some((72, 500)));
    }

    #[test]
    fn delta_requires_contiguous_sequence() {
        let mut b = book();
        b.apply_snapshot(vec![(70, 500)], vec![(72, 500)], 5, Utc::now());

        let err = b
            .apply_delta(BookSide::Bid, 70, -100, 7, Utc::now())
            .unwrap_err();
        assert!(matches!(err, FeedError::SequenceGap { expected: 6, got: 7, .. }));

        b.apply_delta(BookSide::Bid, 70, -100, 6, Utc::now()).unwrap();
        assert_eq!(b.best_bid(), Some((70, 400)));
    }

    #[test]
    fn set_level_overwrites_absolute_size() {
        let mut b = book();
        b.apply_snapshot(vec![(45, 300)], vec![(47, 150)], 1, Utc::now());
        b.set_level(BookSide::Ask, 47, 80, 2, Utc::now()).unwrap();
        assert_eq!(b.best_ask(), Some((47, 80)));
        b.set_level(BookSide::Ask, 47, 0, 3, Utc::now()).unwrap();
        assert_eq!(b.best_ask(), None);
    }

    #[test]
    fn zero_size_removes_level() {
        let mut b = book();
        b.apply_snapshot(vec![(70, 100)], vec![(72, 500)], 1, Utc::now());
        b.apply_delta(BookSide::Bid, 70, -100, 2, Utc::now()).unwrap();
        assert_eq!(b.best_bid(), None);
    }

    #[test]
    fn snapshot_plus_delta_and_inverse_is_identity() {
        let mut reference = book();
        reference.apply_snapshot(vec![(70, 500)], vec![(72, 500)], 1, Utc::now());

        let mut b = book();
        b.apply_snapshot(vec![(70, 500)], vec![(72, 500)], 1, Utc::now());
        b.apply_delta(BookSide::Ask, 72, -200, 2, Utc::now()).unwrap();
        b.apply_delta(BookSide::Ask, 72, 200, 3, Utc::now()).unwrap();

        assert_eq!(b.best_bid(), reference.best_bid());
        assert_eq!(b.best_ask(), reference.best_ask());
        assert_eq!(b.top_liquidity(), reference.top_liquidity());
    }
}
