//! Paper venue: simulated IOC fills against the live book.
//!
//! Fills come from the latest observed top-of-book for the market, and the
//! entry fee that would apply on the mirrored real venue is still charged,
//! so simulated P&L reflects reality.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::client::{VenueClient, VenueFill, VenueOrder, VenueOrderState};
use crate::domain::{Cents, MarketId, MarketPrice, OrderAction, Side, Venue};
use crate::error::ExecutionError;
use crate::fees::FeeModel;

pub struct PaperVenueClient {
    books: DashMap<MarketId, MarketPrice>,
    fees: FeeModel,
    /// Real venue whose fee schedule the simulation charges.
    mirrors: Venue,
}

impl PaperVenueClient {
    #[must_use]
    pub fn new(fees: FeeModel) -> Self {
        Self::mirroring(fees, Venue::Direct)
    }

    #[must_use]
    pub fn mirroring(fees: FeeModel, mirrors: Venue) -> Self {
        Self {
            books: DashMap::new(),
            fees,
            mirrors,
        }
    }

    /// Feed the simulator the latest price for a market.
    pub fn observe_price(&self, price: MarketPrice) {
        let stale = self
            .books
            .get(&price.market_id)
            .map_or(false, |held| held.sequence > price.sequence);
        if !stale {
            self.books.insert(price.market_id.clone(), price);
        }
    }

    /// Executable price and size for the order, from the mirrored book.
    fn executable(&self, order: &VenueOrder) -> Option<(Cents, i64)> {
        let price = self.books.get(&order.market_id)?;

        // The book is quoted in YES terms; NO trades mirror it.
        let (exec, size) = match (order.side, order.action) {
            (Side::Yes, OrderAction::Buy) => (price.yes_ask_cents(), price.yes_ask_size),
            (Side::Yes, OrderAction::Sell) => (price.yes_bid_cents(), price.yes_bid_size),
            (Side::No, OrderAction::Buy) => {
                (Cents::PAYOUT - price.yes_bid_cents(), price.yes_bid_size)
            }
            (Side::No, OrderAction::Sell) => {
                (Cents::PAYOUT - price.yes_ask_cents(), price.yes_ask_size)
            }
        };
        let size = rust_decimal::prelude::ToPrimitive::to_i64(&size).unwrap_or(0);
        Some((exec, size))
    }
}

#[async_trait]
impl VenueClient for PaperVenueClient {
    fn venue(&self) -> Venue {
        Venue::Paper
    }

    async fn place_ioc(&self, order: &VenueOrder) -> Result<VenueFill, ExecutionError> {
        let Some((exec_price, available)) = self.executable(order) else {
            // No book yet: nothing to fill against, IOC cancels.
            return Ok(VenueFill {
                venue_order_id: Some(format!("paper-{}", Uuid::new_v4())),
                state: VenueOrderState::Cancelled,
                filled_qty: 0,
                avg_price: Cents::ZERO,
                fees: Some(Cents::ZERO),
            });
        };

        // Marketable check: a buy fills at or under its limit, a sell at or
        // over it.
        let marketable = match order.action {
            OrderAction::Buy => exec_price <= order.limit_price,
            OrderAction::Sell => exec_price >= order.limit_price,
        };
        if !marketable || available == 0 {
            return Ok(VenueFill {
                venue_order_id: Some(format!("paper-{}", Uuid::new_v4())),
                state: VenueOrderState::Cancelled,
                filled_qty: 0,
                avg_price: Cents::ZERO,
                fees: Some(Cents::ZERO),
            });
        }

        let filled = order.quantity.min(available);
        let fees = self.fees.order_fee(self.mirrors, exec_price, filled);

        Ok(VenueFill {
            venue_order_id: Some(format!("paper-{}", Uuid::new_v4())),
            state: VenueOrderState::Filled,
            filled_qty: filled,
            avg_price: exec_price,
            fees: Some(fees),
        })
    }

    async fn cancel(&self, _venue_order_id: &str) -> Result<(), ExecutionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventId, LocalOrderBook};
    use chrono::Utc;

    fn client_with_book(bid: i64, ask: i64, size: i64) -> PaperVenueClient {
        let client = PaperVenueClient::new(FeeModel::default());
        let mut book = LocalOrderBook::new(Venue::Paper, MarketId::from("m1"));
        book.apply_snapshot(vec![(bid, size)], vec![(ask, size)], 1, Utc::now());
        client.observe_price(MarketPrice::from_book(&book, EventId::from("e1"), "Lakers").unwrap());
        client
    }

    fn order(side: Side, action: OrderAction, qty: i64, limit: i64) -> VenueOrder {
        VenueOrder {
            client_order_id: "c1".into(),
            market_id: MarketId::from("m1"),
            side,
            action,
            quantity: qty,
            limit_price: Cents::new(limit),
        }
    }

    #[tokio::test]
    async fn fills_marketable_buy_at_the_ask() {
        let client = client_with_book(70, 72, 500);
        let fill = client
            .place_ioc(&order(Side::Yes, OrderAction::Buy, 100, 72))
            .await
            .unwrap();
        assert_eq!(fill.state, VenueOrderState::Filled);
        assert_eq!(fill.filled_qty, 100);
        assert_eq!(fill.avg_price, Cents::new(72));
        // Mirrored direct fee is attributed even on paper.
        assert!(fill.fees.unwrap().is_positive());
    }

    #[tokio::test]
    async fn partial_fill_caps_at_book_size() {
        let client = client_with_book(70, 72, 60);
        let fill = client
            .place_ioc(&order(Side::Yes, OrderAction::Buy, 100, 72))
            .await
            .unwrap();
        assert_eq!(fill.filled_qty, 60);
    }

    #[tokio::test]
    async fn unmarketable_buy_cancels() {
        let client = client_with_book(70, 72, 500);
        let fill = client
            .place_ioc(&order(Side::Yes, OrderAction::Buy, 100, 71))
            .await
            .unwrap();
        assert_eq!(fill.state, VenueOrderState::Cancelled);
        assert_eq!(fill.filled_qty, 0);
    }

    #[tokio::test]
    async fn no_side_buy_prices_against_the_yes_bid() {
        let client = client_with_book(70, 72, 500);
        // NO ask = 1 - yes_bid = 30 cents.
        let fill = client
            .place_ioc(&order(Side::No, OrderAction::Buy, 50, 30))
            .await
            .unwrap();
        assert_eq!(fill.state, VenueOrderState::Filled);
        assert_eq!(fill.avg_price, Cents::new(30));
    }

    #[tokio::test]
    async fn sell_fills_at_the_bid() {
        let client = client_with_book(70, 72, 500);
        let fill = client
            .place_ioc(&order(Side::Yes, OrderAction::Sell, 50, 69))
            .await
            .unwrap();
        assert_eq!(fill.state, VenueOrderState::Filled);
        assert_eq!(fill.avg_price, Cents::new(70));
    }

    #[tokio::test]
    async fn unknown_market_cancels() {
        let client = PaperVenueClient::new(FeeModel::default());
        let fill = client
            .place_ioc(&order(Side::Yes, OrderAction::Buy, 10, 50))
            .await
            .unwrap();
        assert_eq!(fill.state, VenueOrderState::Cancelled);
    }
}
