//! Shared builders for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use overround::bus::{Bus, MarketBinding};
use overround::domain::{
    Direction, Event, EventId, LocalOrderBook, MarketId, MarketPrice, MarketType, Signal,
    SignalId, SignalType, Sport, Venue,
};

pub fn nba_event(id: &str, home: &str, away: &str) -> Event {
    Event {
        event_id: EventId::from(id),
        market_type: MarketType::Sport {
            sport: Sport::Nba,
            league: "NBA".into(),
        },
        entity_a: home.into(),
        entity_b: Some(away.into()),
        scheduled_start_utc: Utc::now() - chrono::Duration::minutes(30),
    }
}

pub fn binding(event_id: &str, venue: Venue, market_id: &str, entity: &str) -> MarketBinding {
    MarketBinding {
        event_id: EventId::from(event_id),
        venue,
        market_id: MarketId::from(market_id),
        contract_entity: entity.into(),
    }
}

/// Two-sided market price from raw cents.
pub fn price(
    venue: Venue,
    market_id: &str,
    event_id: &str,
    entity: &str,
    bid_cents: i64,
    ask_cents: i64,
    size: i64,
    sequence: u64,
) -> MarketPrice {
    let mut book = LocalOrderBook::new(venue, MarketId::from(market_id));
    book.apply_snapshot(
        vec![(bid_cents, size)],
        vec![(ask_cents, size)],
        sequence,
        Utc::now(),
    );
    MarketPrice::from_book(&book, EventId::from(event_id), entity).unwrap()
}

/// Model-edge buy signal shaped like detector output.
pub fn model_edge_signal(
    event_id: &str,
    entity: &str,
    venue: Venue,
    model_p: f64,
    ask: Decimal,
    net_edge: f64,
    liquidity: i64,
) -> Signal {
    let now = Utc::now();
    let market_p = rust_decimal::prelude::ToPrimitive::to_f64(&ask).unwrap();
    Signal {
        signal_id: SignalId::from(format!("sig-{}", uuid::Uuid::new_v4())),
        event_id: EventId::from(event_id),
        entity: entity.into(),
        direction: Direction::Buy,
        signal_type: SignalType::ModelEdgeYes,
        model_p,
        market_p,
        raw_edge_pct: model_p - market_p,
        net_edge_pct: net_edge,
        confidence: Signal::confidence_from_edge(model_p - market_p),
        venue_buy: Some(venue),
        venue_sell: None,
        buy_price: ask,
        sell_price: None,
        liquidity_min: Decimal::from(liquidity),
        expires_utc: now + chrono::Duration::seconds(30),
        paired_leg_id: None,
        created_utc: now,
    }
}

/// Paired arbitrage signals: YES on `yes_venue` at `yes_ask`, NO on the
/// other venue at `no_ask` (both prices in cents).
pub fn arbitrage_signals(
    event_id: &str,
    entity: &str,
    yes_venue: Venue,
    no_venue: Venue,
    yes_ask_cents: i64,
    no_ask_cents: i64,
    liquidity: i64,
) -> (Signal, Signal) {
    let now = Utc::now();
    let yes_id = SignalId::from(format!("sig-{}", uuid::Uuid::new_v4()));
    let no_id = SignalId::from(format!("sig-{}", uuid::Uuid::new_v4()));
    let raw = (100 - yes_ask_cents - no_ask_cents) as f64 / 100.0;

    let leg = |signal_id: SignalId,
               paired: SignalId,
               signal_type: SignalType,
               venue: Venue,
               other: Venue,
               price_cents: i64| Signal {
        signal_id,
        event_id: EventId::from(event_id),
        entity: entity.into(),
        direction: Direction::Buy,
        signal_type,
        model_p: 0.5,
        market_p: price_cents as f64 / 100.0,
        raw_edge_pct: raw,
        net_edge_pct: raw,
        confidence: 1.0,
        venue_buy: Some(venue),
        venue_sell: Some(other),
        buy_price: Decimal::new(price_cents, 2),
        sell_price: None,
        liquidity_min: Decimal::from(liquidity),
        expires_utc: now + chrono::Duration::seconds(10),
        paired_leg_id: Some(paired),
        created_utc: now,
    };

    (
        leg(
            yes_id.clone(),
            no_id.clone(),
            SignalType::ArbitrageYesNo,
            yes_venue,
            no_venue,
            yes_ask_cents,
        ),
        leg(
            no_id,
            yes_id,
            SignalType::ArbitrageNoYes,
            no_venue,
            yes_venue,
            no_ask_cents,
        ),
    )
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_for<F>(timeout: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Publish the standard wiring for one NBA event bound on both venues.
pub fn announce_event(bus: &Bus, event: &Event, direct_market: &str, proxied_market: &str) {
    bus.publish_event(event.clone());
    bus.publish_binding(binding(
        event.event_id.as_str(),
        Venue::Direct,
        direct_market,
        &event.entity_a,
    ));
    bus.publish_binding(binding(
        event.event_id.as_str(),
        Venue::Proxied,
        proxied_market,
        &event.entity_a,
    ));
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
