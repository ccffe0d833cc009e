use std::sync::Arc;

use chrono::{Duration, Utc};

use super::*;
use crate::domain::{
    AccountId, EventState, LocalOrderBook, OrderStatus, Possession, SportState,
};
use crate::store::{MemoryRepository, Repository};

struct Fixture {
    tracker: Arc<PositionTracker>,
    bus: Bus,
    repo: Arc<MemoryRepository>,
}

async fn fixture() -> Fixture {
    fixture_with(PositionConfig::default()).await
}

async fn fixture_with(config: PositionConfig) -> Fixture {
    let bus = Bus::new();
    let repo = Arc::new(MemoryRepository::new());
    let ledger = BankrollLedger::new(AccountId::from("acct"), repo.clone(), bus.clone(), 8);
    ledger
        .load_or_seed(Cents::from_dollars(10_000))
        .await
        .unwrap();
    let tracker = Arc::new(PositionTracker::new(config, ledger, bus.clone()));

    // Event metadata and binding for e1 / Lakers on Direct.
    tracker.events.insert(
        EventId::from("e1"),
        crate::domain::Event {
            event_id: EventId::from("e1"),
            market_type: crate::domain::MarketType::Sport {
                sport: Sport::Nba,
                league: "NBA".into(),
            },
            entity_a: "Lakers".into(),
            entity_b: Some("Celtics".into()),
            scheduled_start_utc: Utc::now() - Duration::hours(1),
        },
    );
    tracker.entities.insert(
        (Venue::Direct, MarketId::from("DIR-LAL")),
        "Lakers".to_string(),
    );

    Fixture { tracker, bus, repo }
}

fn fill(qty: i64, price: i64, fees: i64) -> ExecutionResult {
    let signal_id = SignalId::from(format!("sig-{}", Uuid::new_v4()));
    ExecutionResult {
        request_id: RequestId::from(format!("req-{}", Uuid::new_v4())),
        signal_id: signal_id.clone(),
        idempotency_key: IdempotencyKey::derive(&signal_id, Side::Yes, Venue::Direct),
        client_order_id: "c1".into(),
        venue_order_id: Some("v1".into()),
        venue: Venue::Direct,
        market_id: MarketId::from("DIR-LAL"),
        event_id: EventId::from("e1"),
        side: Side::Yes,
        action: OrderAction::Buy,
        status: OrderStatus::Filled,
        requested_qty: qty,
        filled_qty: qty,
        avg_price: Cents::new(price),
        fees: Cents::new(fees),
        reason: None,
        executed_utc: Utc::now(),
    }
}

fn price_snapshot(bid: i64, ask: i64, sequence: u64) -> MarketPrice {
    let mut book = LocalOrderBook::new(Venue::Direct, MarketId::from("DIR-LAL"));
    book.apply_snapshot(vec![(bid, 500)], vec![(ask, 500)], sequence, Utc::now());
    MarketPrice::from_book(&book, EventId::from("e1"), "Lakers").unwrap()
}

async fn bankroll(repo: &MemoryRepository) -> crate::domain::Bankroll {
    repo.load_bankroll(&AccountId::from("acct"))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn fill_debits_bankroll_before_position_exists() {
    let f = fixture().await;
    let mut events = f.bus.subscribe_position_events();

    f.tracker.apply_result(&fill(100, 72, 142)).await.unwrap();

    let b = bankroll(&f.repo).await;
    // Debit = 7200 notional + 142 fee.
    assert_eq!(b.balance, Cents::from_dollars(10_000) - Cents::new(7_342));
    assert_eq!(b.reserved, Cents::new(7_200));

    let PositionEvent::Opened(position) = events.recv().await.unwrap() else {
        panic!("expected open event");
    };
    assert_eq!(position.qty_open, 100);
    assert_eq!(position.entry_price, Cents::new(72));
    assert_eq!(position.entity, "Lakers");
    assert!(position.stop_loss_price < position.entry_price);
    assert!(position.take_profit_price > position.entry_price);
}

#[tokio::test]
async fn replayed_result_applies_once() {
    let f = fixture().await;
    let result = fill(100, 72, 142);
    f.tracker.apply_result(&result).await.unwrap();
    f.tracker.apply_result(&result).await.unwrap();
    assert_eq!(f.tracker.open_positions().len(), 1);
}

#[tokio::test]
async fn take_profit_places_exit_ioc_with_slippage() {
    let f = fixture().await;
    let mut requests = f.bus.take_request_intake();

    f.tracker.apply_result(&fill(100, 72, 142)).await.unwrap();
    let position = &f.tracker.open_positions()[0];
    let tp = position.take_profit_price.value();

    // Quote the bid at the take-profit level.
    f.tracker.prices.insert(
        (Venue::Direct, MarketId::from("DIR-LAL")),
        price_snapshot(tp, tp + 2, 2),
    );
    f.tracker.run_exit_checks(Utc::now()).await;

    let request = requests.try_recv().unwrap();
    assert_eq!(request.action, OrderAction::Sell);
    assert_eq!(request.quantity, 100);
    // 50 bps of the bid, at least one cent, below the bid.
    assert!(request.limit_price.value() < tp);
}

#[tokio::test]
async fn stale_price_defers_exit() {
    let f = fixture().await;
    let mut requests = f.bus.take_request_intake();

    f.tracker.apply_result(&fill(100, 72, 142)).await.unwrap();

    let mut price = price_snapshot(95, 97, 2);
    price.updated_utc = Utc::now() - Duration::seconds(31);
    f.tracker
        .prices
        .insert((Venue::Direct, MarketId::from("DIR-LAL")), price);
    f.tracker.run_exit_checks(Utc::now()).await;

    assert!(requests.try_recv().is_err());
}

#[tokio::test]
async fn exit_fill_closes_position_and_skims_piggybank() {
    let f = fixture().await;
    let mut events = f.bus.subscribe_position_events();

    f.tracker.apply_result(&fill(100, 72, 142)).await.unwrap();
    let position_id = f.tracker.open_positions()[0].position_id;
    f.tracker.exiting.insert(position_id, ExitReason::TakeProfit);

    // Exit fill: sold 100 at 85 with a $1.20 fee.
    let mut exit = fill(100, 85, 120);
    exit.action = OrderAction::Sell;
    f.tracker.apply_result(&exit).await.unwrap();

    // Opened + Closed events.
    let _ = events.recv().await.unwrap();
    let PositionEvent::Closed(closed) = events.recv().await.unwrap() else {
        panic!("expected close event");
    };
    let exit_record = closed.exit.unwrap();
    // P&L = (85-72)*100 - 142 - 120 = 1038.
    assert_eq!(exit_record.realized_pnl, Cents::new(1_038));
    assert_eq!(exit_record.reason, ExitReason::TakeProfit);

    let b = bankroll(&f.repo).await;
    assert_eq!(b.reserved, Cents::ZERO);
    // Half the net profit is skimmed.
    assert_eq!(b.piggybank_balance, Cents::new(519));
    assert!(f.tracker.open_positions().is_empty());
}

#[tokio::test]
async fn settlement_pays_winners_in_full() {
    let f = fixture().await;
    f.tracker.apply_result(&fill(100, 72, 142)).await.unwrap();

    // Lakers win and the event goes final.
    f.tracker.states.insert(
        EventId::from("e1"),
        EventState {
            event_id: EventId::from("e1"),
            status: ResolutionStatus::Final,
            data: StateData::Sport(SportState {
                score_a: 110,
                score_b: 102,
                period: 4,
                seconds_remaining: 0,
                possession: Some(Possession::EntityA),
                situation: None,
            }),
            fetched_at: Utc::now(),
            fetch_latency_ms: 20,
        },
    );
    f.tracker.run_exit_checks(Utc::now()).await;

    assert!(f.tracker.open_positions().is_empty());
    let b = bankroll(&f.repo).await;
    // Paid 7342, settled for 10000: profit 2658, half skimmed.
    assert_eq!(b.piggybank_balance, Cents::new(1_329));
}

#[tokio::test]
async fn drawdown_breach_publishes_pause() {
    let config = PositionConfig {
        max_drawdown_pct: 0.15,
        ..PositionConfig::default()
    };
    let f = fixture_with(config).await;
    let mut control = f.bus.subscribe_control();

    // Peak $10,000; an entry costing $1,500.01 leaves $8,499.99, a 15.01%
    // drawdown, which triggers on the debit.
    f.tracker.apply_result(&fill(10_000, 15, 1)).await.unwrap();

    let event = control.recv().await.unwrap();
    assert!(matches!(event, ControlEvent::PauseTrading { .. }));
}

#[tokio::test]
async fn unfilled_exit_releases_the_marker() {
    let f = fixture().await;
    f.tracker.apply_result(&fill(100, 72, 142)).await.unwrap();
    let position_id = f.tracker.open_positions()[0].position_id;
    f.tracker.exiting.insert(position_id, ExitReason::StopLoss);

    let mut cancelled = fill(100, 0, 0);
    cancelled.action = OrderAction::Sell;
    cancelled.status = OrderStatus::Cancelled;
    cancelled.filled_qty = 0;
    f.tracker.apply_result(&cancelled).await.unwrap();

    assert!(!f.tracker.exiting.contains_key(&position_id));
    assert_eq!(f.tracker.open_positions().len(), 1);
}

#[tokio::test]
async fn engine_offset_sell_closes_as_offset_unpaired() {
    let f = fixture().await;
    let mut events = f.bus.subscribe_position_events();
    f.tracker.apply_result(&fill(100, 45, 80)).await.unwrap();

    // Engine-issued offset: a sell with no exiting marker.
    let mut offset = fill(100, 44, 0);
    offset.action = OrderAction::Sell;
    f.tracker.apply_result(&offset).await.unwrap();

    let _ = events.recv().await.unwrap();
    let PositionEvent::Closed(closed) = events.recv().await.unwrap() else {
        panic!("expected close event");
    };
    assert_eq!(closed.exit.unwrap().reason, ExitReason::OffsetUnpaired);
}

#[test]
fn sport_stop_table_matches_defaults() {
    assert_eq!(stop_cents_for_sport(Sport::Nba), 3);
    assert_eq!(stop_cents_for_sport(Sport::Nhl), 7);
}

#[tokio::test]
async fn stops_tighten_late_in_games() {
    let f = fixture().await;

    // Late-game state: 90% elapsed.
    f.tracker.states.insert(
        EventId::from("e1"),
        EventState {
            event_id: EventId::from("e1"),
            status: ResolutionStatus::Live,
            data: StateData::Sport(SportState {
                score_a: 100,
                score_b: 95,
                period: 4,
                seconds_remaining: 288,
                possession: None,
                situation: None,
            }),
            fetched_at: Utc::now(),
            fetch_latency_ms: 10,
        },
    );
    f.tracker.apply_result(&fill(100, 72, 142)).await.unwrap();
    let late = &f.tracker.open_positions()[0];
    // NBA base stop 3 cents, scaled by (1 - 0.5 * 0.9) = 0.55 => ~2 cents.
    assert!(late.entry_price.value() - late.stop_loss_price.value() <= 2);
}
