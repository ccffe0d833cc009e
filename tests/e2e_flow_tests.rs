//! End-to-end pipeline tests: signal -> processor -> engine -> tracker,
//! wired over the real bus with paper venue clients.

mod support;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;

use overround::bus::{Bus, ControlEvent, PositionEvent};
use overround::domain::{
    AccountId, Cents, EventId, OrderAction, OrderStatus, Side, Venue,
};
use overround::execution::{
    ExecutionConfig, ExecutionEngine, PaperVenueClient, VenueClient,
};
use overround::fees::FeeModel;
use overround::position::{BankrollLedger, PositionConfig, PositionTracker};
use overround::signal::{ProcessorConfig, SignalProcessor};
use overround::store::{MemoryRepository, Repository};

use support::*;

struct Stack {
    bus: Bus,
    repo: Arc<MemoryRepository>,
    direct_paper: Arc<PaperVenueClient>,
    proxied_paper: Arc<PaperVenueClient>,
}

/// Build and spawn the full trading stack in paper mode with a $10,000
/// bankroll.
async fn stack() -> Stack {
    let bus = Bus::new();
    let repo = Arc::new(MemoryRepository::new());
    let fees = FeeModel::default();

    let processor = arc(SignalProcessor::new(
        ProcessorConfig::default(),
        fees.clone(),
        bus.clone(),
        repo.clone() as Arc<dyn Repository>,
    ));
    tokio::spawn(Arc::clone(&processor).run());

    let mut engine = ExecutionEngine::new(
        ExecutionConfig::default(),
        fees.clone(),
        bus.clone(),
        repo.clone() as Arc<dyn Repository>,
    );
    let direct_paper = arc(PaperVenueClient::mirroring(fees.clone(), Venue::Direct));
    let proxied_paper = arc(PaperVenueClient::mirroring(fees.clone(), Venue::Proxied));
    engine.register_client_as(Venue::Direct, Arc::clone(&direct_paper) as Arc<dyn VenueClient>);
    engine.register_client_as(
        Venue::Proxied,
        Arc::clone(&proxied_paper) as Arc<dyn VenueClient>,
    );
    tokio::spawn(arc(engine).run());

    let account = AccountId::from("e2e");
    let ledger = BankrollLedger::new(
        account.clone(),
        repo.clone() as Arc<dyn Repository>,
        bus.clone(),
        8,
    );
    let tracker = arc(PositionTracker::new(
        PositionConfig::default(),
        BankrollLedger::new(account, repo.clone() as Arc<dyn Repository>, bus.clone(), 8),
        bus.clone(),
    ));
    tokio::spawn(Arc::clone(&tracker).run());

    // Let the services subscribe before anything is published.
    tokio::time::sleep(Duration::from_millis(50)).await;
    ledger
        .load_or_seed(Cents::from_dollars(10_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    Stack {
        bus,
        repo,
        direct_paper,
        proxied_paper,
    }
}

async fn bankroll(repo: &MemoryRepository) -> overround::domain::Bankroll {
    repo.load_bankroll(&AccountId::from("e2e"))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn model_edge_buy_fills_and_opens_a_position() {
    let stack = stack().await;
    let event = nba_event("e1", "Lakers", "Celtics");
    announce_event(&stack.bus, &event, "DIR-LAL", "tok-lal");

    let mut position_events = stack.bus.subscribe_position_events();

    // Direct book 0.70/0.72 with 500 at each level.
    let quote = price(Venue::Direct, "DIR-LAL", "e1", "Lakers", 70, 72, 500, 1);
    stack.direct_paper.observe_price(quote.clone());
    stack.bus.publish_price(quote);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Model edge 4 pp at the ask; net 1.2 pp after direct fees.
    stack
        .bus
        .send_signal(model_edge_signal(
            "e1",
            "Lakers",
            Venue::Direct,
            0.76,
            dec!(0.72),
            0.012,
            500,
        ))
        .await;

    // One IOC order on Direct at 0.72, filled, position created.
    let opened = tokio::time::timeout(Duration::from_secs(5), position_events.recv())
        .await
        .expect("position event")
        .unwrap();
    let PositionEvent::Opened(position) = opened else {
        panic!("expected open");
    };
    assert_eq!(position.venue, Venue::Direct);
    assert_eq!(position.entry_price, Cents::new(72));
    assert!(position.qty_open >= 1);
    assert!(position.qty_open <= 500);

    // Trade recorded and bankroll debited before the position existed.
    let repo = stack.repo.clone();
    wait_for(Duration::from_secs(2), || {
        !repo.trades().is_empty()
    })
    .await;
    let trade = &stack.repo.trades()[0];
    assert_eq!(trade.status, OrderStatus::Filled);
    assert_eq!(trade.side, Side::Yes);

    let b = bankroll(&stack.repo).await;
    assert!(b.balance < Cents::from_dollars(10_000));
    assert_eq!(b.reserved, position.entry_notional());
}

#[tokio::test]
async fn cross_venue_arbitrage_fills_both_legs() {
    let stack = stack().await;
    let event = nba_event("e2", "Knicks", "Heat");
    announce_event(&stack.bus, &event, "DIR-NYK", "tok-nyk");

    let mut position_events = stack.bus.subscribe_position_events();

    // Direct 0.43/0.45 size 300; proxied 0.47/0.49 size 150.
    // Proxied NO ask = 1 - 0.47 = 0.53; 45 + 53 = 98 < 100.
    let direct_quote = price(Venue::Direct, "DIR-NYK", "e2", "Knicks", 43, 45, 300, 1);
    let proxied_quote = price(Venue::Proxied, "tok-nyk", "e2", "Knicks", 47, 49, 150, 1);
    stack.direct_paper.observe_price(direct_quote.clone());
    stack.proxied_paper.observe_price(proxied_quote.clone());
    stack.bus.publish_price(direct_quote);
    stack.bus.publish_price(proxied_quote);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (yes_leg, no_leg) =
        arbitrage_signals("e2", "Knicks", Venue::Direct, Venue::Proxied, 45, 53, 150);
    stack.bus.send_signal(yes_leg).await;
    stack.bus.send_signal(no_leg).await;

    // Both legs fill at equal size: two positions, one per venue.
    let mut venues = Vec::new();
    let mut quantities = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(5), position_events.recv())
            .await
            .expect("position event")
            .unwrap();
        let PositionEvent::Opened(position) = event else {
            panic!("expected open");
        };
        venues.push(position.venue);
        quantities.push(position.qty_open);
    }
    assert!(venues.contains(&Venue::Direct));
    assert!(venues.contains(&Venue::Proxied));
    assert_eq!(quantities[0], quantities[1]);
    assert!(quantities[0] <= 150);
}

#[tokio::test]
async fn unpaired_arbitrage_leg_is_offset_within_a_second() {
    let stack = stack().await;
    let event = nba_event("e3", "Bulls", "Nets");
    announce_event(&stack.bus, &event, "DIR-CHI", "tok-chi");

    let mut results = stack.bus.subscribe_results();
    let mut control = stack.bus.subscribe_control();

    // Only the direct book exists: the proxied leg will cancel.
    let direct_quote = price(Venue::Direct, "DIR-CHI", "e3", "Bulls", 43, 45, 300, 1);
    stack.direct_paper.observe_price(direct_quote.clone());
    stack.bus.publish_price(direct_quote);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (yes_leg, no_leg) =
        arbitrage_signals("e3", "Bulls", Venue::Direct, Venue::Proxied, 45, 53, 100);
    let observed_at = tokio::time::Instant::now();
    stack.bus.send_signal(yes_leg).await;
    stack.bus.send_signal(no_leg).await;

    // Expect three results: the fill, the cancel, and the offsetting sell.
    let mut offset_seen = false;
    let mut filled_qty = 0;
    for _ in 0..3 {
        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("result")
            .unwrap();
        match (result.action, result.status) {
            (OrderAction::Buy, OrderStatus::Filled) => filled_qty = result.filled_qty,
            (OrderAction::Sell, OrderStatus::Filled) => {
                offset_seen = true;
                assert_eq!(result.venue, Venue::Direct);
                assert_eq!(result.filled_qty, filled_qty);
                // Sold at the current bid minus the slippage buffer.
                assert!(result.avg_price <= Cents::new(43));
                assert!(
                    observed_at.elapsed() < Duration::from_secs(1),
                    "offset not issued within one second"
                );
            }
            _ => {}
        }
    }
    assert!(offset_seen, "no offsetting IOC observed");

    // No suspension needed: the offset fully filled.
    assert!(control.try_recv().is_err());
}

#[tokio::test]
async fn idempotent_retry_returns_original_result_without_replacing() {
    let stack = stack().await;
    let event = nba_event("e4", "Suns", "Spurs");
    announce_event(&stack.bus, &event, "DIR-PHX", "tok-phx");

    let mut results = stack.bus.subscribe_results();
    let mut position_events = stack.bus.subscribe_position_events();

    let quote = price(Venue::Direct, "DIR-PHX", "e4", "Suns", 70, 72, 500, 1);
    stack.direct_paper.observe_price(quote.clone());
    stack.bus.publish_price(quote);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A request that timed out upstream is retried with a fresh request id
    // but the same idempotency key.
    let signal_id = overround::domain::SignalId::from("retry-sig");
    let request = overround::domain::ExecutionRequest {
        request_id: overround::domain::RequestId::from("req-original"),
        signal_id: signal_id.clone(),
        idempotency_key: overround::domain::IdempotencyKey::derive(
            &signal_id,
            Side::Yes,
            Venue::Direct,
        ),
        venue: Venue::Direct,
        market_id: overround::domain::MarketId::from("DIR-PHX"),
        event_id: EventId::from("e4"),
        side: Side::Yes,
        action: OrderAction::Buy,
        quantity: 100,
        limit_price: Cents::new(72),
        paired_leg_request_id: None,
        expires_utc: chrono::Utc::now() + chrono::Duration::seconds(30),
        created_utc: chrono::Utc::now(),
    };
    stack.bus.send_request(request.clone()).await;

    let first = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("first result")
        .unwrap();
    assert_eq!(first.status, OrderStatus::Filled);

    let mut retry = request;
    retry.request_id = overround::domain::RequestId::from("req-retry");
    stack.bus.send_request(retry).await;

    let second = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("second result")
        .unwrap();

    // Both callers observe the original result; the venue saw one order.
    assert_eq!(second.request_id, first.request_id);
    assert_eq!(second.venue_order_id, first.venue_order_id);
    assert_eq!(second.filled_qty, first.filled_qty);

    // Exactly one position came out of the two deliveries.
    let opened = tokio::time::timeout(Duration::from_secs(5), position_events.recv())
        .await
        .expect("open event")
        .unwrap();
    assert!(matches!(opened, PositionEvent::Opened(_)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(position_events.try_recv().is_err());
}

#[tokio::test]
async fn drawdown_pause_rejects_next_signal_but_exits_continue() {
    let stack = stack().await;
    let event = nba_event("e5", "Jazz", "Kings");
    announce_event(&stack.bus, &event, "DIR-UTA", "tok-uta");

    let mut control = stack.bus.subscribe_control();
    let mut rejected = stack.bus.subscribe_rejected();

    // A cheap market with huge size lets one fill breach the 15% guard:
    // 11,000 units at 15 cents costs $1,650 of a $10,000 peak.
    let quote = price(Venue::Direct, "DIR-UTA", "e5", "Jazz", 14, 15, 20_000, 1);
    stack.direct_paper.observe_price(quote.clone());
    stack.bus.publish_price(quote);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Direct submission to the engine: bypass sizing caps for the setup.
    let signal_id = overround::domain::SignalId::from("drawdown-setup");
    stack
        .bus
        .send_request(overround::domain::ExecutionRequest {
            request_id: overround::domain::RequestId::from("req-drawdown"),
            signal_id: signal_id.clone(),
            idempotency_key: overround::domain::IdempotencyKey::derive(
                &signal_id,
                Side::Yes,
                Venue::Direct,
            ),
            venue: Venue::Direct,
            market_id: overround::domain::MarketId::from("DIR-UTA"),
            event_id: EventId::from("e5"),
            side: Side::Yes,
            action: OrderAction::Buy,
            quantity: 11_000,
            limit_price: Cents::new(15),
            paired_leg_request_id: None,
            expires_utc: chrono::Utc::now() + chrono::Duration::seconds(30),
            created_utc: chrono::Utc::now(),
        })
        .await;

    // The tracker debit breaches the guard and publishes the pause.
    let pause = tokio::time::timeout(Duration::from_secs(5), control.recv())
        .await
        .expect("control event")
        .unwrap();
    assert!(matches!(pause, ControlEvent::PauseTrading { .. }));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The next entry signal is rejected with drawdown_pause.
    stack
        .bus
        .send_signal(model_edge_signal(
            "e5",
            "Jazz",
            Venue::Direct,
            0.30,
            dec!(0.15),
            0.10,
            500,
        ))
        .await;
    let rejection = tokio::time::timeout(Duration::from_secs(5), rejected.recv())
        .await
        .expect("rejection")
        .unwrap();
    assert_eq!(
        rejection.reason,
        overround::domain::RejectReason::DrawdownPause
    );
}
