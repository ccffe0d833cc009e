//! Shard fiber flow: live state + venue prices in, detector signals out.

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use overround::bus::Bus;
use overround::detector::{Detector, DetectorConfig};
use overround::domain::{
    EventId, EventState, Play, PlayId, PlayKind, Possession, ResolutionStatus, ShardId,
    SignalType, Sport, SportState, StateData, Venue,
};
use overround::fees::FeeModel;
use overround::model::ModelRegistry;
use overround::shard::{Shard, ShardConfig};

use support::*;

fn sport_state(event_id: &str, score_a: u32, score_b: u32, seconds_remaining: u32) -> EventState {
    EventState {
        event_id: EventId::from(event_id),
        status: ResolutionStatus::Live,
        data: StateData::Sport(SportState {
            score_a,
            score_b,
            period: 4,
            seconds_remaining,
            possession: Some(Possession::EntityA),
            situation: None,
        }),
        fetched_at: Utc::now(),
        fetch_latency_ms: 25,
    }
}

fn shard_fixture() -> (Bus, Arc<Shard>) {
    let bus = Bus::new();
    let shard = Arc::new(Shard::new(
        ShardId::new(0),
        ShardConfig::default(),
        bus.clone(),
        Arc::new(ModelRegistry::with_defaults()),
        Arc::new(Detector::new(DetectorConfig::default(), FeeModel::default())),
    ));
    tokio::spawn(Arc::clone(&shard).run());
    (bus, shard)
}

#[tokio::test]
async fn state_plus_price_produces_a_model_edge_signal() {
    let (bus, shard) = shard_fixture();
    let mut signals = bus.take_signal_intake();

    shard.add_event(nba_event("e1", "Lakers", "Celtics")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Big home lead late: the model is far above the quoted ask.
    bus.publish_state(sport_state("e1", 88, 80, 240));
    tokio::time::sleep(Duration::from_millis(50)).await;

    bus.publish_price(price(Venue::Direct, "DIR-LAL", "e1", "Lakers", 90, 92, 500, 1));

    let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("signal")
        .unwrap();
    assert_eq!(signal.event_id, EventId::from("e1"));
    assert_eq!(signal.entity, "Lakers");
    assert_eq!(signal.signal_type, SignalType::ModelEdgeYes);
    assert_eq!(signal.venue_buy, Some(Venue::Direct));
    assert!(signal.model_p > 0.95);
    assert!(signal.raw_edge_pct > 0.03);
}

#[tokio::test]
async fn both_venues_quoted_can_yield_paired_arbitrage() {
    let (bus, shard) = shard_fixture();
    let mut signals = bus.take_signal_intake();

    shard.add_event(nba_event("e2", "Knicks", "Heat")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Near coin-flip game (away up one, away ball) so the model sits
    // inside the spread and no model edge outranks the arbitrage.
    let mut state = sport_state("e2", 60, 61, 1_440);
    if let StateData::Sport(ref mut s) = state.data {
        s.possession = Some(Possession::EntityB);
    }
    bus.publish_state(state);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Direct YES ask 0.45; proxied YES bid 0.47 -> NO ask 0.53.
    bus.publish_price(price(Venue::Direct, "DIR-NYK", "e2", "Knicks", 43, 45, 300, 1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish_price(price(Venue::Proxied, "tok-nyk", "e2", "Knicks", 47, 49, 150, 1));

    // Collect until the paired legs appear; the first quote alone may have
    // produced a model-edge signal first.
    let mut paired = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while paired.len() < 2 {
        let remaining = deadline - tokio::time::Instant::now();
        let signal = tokio::time::timeout(remaining, signals.recv())
            .await
            .expect("paired signals")
            .unwrap();
        if signal.is_arbitrage() {
            paired.push(signal);
        }
    }
    assert_eq!(paired[0].paired_leg_id.as_ref(), Some(&paired[1].signal_id));
    assert!((paired[0].raw_edge_pct - 0.02).abs() < 1e-9);
}

#[tokio::test]
async fn stale_state_is_dropped_by_the_monotonic_guard() {
    let (bus, shard) = shard_fixture();
    let mut signals = bus.take_signal_intake();

    shard.add_event(nba_event("e3", "Bulls", "Nets")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fresh = sport_state("e3", 90, 70, 120);
    let mut stale = sport_state("e3", 60, 60, 1_800);
    stale.fetched_at = fresh.fetched_at - chrono::Duration::seconds(30);

    bus.publish_state(fresh);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The out-of-date snapshot must not displace the fresh one.
    bus.publish_state(stale);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Price at a big discount to the blowout model: the signal reflects
    // the fresh state, not the stale near-even one.
    bus.publish_price(price(Venue::Direct, "DIR-CHI", "e3", "Bulls", 88, 90, 500, 1));

    let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("signal")
        .unwrap();
    assert!(signal.model_p > 0.95, "stale state displaced fresh state");
}

#[tokio::test]
async fn final_event_self_removes_after_evaluation() {
    let (bus, shard) = shard_fixture();

    shard.add_event(nba_event("e4", "Suns", "Spurs")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(shard.load(), 1);

    let mut final_state = sport_state("e4", 101, 99, 0);
    final_state.status = ResolutionStatus::Final;
    bus.publish_state(final_state);

    wait_for(Duration::from_secs(5), || shard.load() == 0).await;
}

#[tokio::test]
async fn scoring_play_forces_evaluation_below_delta_threshold() {
    let (bus, shard) = shard_fixture();
    let mut signals = bus.take_signal_intake();

    shard.add_event(nba_event("e5", "Jazz", "Kings")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Prime probability and a fresh quote close to fair value.
    bus.publish_state(sport_state("e5", 80, 78, 600));
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish_price(price(Venue::Direct, "DIR-UTA", "e5", "Jazz", 60, 62, 500, 1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Drain whatever the priming produced.
    while signals.try_recv().is_ok() {}

    // A scoring play plus a tiny score change: delta alone would not
    // trigger, the play does.
    bus.publish_play(Play {
        play_id: PlayId::from("p-1"),
        event_id: EventId::from("e5"),
        kind: PlayKind::Score { points: 2 },
        time_utc: Utc::now(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish_state(sport_state("e5", 82, 78, 590));

    let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("play-triggered signal")
        .unwrap();
    assert_eq!(signal.event_id, EventId::from("e5"));
}

#[tokio::test]
async fn arbitrage_sweep_scans_the_whole_shard() {
    // Exercised at the unit level in the shard module; here just confirm
    // the sweep runs across several assigned events without interference.
    let (bus, shard) = shard_fixture();
    for i in 0..10 {
        shard
            .add_event(nba_event(&format!("sweep-{i}"), "Home", "Away"))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    for i in 0..10 {
        bus.publish_state(sport_state(&format!("sweep-{i}"), 60, 60, 1_440));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for i in 0..10 {
        bus.publish_price(price(
            Venue::Direct,
            &format!("DIR-{i}"),
            &format!("sweep-{i}"),
            "Home",
            48,
            50,
            200,
            1,
        ));
    }

    shard.arbitrage_sweep().await;
    assert_eq!(shard.load(), 10);
}

#[test]
fn sport_enum_covers_configured_leagues() {
    // Guard against the registry and config drifting apart.
    for sport in [Sport::Nba, Sport::Nfl, Sport::Nhl, Sport::Mlb] {
        assert!(sport.regulation_seconds() > 0);
    }
}
