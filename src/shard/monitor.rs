//! Per-event monitor fiber.
//!
//! Each tracked event runs one cooperatively scheduled fiber that joins
//! live state with cached venue prices, recomputes the model probability
//! on state change, and hands evaluation ticks to the detector when the
//! probability moves enough or a scoring/turnover play lands.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bus::Bus;
use crate::detector::{Detector, EvaluationTick, VenueQuote};
use crate::domain::{
    Direction, Event, EventState, MarketPrice, ModelOutput, Probability, Signal, SignalId,
    SignalType, Venue,
};
use crate::model::ModelRegistry;
use crate::shard::ShardConfig;

/// Commands from the shard host to a fiber.
#[derive(Debug)]
pub enum FiberCommand {
    /// Force a detector evaluation (batch sweep survivor).
    Evaluate,
    Shutdown,
}

/// Shared top-of-book probe for the shard's vectorised arbitrage sweep,
/// in integer cents. `100` means "no usable quote" and never survives.
#[derive(Debug, Clone, Copy)]
pub struct ArbProbe {
    pub direct_yes_ask: u16,
    pub direct_no_ask: u16,
    pub proxied_yes_ask: u16,
    pub proxied_no_ask: u16,
}

impl Default for ArbProbe {
    fn default() -> Self {
        Self {
            direct_yes_ask: 100,
            direct_no_ask: 100,
            proxied_yes_ask: 100,
            proxied_no_ask: 100,
        }
    }
}

pub(super) struct MonitorHandle {
    pub event: Event,
    pub task: tokio::task::JoinHandle<()>,
    pub cmd_tx: mpsc::Sender<FiberCommand>,
}

/// The fiber body.
pub(super) async fn monitor_event(
    event: Event,
    config: ShardConfig,
    bus: Bus,
    models: Arc<ModelRegistry>,
    detector: Arc<Detector>,
    probes: Arc<dashmap::DashMap<crate::domain::EventId, ArbProbe>>,
    removed_tx: mpsc::Sender<crate::domain::EventId>,
    mut cmd_rx: mpsc::Receiver<FiberCommand>,
) {
    let mut states_rx = bus.subscribe_states();
    let mut prices_rx = bus.subscribe_prices();
    let mut plays_rx = bus.subscribe_plays();

    let mut latest_state: Option<EventState> = None;
    let mut latest_prices: HashMap<(Venue, String), MarketPrice> = HashMap::new();
    let mut cached_probability: Option<Probability> = None;
    let mut last_evaluated_probability: Option<Probability> = None;
    // Opening line, used as the pregame prior when no external prior is
    // configured.
    let mut opening_prior: Option<f64> = None;
    let mut pending_significant_play = false;

    info!(event_id = %event.event_id, "event monitor started");

    loop {
        tokio::select! {
            Ok(state) = states_rx.recv() => {
                if state.event_id != event.event_id {
                    continue;
                }
                // Monotonic guard: never move state backwards.
                if latest_state
                    .as_ref()
                    .is_some_and(|held| state.fetched_at < held.fetched_at)
                {
                    continue;
                }
                let is_final = state.is_final();
                latest_state = Some(state.clone());

                let output = models.calculate(&event, &state, opening_prior);
                let ModelOutput::Known(probability) = output else {
                    // Malformed state: no signal generation this tick.
                    continue;
                };
                cached_probability = Some(probability.clone());

                let delta = last_evaluated_probability
                    .as_ref()
                    .map_or(f64::INFINITY, |last| probability.delta_from(last));
                if delta >= config.prob_delta_trigger || pending_significant_play {
                    let shifted = pending_significant_play;
                    pending_significant_play = false;
                    last_evaluated_probability = Some(probability.clone());
                    evaluate(
                        &event, &probability, &latest_prices, &detector, &bus,
                        &config, delta, shifted,
                    )
                    .await;
                }

                if is_final {
                    // Self-removal after the in-flight evaluation above.
                    info!(event_id = %event.event_id, "event final, monitor exiting");
                    let _ = removed_tx.send(event.event_id.clone()).await;
                    return;
                }
            }
            Ok(price) = prices_rx.recv() => {
                if price.event_id != event.event_id {
                    continue;
                }
                // Already stale on arrival: ineligible for this tick.
                if !price.is_fresh(Utc::now(), Duration::seconds(config.staleness_ttl_secs)) {
                    continue;
                }
                let key = (price.venue, price.contract_entity.to_lowercase());
                // Consumers drop out-of-order prices by venue sequence.
                if latest_prices
                    .get(&key)
                    .is_some_and(|held| price.sequence < held.sequence)
                {
                    continue;
                }

                if opening_prior.is_none()
                    && price.contract_entity.eq_ignore_ascii_case(&event.entity_a)
                {
                    opening_prior = rust_decimal::prelude::ToPrimitive::to_f64(&price.mid);
                    debug!(event_id = %event.event_id, prior = ?opening_prior, "opening line captured");
                }

                latest_prices.insert(key, price);
                update_probe(&event, &latest_prices, &probes);

                if let Some(probability) = cached_probability.clone() {
                    evaluate(
                        &event, &probability, &latest_prices, &detector, &bus,
                        &config, 0.0, false,
                    )
                    .await;
                }
            }
            Ok(play) = plays_rx.recv() => {
                if play.event_id != event.event_id {
                    continue;
                }
                if play.is_significant() {
                    pending_significant_play = true;
                }
            }
            Some(command) = cmd_rx.recv() => {
                match command {
                    FiberCommand::Evaluate => {
                        if let Some(probability) = cached_probability.clone() {
                            evaluate(
                                &event, &probability, &latest_prices, &detector, &bus,
                                &config, 0.0, false,
                            )
                            .await;
                        }
                    }
                    FiberCommand::Shutdown => {
                        info!(event_id = %event.event_id, "event monitor shutting down");
                        return;
                    }
                }
            }
        }
    }
}

/// Run the detector for every entity of the event and forward signals.
/// Sends apply backpressure when the signal channel is full.
async fn evaluate(
    event: &Event,
    probability: &Probability,
    latest_prices: &HashMap<(Venue, String), MarketPrice>,
    detector: &Detector,
    bus: &Bus,
    config: &ShardConfig,
    delta: f64,
    shifted: bool,
) {
    let now = Utc::now();
    let ttl = Duration::seconds(config.staleness_ttl_secs);

    for (index, entity) in event.entities().enumerate() {
        // The model probability is for entity_a; the other side gets the
        // complement.
        let p = if index == 0 {
            probability.clone()
        } else {
            let mut mirrored = probability.clone();
            mirrored.for_entity = entity.to_string();
            mirrored.p = 1.0 - probability.p;
            mirrored.p_without_blend = 1.0 - probability.p_without_blend;
            mirrored
        };

        let quotes: Vec<VenueQuote> = [Venue::Direct, Venue::Proxied]
            .into_iter()
            .filter_map(|venue| {
                let price = latest_prices.get(&(venue, entity.to_lowercase()))?;
                if !price.is_fresh(now, ttl) {
                    return None;
                }
                let latency_ms =
                    u32::try_from((now - price.updated_utc).num_milliseconds().max(0))
                        .unwrap_or(u32::MAX);
                Some(VenueQuote {
                    price: price.clone(),
                    latency_ms,
                })
            })
            .collect();
        if quotes.is_empty() {
            continue;
        }

        let tick = EvaluationTick {
            event_id: event.event_id.clone(),
            entity: entity.to_string(),
            probability: p,
            quotes,
        };
        let signals = detector.detect(&tick, now);
        let found_opportunity = !signals.is_empty();
        for signal in signals {
            bus.send_signal(signal).await;
        }

        // A large probability move with no priced-in edge is still a
        // tradeable momentum signal; let the processor gate it.
        if !found_opportunity && shifted && delta >= config.prob_delta_trigger && index == 0 {
            if let Some(signal) = win_prob_shift_signal(&tick, delta, now) {
                bus.send_signal(signal).await;
            }
        }
    }
}

/// Momentum signal for a probability jump on a scoring or turnover play.
/// The executable price follows the direction: the ask when the move says
/// buy, the bid when it says sell.
fn win_prob_shift_signal(
    tick: &EvaluationTick,
    delta: f64,
    now: chrono::DateTime<Utc>,
) -> Option<Signal> {
    let quote = tick.quotes.first()?;
    let price = &quote.price;
    let ask = rust_decimal::prelude::ToPrimitive::to_f64(&price.yes_ask)?;
    let bid = rust_decimal::prelude::ToPrimitive::to_f64(&price.yes_bid)?;
    let p = tick.probability.p;

    let (direction, executable, liquidity, raw_edge) = if p >= (ask + bid) / 2.0 {
        (Direction::Buy, price.yes_ask, price.yes_ask_size, p - ask)
    } else {
        (Direction::Sell, price.yes_bid, price.yes_bid_size, bid - p)
    };

    Some(Signal {
        signal_id: SignalId::from(format!("sig-{}", uuid::Uuid::new_v4())),
        event_id: tick.event_id.clone(),
        entity: tick.entity.clone(),
        direction,
        signal_type: SignalType::WinProbShift,
        model_p: p,
        market_p: rust_decimal::prelude::ToPrimitive::to_f64(&executable)?,
        raw_edge_pct: raw_edge,
        net_edge_pct: raw_edge,
        confidence: Signal::confidence_from_edge(delta),
        venue_buy: (direction == Direction::Buy).then_some(price.venue),
        venue_sell: (direction == Direction::Sell).then_some(price.venue),
        buy_price: executable,
        sell_price: (direction == Direction::Sell).then_some(executable),
        liquidity_min: liquidity,
        expires_utc: now + Duration::seconds(15),
        paired_leg_id: None,
        created_utc: now,
    })
}

/// Refresh this event's entry in the shared arbitrage probe map.
fn update_probe(
    event: &Event,
    latest_prices: &HashMap<(Venue, String), MarketPrice>,
    probes: &dashmap::DashMap<crate::domain::EventId, ArbProbe>,
) {
    let entity = event.entity_a.to_lowercase();
    let mut probe = ArbProbe::default();

    if let Some(price) = latest_prices.get(&(Venue::Direct, entity.clone())) {
        probe.direct_yes_ask = u16::try_from(price.yes_ask_cents().value()).unwrap_or(100);
        probe.direct_no_ask = u16::try_from(price.no_ask_cents().value()).unwrap_or(100);
    }
    if let Some(price) = latest_prices.get(&(Venue::Proxied, entity)) {
        probe.proxied_yes_ask = u16::try_from(price.yes_ask_cents().value()).unwrap_or(100);
        probe.proxied_no_ask = u16::try_from(price.no_ask_cents().value()).unwrap_or(100);
    }

    probes.insert(event.event_id.clone(), probe);
}
