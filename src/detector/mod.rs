//! Opportunity detector.
//!
//! For each evaluation tick the detector sees one event's model probability
//! and up to two venue quotes, and proposes at most one opportunity: the
//! best model-edge candidate or a cross-venue arbitrage pair. Edges are
//! always computed against executable prices (the ask when buying, the bid
//! when selling), never the mid. The arbitrage predicate runs in integer
//! cents.

mod batch;

pub use batch::{pad_to_lanes, scan_arbitrage_pairs};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{
    Direction, EventId, MarketPrice, Probability, Signal, SignalId, SignalType, Venue,
};
use crate::fees::FeeModel;

/// Detector tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Minimum top-of-book size on the relevant side, in units.
    #[serde(default = "default_min_liquidity")]
    pub min_liquidity: Decimal,
    /// Net-edge floor for proposing a candidate at all; the signal
    /// processor applies the final `min_edge_pct` gate.
    #[serde(default)]
    pub min_net_edge: f64,
    #[serde(default = "default_model_signal_ttl_secs")]
    pub model_signal_ttl_secs: i64,
    /// Arbitrage must execute quickly or not at all.
    #[serde(default = "default_arbitrage_ttl_secs")]
    pub arbitrage_ttl_secs: i64,
    /// Subtract entry fees from arbitrage edge. Off by default: paired legs
    /// are held to settlement and gated on gross integer-cent profit, with
    /// fees attributed against realized P&L at execution.
    #[serde(default)]
    pub arb_fee_netting: bool,
}

fn default_min_liquidity() -> Decimal {
    Decimal::ONE_HUNDRED
}

fn default_model_signal_ttl_secs() -> i64 {
    30
}

fn default_arbitrage_ttl_secs() -> i64 {
    10
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_liquidity: default_min_liquidity(),
            min_net_edge: 0.0,
            model_signal_ttl_secs: default_model_signal_ttl_secs(),
            arbitrage_ttl_secs: default_arbitrage_ttl_secs(),
            arb_fee_netting: false,
        }
    }
}

/// One venue's quote entering an evaluation, with feed latency for
/// tie-breaking.
#[derive(Debug, Clone)]
pub struct VenueQuote {
    pub price: MarketPrice,
    pub latency_ms: u32,
}

/// Everything the detector needs for one `(event, entity)` evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationTick {
    pub event_id: EventId,
    pub entity: String,
    pub probability: Probability,
    /// Up to one quote per venue.
    pub quotes: Vec<VenueQuote>,
}

/// Internal ranked candidate.
enum Candidate {
    ModelEdge {
        venue: Venue,
        latency_ms: u32,
        direction: Direction,
        signal_type: SignalType,
        executable: Decimal,
        liquidity: Decimal,
        raw_edge: f64,
        net_edge: f64,
    },
    Arbitrage {
        yes_venue: Venue,
        no_venue: Venue,
        latency_ms: u32,
        yes_ask: Decimal,
        no_ask: Decimal,
        liquidity: Decimal,
        raw_edge: f64,
        net_edge: f64,
    },
}

impl Candidate {
    const fn net_edge(&self) -> f64 {
        match self {
            Self::ModelEdge { net_edge, .. } | Self::Arbitrage { net_edge, .. } => *net_edge,
        }
    }

    const fn latency_ms(&self) -> u32 {
        match self {
            Self::ModelEdge { latency_ms, .. } | Self::Arbitrage { latency_ms, .. } => *latency_ms,
        }
    }

    fn venue_rank(&self) -> u8 {
        match self {
            Self::ModelEdge { venue, .. } => venue.tie_break_rank(),
            Self::Arbitrage { yes_venue, no_venue, .. } => {
                yes_venue.tie_break_rank().min(no_venue.tie_break_rank())
            }
        }
    }
}

/// Opportunity detector over per-event price tuples.
pub struct Detector {
    config: DetectorConfig,
    fees: FeeModel,
}

impl Detector {
    #[must_use]
    pub fn new(config: DetectorConfig, fees: FeeModel) -> Self {
        Self { config, fees }
    }

    #[must_use]
    pub const fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Evaluate one tick. Returns zero signals, one model-edge signal, or a
    /// paired pair of arbitrage signals.
    #[must_use]
    pub fn detect(&self, tick: &EvaluationTick, now: DateTime<Utc>) -> Vec<Signal> {
        let mut candidates = Vec::new();

        for quote in &tick.quotes {
            self.model_edge_candidates(tick, quote, &mut candidates);
        }

        // Cross-venue arbitrage over each ordered venue pair.
        for yes_quote in &tick.quotes {
            for no_quote in &tick.quotes {
                if yes_quote.price.venue == no_quote.price.venue {
                    continue;
                }
                self.arbitrage_candidate(yes_quote, no_quote, &mut candidates);
            }
        }

        // Higher net edge wins; then lower latency; then Direct over Proxied.
        candidates.sort_by(|a, b| {
            b.net_edge()
                .partial_cmp(&a.net_edge())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.latency_ms().cmp(&b.latency_ms()))
                .then_with(|| a.venue_rank().cmp(&b.venue_rank()))
        });

        match candidates.into_iter().next() {
            Some(best) => self.emit(tick, best, now),
            None => Vec::new(),
        }
    }

    fn model_edge_candidates(
        &self,
        tick: &EvaluationTick,
        quote: &VenueQuote,
        out: &mut Vec<Candidate>,
    ) {
        let price = &quote.price;
        let model_p = tick.probability.p;

        // Buying YES at the ask.
        if let Some(ask) = price.yes_ask.to_f64() {
            let raw = model_p - ask;
            let net = raw - self.fees.round_trip_rate(price.venue, price.yes_ask);
            if net > self.config.min_net_edge && price.yes_ask_size >= self.config.min_liquidity {
                out.push(Candidate::ModelEdge {
                    venue: price.venue,
                    latency_ms: quote.latency_ms,
                    direction: Direction::Buy,
                    signal_type: SignalType::ModelEdgeYes,
                    executable: price.yes_ask,
                    liquidity: price.yes_ask_size,
                    raw_edge: raw,
                    net_edge: net,
                });
            }
        }

        // Selling YES at the bid (equivalently buying NO).
        if let Some(bid) = price.yes_bid.to_f64() {
            let raw = bid - model_p;
            let net = raw - self.fees.round_trip_rate(price.venue, price.yes_bid);
            if net > self.config.min_net_edge && price.yes_bid_size >= self.config.min_liquidity {
                out.push(Candidate::ModelEdge {
                    venue: price.venue,
                    latency_ms: quote.latency_ms,
                    direction: Direction::Sell,
                    signal_type: SignalType::ModelEdgeNo,
                    executable: price.yes_bid,
                    liquidity: price.yes_bid_size,
                    raw_edge: raw,
                    net_edge: net,
                });
            }
        }
    }

    fn arbitrage_candidate(
        &self,
        yes_quote: &VenueQuote,
        no_quote: &VenueQuote,
        out: &mut Vec<Candidate>,
    ) {
        let yes_price = &yes_quote.price;
        let no_price = &no_quote.price;

        // Integer-cent predicate: strict inequality, no profit at exactly $1.
        let yes_ask_cents = yes_price.yes_ask_cents().value();
        let no_ask_cents = no_price.no_ask_cents().value();
        if yes_ask_cents + no_ask_cents >= 100 {
            return;
        }
        let profit_cents = 100 - (yes_ask_cents + no_ask_cents);
        let raw = profit_cents as f64 / 100.0;

        let no_ask = Decimal::ONE - no_price.yes_bid;
        // Held to settlement: at most the entry fees apply.
        let net = if self.config.arb_fee_netting {
            raw - self.fees.side_rate(yes_price.venue, yes_price.yes_ask)
                - self.fees.side_rate(no_price.venue, no_ask)
        } else {
            raw
        };

        let liquidity = yes_price.yes_ask_size.min(no_price.yes_bid_size);
        if net <= self.config.min_net_edge || liquidity < self.config.min_liquidity {
            return;
        }

        out.push(Candidate::Arbitrage {
            yes_venue: yes_price.venue,
            no_venue: no_price.venue,
            latency_ms: yes_quote.latency_ms.max(no_quote.latency_ms),
            yes_ask: yes_price.yes_ask,
            no_ask,
            liquidity,
            raw_edge: raw,
            net_edge: net,
        });
    }

    fn emit(&self, tick: &EvaluationTick, best: Candidate, now: DateTime<Utc>) -> Vec<Signal> {
        match best {
            Candidate::ModelEdge {
                venue,
                direction,
                signal_type,
                executable,
                liquidity,
                raw_edge,
                net_edge,
                ..
            } => {
                let market_p = executable.to_f64().unwrap_or(0.0);
                vec![Signal {
                    signal_id: SignalId::from(format!("sig-{}", Uuid::new_v4())),
                    event_id: tick.event_id.clone(),
                    entity: tick.entity.clone(),
                    direction,
                    signal_type,
                    model_p: tick.probability.p,
                    market_p,
                    raw_edge_pct: raw_edge,
                    net_edge_pct: net_edge,
                    confidence: Signal::confidence_from_edge(raw_edge),
                    venue_buy: (direction == Direction::Buy).then_some(venue),
                    venue_sell: (direction == Direction::Sell).then_some(venue),
                    buy_price: executable,
                    sell_price: (direction == Direction::Sell).then_some(executable),
                    liquidity_min: liquidity,
                    expires_utc: now + Duration::seconds(self.config.model_signal_ttl_secs),
                    paired_leg_id: None,
                    created_utc: now,
                }]
            }
            Candidate::Arbitrage {
                yes_venue,
                no_venue,
                yes_ask,
                no_ask,
                liquidity,
                raw_edge,
                net_edge,
                ..
            } => {
                let yes_id = SignalId::from(format!("sig-{}", Uuid::new_v4()));
                let no_id = SignalId::from(format!("sig-{}", Uuid::new_v4()));
                let expires = now + Duration::seconds(self.config.arbitrage_ttl_secs);
                let confidence = 1.0; // Risk-free once both legs fill.

                let leg = |signal_id: SignalId,
                           paired: SignalId,
                           signal_type: SignalType,
                           venue: Venue,
                           other: Venue,
                           price: Decimal| Signal {
                    signal_id,
                    event_id: tick.event_id.clone(),
                    entity: tick.entity.clone(),
                    direction: Direction::Buy,
                    signal_type,
                    model_p: tick.probability.p,
                    market_p: price.to_f64().unwrap_or(0.0),
                    raw_edge_pct: raw_edge,
                    net_edge_pct: net_edge,
                    confidence,
                    venue_buy: Some(venue),
                    venue_sell: Some(other),
                    buy_price: price,
                    sell_price: None,
                    liquidity_min: liquidity,
                    expires_utc: expires,
                    paired_leg_id: Some(paired),
                    created_utc: now,
                };

                vec![
                    leg(
                        yes_id.clone(),
                        no_id.clone(),
                        SignalType::ArbitrageYesNo,
                        yes_venue,
                        no_venue,
                        yes_ask,
                    ),
                    leg(
                        no_id,
                        yes_id,
                        SignalType::ArbitrageNoYes,
                        no_venue,
                        yes_venue,
                        no_ask,
                    ),
                ]
            }
        }
    }
}
