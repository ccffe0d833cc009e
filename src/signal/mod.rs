//! Signal processor.
//!
//! Consumes detector candidates and applies, in order: freshness, fee-aware
//! edge recompute, probability bounds, risk gates, cooldown, dedupe, and
//! sizing, then emits execution requests. Rejections are published to the
//! observability channel with a structured reason; they are business data,
//! not errors.

mod sizing;

pub use sizing::{kelly_fraction, size_entry, SizingInputs, SizingParams};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Bus, ControlEvent, Heartbeat, MarketBinding, PositionEvent};
use crate::domain::{
    Bankroll, Cents, Direction, Event, EventId, ExecutionRequest, IdempotencyKey, MarketId,
    MarketPrice, MarketType, Position, PositionId, RejectReason, RejectedSignal, RequestId, Side,
    Signal, SignalId, Venue,
};
use crate::fees::FeeModel;
use crate::store::Repository;

/// Signal-processor tunables. Defaults follow the engine-wide conventions
/// (30 s staleness, 1 pp minimum edge).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub staleness_ttl_secs: i64,
    pub min_edge_pct: f64,
    pub min_buy_prob: f64,
    pub max_buy_prob: f64,
    pub max_daily_loss: Cents,
    pub max_event_exposure: Cents,
    pub max_category_exposure: Cents,
    pub max_open_positions_per_event: usize,
    pub cooldown_loss_secs: i64,
    pub cooldown_win_secs: i64,
    /// A push (exit at entry) counts as a win for cooldown purposes.
    pub push_counts_as_win: bool,
    pub dedupe_window_secs: i64,
    /// A duplicate passes anyway when net edge improved by at least this.
    pub dedupe_improvement_pp: f64,
    pub kelly_fraction: f64,
    pub large_edge_pp: f64,
    pub max_position_pct: f64,
    pub arbitrage_request_ttl_secs: i64,
    /// Recompute fee-adjusted edge here (the detector already did once for
    /// venue selection).
    pub recompute_fee_edge: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            staleness_ttl_secs: 30,
            min_edge_pct: 0.01,
            min_buy_prob: 0.08,
            max_buy_prob: 0.92,
            max_daily_loss: Cents::from_dollars(500),
            max_event_exposure: Cents::from_dollars(250),
            max_category_exposure: Cents::from_dollars(1_000),
            max_open_positions_per_event: 2,
            cooldown_loss_secs: 45,
            cooldown_win_secs: 15,
            push_counts_as_win: true,
            dedupe_window_secs: 45,
            dedupe_improvement_pp: 0.01,
            kelly_fraction: 0.25,
            large_edge_pp: 0.10,
            max_position_pct: 0.05,
            arbitrage_request_ttl_secs: 10,
            recompute_fee_edge: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupeKey {
    event_id: EventId,
    entity: String,
    direction: Direction,
    venue: Venue,
}

#[derive(Debug)]
struct DedupeEntry {
    key: DedupeKey,
    net_edge: f64,
    at: DateTime<Utc>,
}

/// Mutable mirrors maintained from bus traffic.
#[derive(Default)]
struct ProcessorState {
    bankroll: Option<Bankroll>,
    open_positions: HashMap<PositionId, Position>,
    daily_date: Option<NaiveDate>,
    daily_realized: Cents,
    cooldowns: HashMap<(EventId, String), DateTime<Utc>>,
    recent: VecDeque<DedupeEntry>,
    prices: HashMap<(Venue, MarketId), MarketPrice>,
    bindings: HashMap<(EventId, Venue), Vec<MarketBinding>>,
    categories: HashMap<EventId, String>,
    paused: bool,
    suspended: HashSet<EventId>,
    pending_legs: HashMap<SignalId, Signal>,
}

impl ProcessorState {
    fn binding_for(&self, event_id: &EventId, entity: &str, venue: Venue) -> Option<&MarketBinding> {
        self.bindings.get(&(event_id.clone(), venue))?.iter().find(|b| {
            b.contract_entity.eq_ignore_ascii_case(entity)
        })
    }

    fn rotate_daily(&mut self, today: NaiveDate) {
        if self.daily_date != Some(today) {
            self.daily_date = Some(today);
            self.daily_realized = Cents::ZERO;
        }
    }

    /// Unrealized P&L across open positions, from mirrored prices.
    fn unrealized(&self) -> Cents {
        self.open_positions
            .values()
            .filter_map(|p| {
                let price = self.prices.get(&(p.venue, p.market_id.clone()))?;
                let current = match p.side {
                    Side::Yes => price.yes_bid_cents(),
                    // A NO holding exits into the NO bid, i.e. 1 - yes_ask.
                    Side::No => Cents::PAYOUT - price.yes_ask_cents(),
                };
                Some((current - p.entry_price).times(p.qty_open))
            })
            .sum()
    }

    fn event_exposure(&self, event_id: &EventId) -> Cents {
        self.open_positions
            .values()
            .filter(|p| &p.event_id == event_id)
            .map(Position::entry_notional)
            .sum()
    }

    fn category_exposure(&self, category: &str) -> Cents {
        self.open_positions
            .values()
            .filter(|p| {
                self.categories
                    .get(&p.event_id)
                    .is_some_and(|c| c == category)
            })
            .map(Position::entry_notional)
            .sum()
    }

    fn open_count(&self, event_id: &EventId) -> usize {
        self.open_positions
            .values()
            .filter(|p| &p.event_id == event_id)
            .count()
    }
}

/// Category key for exposure limits: sport name or asset symbol.
fn category_of(event: &Event) -> String {
    match &event.market_type {
        MarketType::Sport { sport, .. } => sport.as_str().to_string(),
        MarketType::Crypto { asset, .. } => asset.clone(),
    }
}

/// The signal processor service.
pub struct SignalProcessor {
    config: ProcessorConfig,
    fees: FeeModel,
    bus: Bus,
    repo: Arc<dyn Repository>,
    state: Mutex<ProcessorState>,
}

impl SignalProcessor {
    #[must_use]
    pub fn new(config: ProcessorConfig, fees: FeeModel, bus: Bus, repo: Arc<dyn Repository>) -> Self {
        Self {
            config,
            fees,
            bus,
            repo,
            state: Mutex::new(ProcessorState::default()),
        }
    }

    /// Main loop: consume signals and keep the state mirrors current.
    pub async fn run(self: Arc<Self>) {
        let mut intake = self.bus.take_signal_intake();
        let mut positions = self.bus.subscribe_position_events();
        let mut bankroll = self.bus.subscribe_bankroll();
        let mut control = self.bus.subscribe_control();
        let mut prices = self.bus.subscribe_prices();
        let mut bindings = self.bus.subscribe_bindings();
        let mut events = self.bus.subscribe_events();

        info!("signal processor started");

        loop {
            tokio::select! {
                signal = intake.recv() => {
                    let Some(signal) = signal else { break };
                    self.handle_signal(signal, Utc::now()).await;
                }
                Ok(event) = positions.recv() => self.observe_position_event(event),
                Ok(b) = bankroll.recv() => self.state.lock().bankroll = Some(b),
                Ok(event) = control.recv() => self.observe_control(event),
                Ok(price) = prices.recv() => {
                    let mut state = self.state.lock();
                    let key = (price.venue, price.market_id.clone());
                    // Out-of-order snapshots are dropped by venue sequence.
                    let newer = state
                        .prices
                        .get(&key)
                        .map_or(true, |held| price.sequence >= held.sequence);
                    if newer {
                        state.prices.insert(key, price);
                    }
                }
                Ok(binding) = bindings.recv() => {
                    let mut state = self.state.lock();
                    state
                        .bindings
                        .entry((binding.event_id.clone(), binding.venue))
                        .or_default()
                        .push(binding);
                }
                Ok(event) = events.recv() => self.register_event(&event),
            }
        }

        info!("signal processor stopped");
    }

    /// Record event metadata used for category exposure limits.
    pub fn register_event(&self, event: &Event) {
        self.state
            .lock()
            .categories
            .insert(event.event_id.clone(), category_of(event));
    }

    /// Process one signal; emit requests or a structured rejection.
    pub async fn handle_signal(&self, signal: Signal, now: DateTime<Utc>) {
        match self.process(signal.clone(), now) {
            Ok(requests) => {
                if requests.is_empty() {
                    // First arbitrage leg parked until its partner arrives.
                    return;
                }
                if let Err(e) = self.repo.record_signal(&signal).await {
                    warn!(error = %e, "failed to record signal");
                }
                for request in requests {
                    self.bus.send_request(request).await;
                }
            }
            Err(reason) => {
                debug!(
                    signal_id = %signal.signal_id,
                    reason = reason.as_str(),
                    "signal rejected"
                );
                self.bus.publish_rejected(RejectedSignal {
                    signal,
                    reason,
                    rejected_utc: now,
                });
            }
        }
    }

    /// Gate pipeline. Returns the emitted requests; an empty vec means the
    /// signal was parked (first leg of a pair).
    pub fn process(
        &self,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRequest>, RejectReason> {
        let mut state = self.state.lock();
        state.rotate_daily(now.date_naive());

        // Kill switch and drawdown pause are observed at every dispatch.
        if self.bus.kill_switch_engaged() {
            return Err(RejectReason::KillSwitch);
        }
        if state.paused {
            return Err(RejectReason::DrawdownPause);
        }

        if signal.is_arbitrage() {
            if state.suspended.contains(&signal.event_id) {
                return Err(RejectReason::EventSuspended);
            }
            return self.process_arbitrage(&mut state, signal, now);
        }

        self.gate_common(&state, &signal, now)?;
        self.gate_model_edge(&state, &signal, now)?;
        self.gate_dedupe(&mut state, &signal, now)?;

        let request = self.size_and_build(&mut state, &signal, now)?;
        Ok(vec![request])
    }

    fn process_arbitrage(
        &self,
        state: &mut ProcessorState,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRequest>, RejectReason> {
        let Some(partner_id) = signal.paired_leg_id.clone() else {
            return Err(RejectReason::UnpairedLeg);
        };

        // Park the first leg; purge parked legs that expired unpaired.
        state
            .pending_legs
            .retain(|_, parked| parked.is_live_at(now));

        let Some(partner) = state.pending_legs.remove(&partner_id) else {
            state.pending_legs.insert(signal.signal_id.clone(), signal);
            return Ok(Vec::new());
        };

        // Both legs present: gate the pair as one opportunity.
        for leg in [&partner, &signal] {
            self.gate_common(state, leg, now)?;
        }
        self.gate_dedupe(state, &signal, now)?;

        let bankroll = state
            .bankroll
            .as_ref()
            .ok_or(RejectReason::InsufficientBankroll)?;
        let available = bankroll.available();

        // Equal size on both legs, bounded by the smaller top-of-book and
        // by what the bankroll can pay for the combined cost plus fees.
        let combined_cost = leg_price_cents(&partner) + leg_price_cents(&signal);
        if combined_cost <= Cents::ZERO {
            return Err(RejectReason::ZeroSize);
        }
        let fee_buffer = 1.0
            + self.fees.side_rate(leg_venue(&partner), partner.buy_price)
            + self.fees.side_rate(leg_venue(&signal), signal.buy_price);
        let affordable =
            (available.value() as f64 / (combined_cost.value() as f64 * fee_buffer)).floor() as i64;
        let liquidity = signal.liquidity_min.to_f64().unwrap_or(0.0).floor() as i64;
        let qty = affordable.min(liquidity);
        if qty < 1 {
            return Err(RejectReason::ZeroSize);
        }

        let expires = now + Duration::seconds(self.config.arbitrage_request_ttl_secs);
        let first_id = RequestId::from(format!("req-{}", Uuid::new_v4()));
        let second_id = RequestId::from(format!("req-{}", Uuid::new_v4()));

        let first = self.build_request(
            state,
            &partner,
            first_id.clone(),
            Some(second_id.clone()),
            qty,
            expires,
            now,
        )?;
        let second = self.build_request(
            state,
            &signal,
            second_id,
            Some(first_id),
            qty,
            expires,
            now,
        )?;

        Ok(vec![first, second])
    }

    /// Gates shared by every signal: freshness, fee-adjusted edge, and the
    /// risk gates over the bankroll and exposure mirrors.
    fn gate_common(
        &self,
        state: &ProcessorState,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        // Expiry first: strict at the boundary.
        if !signal.is_live_at(now) {
            return Err(RejectReason::Expired);
        }

        // Freshness of the underlying price.
        let ttl = Duration::seconds(self.config.staleness_ttl_secs);
        let venue = leg_venue(signal);
        let mirror = state
            .binding_for(&signal.event_id, &signal.entity, venue)
            .and_then(|b| state.prices.get(&(venue, b.market_id.clone())));
        match mirror {
            Some(price) if !price.is_fresh(now, ttl) => return Err(RejectReason::StalePrice),
            Some(_) => {}
            // No mirrored price yet: fall back to the signal's own age.
            None if now - signal.created_utc >= ttl => return Err(RejectReason::StalePrice),
            None => {}
        }

        // Fee-adjusted edge, recomputed here as the final gate.
        let net_edge = if signal.is_arbitrage() || !self.config.recompute_fee_edge {
            signal.net_edge_pct
        } else {
            signal.raw_edge_pct - self.fees.round_trip_rate(venue, signal.buy_price)
        };
        if net_edge < self.config.min_edge_pct {
            return Err(RejectReason::ThinEdge);
        }

        // Risk gates.
        let bankroll = state
            .bankroll
            .as_ref()
            .ok_or(RejectReason::InsufficientBankroll)?;
        if !bankroll.available().is_positive() {
            return Err(RejectReason::InsufficientBankroll);
        }

        let daily_pnl = state.daily_realized + state.unrealized();
        if (-daily_pnl) >= self.config.max_daily_loss {
            return Err(RejectReason::DailyLossLimit);
        }

        if state.event_exposure(&signal.event_id) >= self.config.max_event_exposure {
            return Err(RejectReason::EventExposureLimit);
        }

        if let Some(category) = state.categories.get(&signal.event_id) {
            if state.category_exposure(category) >= self.config.max_category_exposure {
                return Err(RejectReason::CategoryExposureLimit);
            }
        }

        if state.open_count(&signal.event_id) >= self.config.max_open_positions_per_event {
            return Err(RejectReason::TooManyOpenPositions);
        }

        // Cooldown is per (event, entity), so the opposite side of the same
        // game is not blocked.
        let cooldown_key = (signal.event_id.clone(), signal.entity.to_lowercase());
        if let Some(until) = state.cooldowns.get(&cooldown_key) {
            if now < *until {
                return Err(RejectReason::Cooldown);
            }
        }

        Ok(())
    }

    fn gate_model_edge(
        &self,
        _state: &ProcessorState,
        signal: &Signal,
        _now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        // Extreme probabilities are numeric noise, not edge.
        if signal.model_p < self.config.min_buy_prob || signal.model_p > self.config.max_buy_prob {
            return Err(RejectReason::ProbabilityOutOfBounds);
        }
        Ok(())
    }

    fn gate_dedupe(
        &self,
        state: &mut ProcessorState,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        let window = Duration::seconds(self.config.dedupe_window_secs);
        state.recent.retain(|entry| now - entry.at < window);

        let key = DedupeKey {
            event_id: signal.event_id.clone(),
            entity: signal.entity.to_lowercase(),
            direction: signal.direction,
            venue: leg_venue(signal),
        };

        if let Some(previous) = state.recent.iter().filter(|e| e.key == key).last() {
            if signal.net_edge_pct < previous.net_edge + self.config.dedupe_improvement_pp {
                return Err(RejectReason::Duplicate);
            }
        }

        state.recent.push_back(DedupeEntry {
            key,
            net_edge: signal.net_edge_pct,
            at: now,
        });
        Ok(())
    }

    fn size_and_build(
        &self,
        state: &mut ProcessorState,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRequest, RejectReason> {
        let bankroll = state
            .bankroll
            .as_ref()
            .ok_or(RejectReason::InsufficientBankroll)?;

        let venue = leg_venue(signal);
        // For a sell signal the contract actually bought is NO at 1 - bid.
        let (model_p, buy_price) = match signal.direction {
            Direction::Buy => (signal.model_p, signal.buy_price),
            Direction::Sell => (
                1.0 - signal.model_p,
                rust_decimal::Decimal::ONE - signal.buy_price,
            ),
        };

        let qty = size_entry(
            &SizingInputs {
                model_p,
                buy_price,
                raw_edge_pct: signal.raw_edge_pct,
                confidence: signal.confidence,
                liquidity_min: signal.liquidity_min,
                available: bankroll.available(),
                total_balance: bankroll.balance,
                round_trip_fee_rate: self.fees.round_trip_rate(venue, buy_price),
            },
            &SizingParams {
                kelly_fraction: self.config.kelly_fraction,
                large_edge_pp: self.config.large_edge_pp,
                max_position_pct: self.config.max_position_pct,
            },
        );
        if qty < 1 {
            return Err(RejectReason::ZeroSize);
        }

        self.build_request(
            state,
            signal,
            RequestId::from(format!("req-{}", Uuid::new_v4())),
            None,
            qty,
            signal.expires_utc,
            now,
        )
    }

    fn build_request(
        &self,
        state: &ProcessorState,
        signal: &Signal,
        request_id: RequestId,
        paired_leg_request_id: Option<RequestId>,
        qty: i64,
        expires_utc: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRequest, RejectReason> {
        let venue = leg_venue(signal);
        let binding = state
            .binding_for(&signal.event_id, &signal.entity, venue)
            .ok_or(RejectReason::NoMarketBinding)?;

        let (side, limit_price) = leg_side_and_price(signal);

        Ok(ExecutionRequest {
            request_id,
            signal_id: signal.signal_id.clone(),
            idempotency_key: IdempotencyKey::derive(&signal.signal_id, side, venue),
            venue,
            market_id: binding.market_id.clone(),
            event_id: signal.event_id.clone(),
            side,
            action: crate::domain::OrderAction::Buy,
            quantity: qty,
            limit_price,
            paired_leg_request_id,
            expires_utc,
            created_utc: now,
        })
    }

    fn observe_position_event(&self, event: PositionEvent) {
        let mut state = self.state.lock();
        match event {
            PositionEvent::Opened(position) => {
                state.open_positions.insert(position.position_id, position);
            }
            PositionEvent::Closed(position) => {
                state.open_positions.remove(&position.position_id);
                let Some(exit) = position.exit.as_ref() else {
                    return;
                };
                state.daily_realized += exit.realized_pnl;

                let win = exit.realized_pnl.is_positive()
                    || (self.config.push_counts_as_win && position.is_push());
                let secs = if win {
                    self.config.cooldown_win_secs
                } else {
                    self.config.cooldown_loss_secs
                };
                state.cooldowns.insert(
                    (position.event_id.clone(), position.entity.to_lowercase()),
                    exit.closed_utc + Duration::seconds(secs),
                );
            }
        }
    }

    fn observe_control(&self, event: ControlEvent) {
        let mut state = self.state.lock();
        match event {
            ControlEvent::PauseTrading { reason } => {
                warn!(reason = %reason, "trading paused");
                state.paused = true;
                self.bus
                    .publish_heartbeat(Heartbeat::unhealthy("signal_processor", reason));
            }
            ControlEvent::ResumeTrading => {
                info!("trading resumed");
                state.paused = false;
                self.bus
                    .publish_heartbeat(Heartbeat::healthy("signal_processor"));
            }
            ControlEvent::SuspendEvent { event_id, reason } => {
                warn!(event_id = %event_id, reason = %reason, "event suspended for arbitrage");
                state.suspended.insert(event_id);
            }
            ControlEvent::ResumeEvent { event_id } => {
                state.suspended.remove(&event_id);
            }
        }
    }
}

/// The venue a signal trades on.
fn leg_venue(signal: &Signal) -> Venue {
    match signal.direction {
        Direction::Buy => signal.venue_buy.unwrap_or(Venue::Paper),
        Direction::Sell => signal.venue_sell.unwrap_or(Venue::Paper),
    }
}

/// Wire side and limit price: a sell of YES is a buy of NO at `1 - bid`.
fn leg_side_and_price(signal: &Signal) -> (Side, Cents) {
    match signal.direction {
        Direction::Buy => {
            if signal.signal_type == crate::domain::SignalType::ArbitrageNoYes {
                (
                    Side::No,
                    Cents::from_price(signal.buy_price).unwrap_or(Cents::ZERO),
                )
            } else {
                (
                    Side::Yes,
                    Cents::from_price(signal.buy_price).unwrap_or(Cents::ZERO),
                )
            }
        }
        Direction::Sell => (
            Side::No,
            Cents::PAYOUT - Cents::from_price(signal.buy_price).unwrap_or(Cents::ZERO),
        ),
    }
}

fn leg_price_cents(signal: &Signal) -> Cents {
    Cents::from_price(signal.buy_price).unwrap_or(Cents::ZERO)
}
