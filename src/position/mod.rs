//! Position tracker.
//!
//! Owns the open-position registry and the bankroll. Entry cost is debited
//! through the ledger before a position exists; exits run on a fixed
//! interval against the freshest mirrored prices, and realized profit is
//! partly skimmed into the piggy-bank. A breached drawdown guard pauses all
//! new entries.

mod ledger;

pub use ledger::BankrollLedger;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{Bus, ControlEvent, PositionEvent};
use crate::domain::{
    Cents, Event, EventId, EventState, ExecutionRequest, ExecutionResult, ExitReason,
    IdempotencyKey, MarketId, MarketPrice, MarketType, OrderAction, Position, PositionExit,
    PositionId, RequestId, ResolutionStatus, Side, SignalId, Sport, StateData, Venue,
};
use crate::error::StoreError;

/// Position tracker tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    pub exit_check_interval_ms: u64,
    pub staleness_ttl_secs: i64,
    /// Exit limit sits this much worse than the quoted side.
    pub slippage_bps: i64,
    /// Share of net profit moved to the piggy-bank on a winning exit.
    pub piggybank_pct: f64,
    pub max_drawdown_pct: f64,
    /// Take-profit distance in cents at game start.
    pub take_profit_cents: i64,
    /// Default stop distance for categories not in the sport table.
    pub default_stop_cents: i64,
    /// Optional time stop applied to every entry.
    pub time_stop_secs: Option<i64>,
    pub cas_max_retries: u32,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            exit_check_interval_ms: 500,
            staleness_ttl_secs: 30,
            slippage_bps: 50,
            piggybank_pct: 0.5,
            max_drawdown_pct: 0.15,
            take_profit_cents: 12,
            default_stop_cents: 8,
            time_stop_secs: None,
            cas_max_retries: 8,
        }
    }
}

/// Stop-loss distance in cents of price, per sport.
#[must_use]
pub fn stop_cents_for_sport(sport: Sport) -> i64 {
    match sport {
        Sport::Nba | Sport::Ncaab => 3,
        Sport::Nfl | Sport::Ncaaf => 5,
        Sport::Nhl => 7,
        Sport::Mlb => 6,
    }
}

/// The position tracker service.
pub struct PositionTracker {
    config: PositionConfig,
    ledger: BankrollLedger,
    bus: Bus,
    positions: DashMap<PositionId, Position>,
    /// Registry sharded by event to avoid cross-event contention.
    by_event: DashMap<EventId, Vec<PositionId>>,
    prices: DashMap<(Venue, MarketId), MarketPrice>,
    states: DashMap<EventId, EventState>,
    events: DashMap<EventId, Event>,
    /// Results already applied, for replay and idempotency-hit dedupe.
    seen_results: DashMap<RequestId, ()>,
    /// Contract entity per bound market, from orchestrator bindings.
    entities: DashMap<(Venue, MarketId), String>,
    /// Positions with an exit order in flight, with the exit reason.
    exiting: DashMap<PositionId, ExitReason>,
    next_position_id: AtomicU64,
    pause_published: AtomicBool,
}

impl PositionTracker {
    #[must_use]
    pub fn new(config: PositionConfig, ledger: BankrollLedger, bus: Bus) -> Self {
        Self {
            config,
            ledger,
            bus,
            positions: DashMap::new(),
            by_event: DashMap::new(),
            prices: DashMap::new(),
            states: DashMap::new(),
            events: DashMap::new(),
            seen_results: DashMap::new(),
            entities: DashMap::new(),
            exiting: DashMap::new(),
            next_position_id: AtomicU64::new(1),
            pause_published: AtomicBool::new(false),
        }
    }

    /// Main loop: apply execution results, mirror prices and states, and
    /// run the exit check on its interval.
    pub async fn run(self: Arc<Self>) {
        let mut results = self.bus.subscribe_results();
        let mut prices = self.bus.subscribe_prices();
        let mut states = self.bus.subscribe_states();
        let mut events = self.bus.subscribe_events();
        let mut bindings = self.bus.subscribe_bindings();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
            self.config.exit_check_interval_ms,
        ));

        info!("position tracker started");

        loop {
            tokio::select! {
                Ok(result) = results.recv() => {
                    if let Err(e) = self.apply_result(&result).await {
                        error!(error = %e, request_id = %result.request_id, "failed to apply execution result");
                    }
                }
                Ok(price) = prices.recv() => {
                    let key = (price.venue, price.market_id.clone());
                    let newer = self
                        .prices
                        .get(&key)
                        .map_or(true, |held| price.sequence >= held.sequence);
                    if newer {
                        self.prices.insert(key, price);
                    }
                }
                Ok(state) = states.recv() => {
                    let newer = self
                        .states
                        .get(&state.event_id)
                        .map_or(true, |held| state.fetched_at >= held.fetched_at);
                    if newer {
                        self.states.insert(state.event_id.clone(), state);
                    }
                }
                Ok(event) = events.recv() => {
                    self.events.insert(event.event_id.clone(), event);
                }
                Ok(binding) = bindings.recv() => {
                    self.entities.insert(
                        (binding.venue, binding.market_id),
                        binding.contract_entity,
                    );
                }
                _ = ticker.tick() => {
                    self.run_exit_checks(Utc::now()).await;
                }
            }
        }
    }

    /// Open positions, by value.
    #[must_use]
    pub fn open_positions(&self) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Apply one execution result: fills open positions (buys) or close
    /// them (sells).
    pub async fn apply_result(&self, result: &ExecutionResult) -> Result<(), StoreError> {
        // Replays of the same request (idempotency hits) must not double-
        // apply.
        if self
            .seen_results
            .insert(result.request_id.clone(), ())
            .is_some()
        {
            return Ok(());
        }
        if !result.is_fill() {
            if result.action == OrderAction::Sell {
                // Unfilled exit IOC: release the marker so the next exit
                // tick retries at a fresh price.
                self.release_exit_markers(result);
            }
            return Ok(());
        }

        match result.action {
            OrderAction::Buy => self.open_from_fill(result).await,
            OrderAction::Sell => self.close_from_fill(result).await,
        }
    }

    fn release_exit_markers(&self, result: &ExecutionResult) {
        let stuck: Vec<PositionId> = self
            .exiting
            .iter()
            .filter(|entry| {
                self.positions.get(entry.key()).is_some_and(|p| {
                    p.venue == result.venue
                        && p.market_id == result.market_id
                        && p.side == result.side
                })
            })
            .map(|entry| *entry.key())
            .collect();
        for position_id in stuck {
            self.exiting.remove(&position_id);
        }
    }

    async fn open_from_fill(&self, result: &ExecutionResult) -> Result<(), StoreError> {
        let cost = result.notional() + result.fees;
        // Max possible loss on a binary long is the full entry cost.
        let reserve = result.notional();

        let debited = self
            .ledger
            .mutate(|bankroll| bankroll.debit_entry(cost, reserve))
            .await?;
        let Some(bankroll) = debited else {
            // The gates should have prevented this; surface loudly.
            error!(
                request_id = %result.request_id,
                cost = %cost,
                "fill exceeds available bankroll, position not created"
            );
            return Ok(());
        };

        let (stop_loss_price, take_profit_price) = self.protective_prices(result);
        let position = Position {
            position_id: PositionId::new(self.next_position_id.fetch_add(1, Ordering::Relaxed)),
            signal_id: result.signal_id.clone(),
            venue: result.venue,
            market_id: result.market_id.clone(),
            event_id: result.event_id.clone(),
            entity: self.entity_for(result),
            side: result.side,
            qty_open: result.filled_qty,
            entry_price: result.avg_price,
            entry_fee: result.fees,
            opened_utc: result.executed_utc,
            stop_loss_price,
            take_profit_price,
            time_stop_utc: self
                .config
                .time_stop_secs
                .map(|secs| result.executed_utc + Duration::seconds(secs)),
            exit: None,
        };

        debug!(
            position_id = %position.position_id,
            market_id = %position.market_id,
            qty = position.qty_open,
            entry = %position.entry_price,
            "position opened"
        );
        self.by_event
            .entry(position.event_id.clone())
            .or_default()
            .push(position.position_id);
        self.positions
            .insert(position.position_id, position.clone());
        self.bus.publish_position_event(PositionEvent::Opened(position));

        self.check_drawdown(&bankroll);
        Ok(())
    }

    async fn close_from_fill(&self, result: &ExecutionResult) -> Result<(), StoreError> {
        // Oldest open position on the same (venue, market, side).
        let position_id = self
            .by_event
            .get(&result.event_id)
            .and_then(|ids| {
                ids.iter()
                    .find(|id| {
                        self.positions.get(id).is_some_and(|p| {
                            p.is_open()
                                && p.venue == result.venue
                                && p.market_id == result.market_id
                                && p.side == result.side
                        })
                    })
                    .copied()
            });
        let Some(position_id) = position_id else {
            warn!(
                request_id = %result.request_id,
                market_id = %result.market_id,
                "sell fill without a matching open position"
            );
            return Ok(());
        };

        // Tracker-issued exits carry their reason; any other sell is the
        // engine neutralising an unpaired leg.
        let reason = self
            .exiting
            .remove(&position_id)
            .map_or(ExitReason::OffsetUnpaired, |(_, reason)| reason);
        self.settle_position(
            position_id,
            result.filled_qty,
            result.avg_price,
            result.fees,
            reason,
        )
        .await
    }

    /// Close up to `qty` units of `position_id` at `exit_price`, crediting
    /// the bankroll. A partial exit leaves the remainder open for the next
    /// exit tick.
    async fn settle_position(
        &self,
        position_id: PositionId,
        qty: i64,
        exit_price: Cents,
        exit_fee: Cents,
        reason: ExitReason,
    ) -> Result<(), StoreError> {
        // Snapshot first: registry guards must not be held across the
        // ledger round trip.
        let Some(snapshot) = self.positions.get(&position_id).map(|p| p.value().clone()) else {
            return Ok(());
        };
        if !snapshot.is_open() || qty <= 0 {
            return Ok(());
        }

        let close_qty = qty.min(snapshot.qty_open);
        let full_close = close_qty == snapshot.qty_open;
        // Entry fee attributed pro rata to the closed portion.
        let entry_fee_portion = if full_close {
            snapshot.entry_fee
        } else {
            Cents::new(snapshot.entry_fee.value() * close_qty / snapshot.qty_open)
        };

        let gross = (exit_price - snapshot.entry_price).times(close_qty);
        let realized = gross - entry_fee_portion - exit_fee;
        let proceeds = exit_price.times(close_qty) - exit_fee;
        let released_reserve = snapshot.entry_price.times(close_qty);
        let piggybank_pct = self.config.piggybank_pct;

        let updated = self
            .ledger
            .mutate(|bankroll| {
                bankroll.credit_exit(proceeds, released_reserve, realized, piggybank_pct);
                true
            })
            .await?;

        let exit = PositionExit {
            exit_price,
            exit_fee,
            reason,
            closed_utc: Utc::now(),
            realized_pnl: realized,
        };
        let closed_portion = {
            let Some(mut position) = self.positions.get_mut(&position_id) else {
                return Ok(());
            };
            if full_close {
                position.exit = Some(exit);
                position.clone()
            } else {
                position.qty_open -= close_qty;
                position.entry_fee -= entry_fee_portion;
                let mut portion = position.clone();
                portion.qty_open = close_qty;
                portion.entry_fee = entry_fee_portion;
                portion.exit = Some(exit);
                portion
            }
        };

        info!(
            position_id = %position_id,
            qty = close_qty,
            exit_price = %exit_price,
            pnl = %realized,
            reason = ?reason,
            full_close,
            "position exit"
        );
        if full_close {
            self.exiting.remove(&position_id);
        }
        self.bus
            .publish_position_event(PositionEvent::Closed(closed_portion));

        if let Some(bankroll) = updated {
            self.check_drawdown(&bankroll);
        }
        Ok(())
    }

    /// One pass of the exit loop.
    pub async fn run_exit_checks(&self, now: DateTime<Utc>) {
        let open: Vec<Position> = self.open_positions();
        for position in open {
            if self.exiting.contains_key(&position.position_id) {
                continue;
            }

            // Settlement short-circuits price checks.
            let final_state = self
                .states
                .get(&position.event_id)
                .filter(|state| state.status == ResolutionStatus::Final)
                .map(|state| state.value().clone());
            if let Some(state) = final_state {
                if let Err(e) = self.settle_final(&position, &state).await {
                    error!(error = %e, "settlement failed");
                }
                continue;
            }

            // Scoped so the price guard is released before any await.
            let exit_side_bid = {
                let Some(price) = self
                    .prices
                    .get(&(position.venue, position.market_id.clone()))
                else {
                    continue;
                };
                // Stale prices are ineligible for exit decisions.
                if !price.is_fresh(now, Duration::seconds(self.config.staleness_ttl_secs)) {
                    continue;
                }
                match position.side {
                    Side::Yes => price.yes_bid_cents(),
                    Side::No => Cents::PAYOUT - price.yes_ask_cents(),
                }
            };

            let reason = if exit_side_bid >= position.take_profit_price {
                Some(ExitReason::TakeProfit)
            } else if exit_side_bid <= position.stop_loss_price {
                Some(ExitReason::StopLoss)
            } else if position
                .time_stop_utc
                .is_some_and(|time_stop| now >= time_stop)
            {
                Some(ExitReason::TimeStop)
            } else {
                None
            };

            if let Some(reason) = reason {
                self.place_exit(&position, exit_side_bid, reason, now).await;
            }
        }
    }

    /// Issue an exit IOC at the quoted bid minus the slippage buffer.
    async fn place_exit(
        &self,
        position: &Position,
        bid: Cents,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) {
        let slip = (bid.value() * self.config.slippage_bps / 10_000).max(1);
        let limit = (bid - Cents::new(slip)).max(Cents::new(1));

        debug!(
            position_id = %position.position_id,
            reason = ?reason,
            limit = %limit,
            "placing exit IOC"
        );
        self.exiting.insert(position.position_id, reason);

        let exit_signal = SignalId::from(format!("exit-{}-{}", position.position_id, Uuid::new_v4()));
        self.bus
            .send_request(ExecutionRequest {
                request_id: RequestId::from(format!("req-{}", Uuid::new_v4())),
                signal_id: exit_signal.clone(),
                idempotency_key: IdempotencyKey::derive(&exit_signal, position.side, position.venue),
                venue: position.venue,
                market_id: position.market_id.clone(),
                event_id: position.event_id.clone(),
                side: position.side,
                action: OrderAction::Sell,
                quantity: position.qty_open,
                limit_price: limit,
                paired_leg_request_id: None,
                expires_utc: now + Duration::seconds(10),
                created_utc: now,
            })
            .await;
    }

    /// Settle a position against a final event state: winners pay the full
    /// contract, losers zero. No venue fee applies at settlement.
    async fn settle_final(
        &self,
        position: &Position,
        state: &EventState,
    ) -> Result<(), StoreError> {
        let won = self.did_entity_win(position, state);
        let exit_price = match won {
            Some(true) => Cents::PAYOUT,
            Some(false) => Cents::ZERO,
            // Unknown outcome (e.g. missing metadata): hold for operator.
            None => return Ok(()),
        };
        self.settle_position(
            position.position_id,
            position.qty_open,
            exit_price,
            Cents::ZERO,
            ExitReason::Settlement,
        )
        .await
    }

    /// Did this position's side win, given the final state?
    fn did_entity_win(&self, position: &Position, state: &EventState) -> Option<bool> {
        let event = self.events.get(&position.event_id)?;
        let entity_a_won = match &state.data {
            StateData::Sport(s) => s.score_a > s.score_b,
            StateData::Crypto(c) => {
                let strike = match &event.market_type {
                    MarketType::Crypto { strike, .. } => strike
                        .and_then(|s| s.to_f64())
                        .unwrap_or(c.reference),
                    MarketType::Sport { .. } => return None,
                };
                c.spot >= strike
            }
        };

        let is_entity_a = event.entity_a.eq_ignore_ascii_case(&position.entity);
        let yes_won = if is_entity_a { entity_a_won } else { !entity_a_won };
        Some(match position.side {
            Side::Yes => yes_won,
            Side::No => !yes_won,
        })
    }

    /// Sport- and time-adjusted protective prices: stops tighten as the
    /// game progresses.
    fn protective_prices(&self, result: &ExecutionResult) -> (Cents, Cents) {
        let sport = self
            .events
            .get(&result.event_id)
            .and_then(|event| event.market_type.sport());

        let base_stop = sport.map_or(self.config.default_stop_cents, stop_cents_for_sport);

        let elapsed = sport
            .and_then(|s| {
                self.states
                    .get(&result.event_id)
                    .and_then(|state| state.elapsed_fraction(s.regulation_seconds()))
            })
            .unwrap_or(0.0);
        // Full distance pregame, halved by the final whistle.
        let factor = 1.0 - 0.5 * elapsed.clamp(0.0, 1.0);

        let stop_distance = ((base_stop as f64 * factor).round() as i64).max(1);
        let tp_distance = ((self.config.take_profit_cents as f64 * factor).round() as i64).max(2);

        let stop = (result.avg_price - Cents::new(stop_distance)).max(Cents::new(1));
        let take_profit = (result.avg_price + Cents::new(tp_distance)).min(Cents::new(99));
        (stop, take_profit)
    }

    /// The contract entity for a fill, from the market binding.
    fn entity_for(&self, result: &ExecutionResult) -> String {
        self.entities
            .get(&(result.venue, result.market_id.clone()))
            .map(|entity| entity.clone())
            .or_else(|| {
                self.events
                    .get(&result.event_id)
                    .map(|event| event.entity_a.clone())
            })
            .unwrap_or_default()
    }

    fn check_drawdown(&self, bankroll: &crate::domain::Bankroll) {
        if bankroll.breaches_drawdown(self.config.max_drawdown_pct) {
            if !self.pause_published.swap(true, Ordering::SeqCst) {
                warn!(
                    drawdown = bankroll.drawdown_fraction(),
                    "drawdown guard breached, pausing trading"
                );
                self.bus.publish_control(ControlEvent::PauseTrading {
                    reason: format!(
                        "drawdown {:.2}% exceeds limit",
                        bankroll.drawdown_fraction() * 100.0
                    ),
                });
            }
        } else {
            self.pause_published.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests;
