//! Execution engine.
//!
//! Places immediate-or-cancel orders through per-venue clients, with
//! token-bucket rate limiting, 429 backoff (never counted by the circuit
//! breaker), deterministic idempotency, and paired-leg coordination that
//! never leaves a one-sided arbitrage position.

mod breaker;
mod client;
mod direct;
mod idempotency;
mod paper;
mod proxied;
mod rate_limit;

pub use breaker::CircuitBreaker;
pub use client::{RequestSigner, SignedHeaders, VenueClient, VenueFill, VenueOrder, VenueOrderState};
pub use direct::DirectVenueClient;
pub use idempotency::IdempotencyStore;
pub use paper::PaperVenueClient;
pub use proxied::ProxiedVenueClient;
pub use rate_limit::TokenBucket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{Bus, ControlEvent, Heartbeat};
use crate::domain::{
    Cents, ExecutionRequest, ExecutionResult, MarketId, MarketPrice, OrderAction, OrderStatus,
    RequestId, Side, Venue,
};
use crate::error::ExecutionError;
use crate::fees::FeeModel;
use crate::store::Repository;

/// Engine tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub direct_rate_per_sec: u32,
    pub direct_burst: u32,
    pub proxied_rate_per_sec: u32,
    pub proxied_burst: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    /// 429 retry schedule: initial backoff doubling up to the cap.
    pub rate_limit_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_cap_ms: u64,
    /// Slippage buffer in cents for the offsetting IOC on an unpaired leg.
    pub offset_slippage_cents: i64,
    pub idempotency_ttl_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            direct_rate_per_sec: 10,
            direct_burst: 20,
            proxied_rate_per_sec: 5,
            proxied_burst: 10,
            breaker_threshold: 5,
            breaker_cooldown_secs: 30,
            rate_limit_retries: 5,
            backoff_initial_ms: 4_000,
            backoff_cap_ms: 16_000,
            offset_slippage_cents: 1,
            idempotency_ttl_secs: 600,
        }
    }
}

/// Per-venue placement machinery.
struct VenueLane {
    client: Arc<dyn VenueClient>,
    limiter: TokenBucket,
    breaker: CircuitBreaker,
}

/// The execution engine service.
pub struct ExecutionEngine {
    lanes: HashMap<Venue, VenueLane>,
    idempotency: IdempotencyStore,
    fees: FeeModel,
    bus: Bus,
    repo: Arc<dyn Repository>,
    config: ExecutionConfig,
    /// First legs of pairs waiting for their partner request.
    pending_pairs: Mutex<HashMap<RequestId, ExecutionRequest>>,
    /// Latest prices, for pricing offsetting IOCs at the current bid.
    prices: dashmap::DashMap<(Venue, MarketId), MarketPrice>,
}

impl ExecutionEngine {
    #[must_use]
    pub fn new(
        config: ExecutionConfig,
        fees: FeeModel,
        bus: Bus,
        repo: Arc<dyn Repository>,
    ) -> Self {
        Self {
            lanes: HashMap::new(),
            idempotency: IdempotencyStore::new(StdDuration::from_secs(
                config.idempotency_ttl_secs,
            )),
            fees,
            bus,
            repo,
            config,
            pending_pairs: Mutex::new(HashMap::new()),
            prices: dashmap::DashMap::new(),
        }
    }

    /// Register a venue client with its rate limit and breaker.
    pub fn register_client(&mut self, client: Arc<dyn VenueClient>) {
        let venue = client.venue();
        self.register_client_as(venue, client);
    }

    /// Register a client under an explicit venue lane. Paper trading
    /// registers a simulator under each real venue's lane so requests
    /// route unchanged.
    pub fn register_client_as(&mut self, venue: Venue, client: Arc<dyn VenueClient>) {
        let (rate, burst) = match venue {
            Venue::Direct => (self.config.direct_rate_per_sec, self.config.direct_burst),
            Venue::Proxied | Venue::Paper => {
                (self.config.proxied_rate_per_sec, self.config.proxied_burst)
            }
        };
        let lane = VenueLane {
            client,
            limiter: TokenBucket::new(rate, burst),
            breaker: CircuitBreaker::new(
                match venue {
                    Venue::Direct => "direct",
                    Venue::Proxied => "proxied",
                    Venue::Paper => "paper",
                },
                self.config.breaker_threshold,
                StdDuration::from_secs(self.config.breaker_cooldown_secs),
            ),
        };
        self.lanes.insert(venue, lane);
    }

    /// Main loop: consume execution requests, pairing arbitrage legs.
    pub async fn run(self: Arc<Self>) {
        let mut intake = self.bus.take_request_intake();
        let mut prices = self.bus.subscribe_prices();
        info!("execution engine started");

        loop {
            let request = tokio::select! {
                request = intake.recv() => {
                    let Some(request) = request else { break };
                    request
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
                    continue;
                }
            };

            if let Some(partner_id) = request.paired_leg_request_id.clone() {
                let partner = {
                    let mut pending = self.pending_pairs.lock();
                    pending
                        .retain(|_, held| !held.is_expired_at(Utc::now()));
                    pending.remove(&partner_id)
                };
                match partner {
                    Some(partner) => {
                        let engine = Arc::clone(&self);
                        tokio::spawn(async move {
                            engine.execute_pair(partner, request).await;
                        });
                    }
                    None => {
                        self.pending_pairs
                            .lock()
                            .insert(request.request_id.clone(), request);
                    }
                }
            } else {
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    engine.execute_and_publish(request).await;
                });
            }
        }

        info!("execution engine stopped");
    }

    /// Execute one request and publish its result.
    pub async fn execute_and_publish(&self, request: ExecutionRequest) -> ExecutionResult {
        let result = self.execute(&request).await;
        if let Err(e) = self.repo.record_trade(&result).await {
            warn!(error = %e, "failed to record trade");
        }
        self.bus.publish_result(result.clone());
        result
    }

    /// Both legs of an arbitrage pair, concurrently; afterwards the pair is
    /// reconciled so no one-sided exposure survives.
    pub async fn execute_pair(&self, first: ExecutionRequest, second: ExecutionRequest) {
        debug!(
            first = %first.request_id,
            second = %second.request_id,
            "executing paired legs"
        );
        let (result_a, result_b) = tokio::join!(
            self.execute_and_publish(first),
            self.execute_and_publish(second)
        );

        let imbalance = result_a.filled_qty - result_b.filled_qty;
        if imbalance == 0 {
            // Both filled equally (possibly zero): fully paired or flat.
            return;
        }

        let (over, under) = if imbalance > 0 {
            (&result_a, &result_b)
        } else {
            (&result_b, &result_a)
        };
        warn!(
            over = %over.request_id,
            under = %under.request_id,
            excess = imbalance.abs(),
            "asymmetric paired fill, issuing offsetting IOC"
        );
        self.offset_unpaired(over, imbalance.abs()).await;
    }

    /// Neutralise an unpaired fill with an immediate sell on the same
    /// venue; escalate if the offset itself does not fully fill.
    async fn offset_unpaired(&self, filled: &ExecutionResult, excess: i64) {
        let now = Utc::now();
        // The current bid on the held side, falling back to the fill price
        // when no quote has been observed yet.
        let marketable = self
            .prices
            .get(&(filled.venue, filled.market_id.clone()))
            .map(|price| match filled.side {
                Side::Yes => price.yes_bid_cents(),
                Side::No => Cents::PAYOUT - price.yes_ask_cents(),
            })
            .unwrap_or(filled.avg_price);
        let limit = (marketable - Cents::new(self.config.offset_slippage_cents))
            .max(Cents::new(1));

        let offset_request = ExecutionRequest {
            request_id: RequestId::from(format!("req-{}", Uuid::new_v4())),
            signal_id: filled.signal_id.clone(),
            idempotency_key: crate::domain::IdempotencyKey::derive(
                &crate::domain::SignalId::from(format!("offset-{}", filled.request_id)),
                filled.side,
                filled.venue,
            ),
            venue: filled.venue,
            market_id: filled.market_id.clone(),
            event_id: filled.event_id.clone(),
            side: filled.side,
            action: OrderAction::Sell,
            quantity: excess,
            limit_price: limit,
            paired_leg_request_id: None,
            expires_utc: now + Duration::seconds(1),
            created_utc: now,
        };

        let offset_result = self.execute_and_publish(offset_request).await;

        if offset_result.filled_qty < excess {
            let unresolved = excess - offset_result.filled_qty;
            error!(
                event_id = %filled.event_id,
                venue = %filled.venue,
                unresolved,
                "offset IOC did not fully fill, human attention required"
            );
            self.bus.publish_heartbeat(Heartbeat::unhealthy(
                "execution_engine",
                format!("unpaired exposure of {unresolved} units on {}", filled.market_id),
            ));
            self.bus.publish_control(ControlEvent::SuspendEvent {
                event_id: filled.event_id.clone(),
                reason: "unpaired arbitrage exposure".into(),
            });
        }
    }

    /// Core placement path. Never returns an error; failures become
    /// structured results.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let now = Utc::now();

        // The kill switch halts new entries; risk-reducing sells continue.
        if self.bus.kill_switch_engaged() && request.action == OrderAction::Buy {
            return self.synthesize(request, OrderStatus::Rejected, "kill_switch", now);
        }

        // Identical idempotency keys must never place twice.
        if let Some(stored) = self.idempotency.get(&request.idempotency_key) {
            debug!(request_id = %request.request_id, "idempotency hit, returning stored result");
            return stored;
        }

        if request.is_expired_at(now) {
            return self.synthesize(request, OrderStatus::Cancelled, "expired", now);
        }

        let Some(lane) = self.lanes.get(&request.venue) else {
            return self.synthesize(request, OrderStatus::Rejected, "unknown_venue", now);
        };

        if !lane.breaker.allows() {
            return self.synthesize(request, OrderStatus::Rejected, "circuit_open", now);
        }

        // Rate limiter: wait for a token, bounded by the request deadline.
        let deadline = (request.expires_utc - now)
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        if !lane.limiter.acquire_within(deadline).await {
            return self.synthesize(request, OrderStatus::Cancelled, "expired", now);
        }

        let order = VenueOrder {
            client_order_id: request
                .idempotency_key
                .client_order_id(lane.client.max_client_order_id_len()),
            market_id: request.market_id.clone(),
            side: request.side,
            action: request.action,
            quantity: request.quantity,
            limit_price: request.limit_price,
        };

        let result = match self.place_with_backoff(lane, &order, request).await {
            Ok(fill) => self.from_fill(request, fill).await,
            Err(e) => {
                if e.is_rate_limit() {
                    lane.breaker.abandon_probe();
                } else {
                    lane.breaker.record_failure();
                }
                let status = match &e {
                    ExecutionError::Timeout { .. }
                    | ExecutionError::RateLimited { .. }
                    | ExecutionError::Expired => OrderStatus::Cancelled,
                    _ => OrderStatus::Rejected,
                };
                self.synthesize(request, status, &e.to_string(), Utc::now())
            }
        };

        self.idempotency
            .put(request.idempotency_key.clone(), result.clone());
        result
    }

    /// Placement with the 429 backoff schedule (4 s, 8 s, 16 s + jitter).
    async fn place_with_backoff(
        &self,
        lane: &VenueLane,
        order: &VenueOrder,
        request: &ExecutionRequest,
    ) -> Result<VenueFill, ExecutionError> {
        let mut backoff_ms = self.config.backoff_initial_ms;
        let mut attempt = 0;

        loop {
            match lane.client.place_ioc(order).await {
                Ok(fill) => {
                    lane.breaker.record_success();
                    return Ok(fill);
                }
                Err(e) if e.is_rate_limit() => {
                    attempt += 1;
                    if attempt > self.config.rate_limit_retries {
                        return Err(e);
                    }
                    let jitter = rand::thread_rng().gen_range(0..250);
                    let sleep_ms = backoff_ms + jitter;
                    debug!(
                        attempt,
                        sleep_ms,
                        venue = %request.venue,
                        "rate limited, backing off"
                    );
                    // Deadline check before sleeping the whole window.
                    let resume = Utc::now() + Duration::milliseconds(sleep_ms as i64);
                    if resume >= request.expires_utc {
                        return Err(ExecutionError::Expired);
                    }
                    tokio::time::sleep(StdDuration::from_millis(sleep_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(self.config.backoff_cap_ms);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Map a venue fill onto a result, handling the IOC protocol contract.
    async fn from_fill(&self, request: &ExecutionRequest, fill: VenueFill) -> ExecutionResult {
        let mut fill = fill;

        if fill.state == VenueOrderState::Resting {
            // An IOC order must never rest: protocol violation. Alert,
            // attempt cancel, and suspend the event until reconciled.
            error!(
                request_id = %request.request_id,
                venue = %request.venue,
                "venue returned resting order for IOC request"
            );
            if let (Some(lane), Some(order_id)) =
                (self.lanes.get(&request.venue), fill.venue_order_id.as_deref())
            {
                if let Err(e) = lane.client.cancel(order_id).await {
                    error!(error = %e, "cancel of resting order failed");
                }
            }
            self.bus.publish_control(ControlEvent::SuspendEvent {
                event_id: request.event_id.clone(),
                reason: "protocol violation: resting order on IOC".into(),
            });
            fill.state = if fill.filled_qty > 0 {
                VenueOrderState::Filled
            } else {
                VenueOrderState::Cancelled
            };
            fill.fees = fill.fees.or(Some(Cents::ZERO));
        }

        let status = match fill.state {
            VenueOrderState::Filled if fill.filled_qty > 0 => OrderStatus::Filled,
            VenueOrderState::Filled | VenueOrderState::Cancelled => OrderStatus::Cancelled,
            VenueOrderState::Rejected => OrderStatus::Rejected,
            VenueOrderState::Resting => unreachable!("resting handled above"),
        };

        let fees = match fill.fees {
            Some(fees) => fees,
            // Venue did not report fees: attribute from the schedule.
            None => self
                .fees
                .order_fee(request.venue, fill.avg_price, fill.filled_qty),
        };

        ExecutionResult {
            request_id: request.request_id.clone(),
            signal_id: request.signal_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            client_order_id: request
                .idempotency_key
                .client_order_id(self.lanes.get(&request.venue).map_or(32, |lane| {
                    lane.client.max_client_order_id_len()
                })),
            venue_order_id: fill.venue_order_id,
            venue: request.venue,
            market_id: request.market_id.clone(),
            event_id: request.event_id.clone(),
            side: request.side,
            action: request.action,
            status,
            requested_qty: request.quantity,
            filled_qty: fill.filled_qty,
            avg_price: fill.avg_price,
            fees,
            reason: None,
            executed_utc: Utc::now(),
        }
    }

    fn synthesize(
        &self,
        request: &ExecutionRequest,
        status: OrderStatus,
        reason: &str,
        at: DateTime<Utc>,
    ) -> ExecutionResult {
        ExecutionResult {
            request_id: request.request_id.clone(),
            signal_id: request.signal_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            client_order_id: request.idempotency_key.client_order_id(32),
            venue_order_id: None,
            venue: request.venue,
            market_id: request.market_id.clone(),
            event_id: request.event_id.clone(),
            side: request.side,
            action: request.action,
            status,
            requested_qty: request.quantity,
            filled_qty: 0,
            avg_price: Cents::ZERO,
            fees: Cents::ZERO,
            reason: Some(reason.to_string()),
            executed_utc: at,
        }
    }
}
