//! Typed in-process pub/sub bus.
//!
//! Fan-out topics (prices, game state, plays, results, heartbeats, control)
//! use `tokio::sync::broadcast`: producers never block, and a lagging
//! receiver loses the oldest entries for that topic. Hot point-to-point
//! paths (signals, execution requests) use bounded mpsc channels whose
//! sends are awaited: a full channel applies backpressure to the producer,
//! and nothing is ever dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::domain::{
    Bankroll, Event, EventId, EventState, ExecutionRequest, ExecutionResult, MarketId, MarketPrice,
    Play, Position, RejectedSignal, ShardId, Signal, Venue,
};

/// Default capacity for broadcast topics.
const TOPIC_CAPACITY: usize = 1024;

/// Capacity of the bounded signal and execution-request channels.
const HOT_PATH_CAPACITY: usize = 256;

/// Component health, carried on `heartbeat.{component}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
    /// Final heartbeat of a component that is going away.
    Terminal,
}

/// Periodic liveness report from a long-lived component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub component: String,
    pub health: Health,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Heartbeat {
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            health: Health::Healthy,
            at: Utc::now(),
            detail: None,
        }
    }

    #[must_use]
    pub fn unhealthy(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            health: Health::Unhealthy,
            at: Utc::now(),
            detail: Some(detail.into()),
        }
    }

    #[must_use]
    pub fn terminal(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            health: Health::Terminal,
            at: Utc::now(),
            detail: None,
        }
    }
}

/// Control-plane events observed by the trading components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Drawdown guard fired: reject all new entries until resumed.
    PauseTrading { reason: String },
    ResumeTrading,
    /// Stop arbitrage on one event (unpaired exposure) until reconciled.
    SuspendEvent { event_id: EventId, reason: String },
    ResumeEvent { event_id: EventId },
}

/// Position lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PositionEvent {
    Opened(Position),
    Closed(Position),
}

/// Binding of an event to a venue market, produced by the orchestrator and
/// consumed by the venue feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketBinding {
    pub event_id: EventId,
    pub venue: Venue,
    pub market_id: MarketId,
    pub contract_entity: String,
}

/// Shard assignment record, published for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    pub event_id: EventId,
    pub shard_id: ShardId,
}

/// Last-seen heartbeat per component.
///
/// Terminal heartbeats remove the component; a component silent past the
/// liveness window counts as unhealthy.
#[derive(Default)]
pub struct HealthRegistry {
    last_seen: parking_lot::RwLock<std::collections::HashMap<String, Heartbeat>>,
}

impl HealthRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, heartbeat: Heartbeat) {
        let mut last_seen = self.last_seen.write();
        if heartbeat.health == Health::Terminal {
            last_seen.remove(&heartbeat.component);
        } else {
            last_seen.insert(heartbeat.component.clone(), heartbeat);
        }
    }

    #[must_use]
    pub fn component(&self, name: &str) -> Option<Heartbeat> {
        self.last_seen.read().get(name).cloned()
    }

    /// Components that last reported unhealthy or have gone silent.
    #[must_use]
    pub fn unhealthy(&self, now: DateTime<Utc>, liveness: chrono::Duration) -> Vec<String> {
        self.last_seen
            .read()
            .values()
            .filter(|hb| hb.health == Health::Unhealthy || now - hb.at > liveness)
            .map(|hb| hb.component.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.last_seen.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_seen.read().is_empty()
    }
}

/// The engine-wide bus. Cheap to clone; all clones share channels.
#[derive(Clone)]
pub struct Bus {
    prices: broadcast::Sender<MarketPrice>,
    states: broadcast::Sender<EventState>,
    plays: broadcast::Sender<Play>,
    events: broadcast::Sender<Event>,
    rejected: broadcast::Sender<RejectedSignal>,
    results: broadcast::Sender<ExecutionResult>,
    positions: broadcast::Sender<PositionEvent>,
    bankroll: broadcast::Sender<Bankroll>,
    control: broadcast::Sender<ControlEvent>,
    heartbeats: broadcast::Sender<Heartbeat>,
    bindings: broadcast::Sender<MarketBinding>,
    assignments: broadcast::Sender<AssignmentEvent>,
    signals_tx: mpsc::Sender<Signal>,
    signals_rx: Arc<Mutex<Option<mpsc::Receiver<Signal>>>>,
    requests_tx: mpsc::Sender<ExecutionRequest>,
    requests_rx: Arc<Mutex<Option<mpsc::Receiver<ExecutionRequest>>>>,
    kill_switch: Arc<AtomicBool>,
}

impl Bus {
    #[must_use]
    pub fn new() -> Self {
        let (signals_tx, signals_rx) = mpsc::channel(HOT_PATH_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(HOT_PATH_CAPACITY);
        Self {
            prices: broadcast::channel(TOPIC_CAPACITY).0,
            states: broadcast::channel(TOPIC_CAPACITY).0,
            plays: broadcast::channel(TOPIC_CAPACITY).0,
            events: broadcast::channel(256).0,
            rejected: broadcast::channel(TOPIC_CAPACITY).0,
            results: broadcast::channel(TOPIC_CAPACITY).0,
            positions: broadcast::channel(TOPIC_CAPACITY).0,
            bankroll: broadcast::channel(TOPIC_CAPACITY).0,
            control: broadcast::channel(64).0,
            heartbeats: broadcast::channel(256).0,
            bindings: broadcast::channel(256).0,
            assignments: broadcast::channel(256).0,
            signals_tx,
            signals_rx: Arc::new(Mutex::new(Some(signals_rx))),
            requests_tx,
            requests_rx: Arc::new(Mutex::new(Some(requests_rx))),
            kill_switch: Arc::new(AtomicBool::new(false)),
        }
    }

    // Publish side. Send errors mean no subscribers, which is fine.

    pub fn publish_price(&self, price: MarketPrice) {
        let _ = self.prices.send(price);
    }

    pub fn publish_state(&self, state: EventState) {
        let _ = self.states.send(state);
    }

    pub fn publish_play(&self, play: Play) {
        let _ = self.plays.send(play);
    }

    /// Announce a discovered event (identity + market type).
    pub fn publish_event(&self, event: Event) {
        let _ = self.events.send(event);
    }

    pub fn publish_rejected(&self, rejected: RejectedSignal) {
        let _ = self.rejected.send(rejected);
    }

    pub fn publish_result(&self, result: ExecutionResult) {
        let _ = self.results.send(result);
    }

    pub fn publish_position_event(&self, event: PositionEvent) {
        let _ = self.positions.send(event);
    }

    pub fn publish_bankroll(&self, bankroll: Bankroll) {
        let _ = self.bankroll.send(bankroll);
    }

    pub fn publish_control(&self, event: ControlEvent) {
        let _ = self.control.send(event);
    }

    pub fn publish_heartbeat(&self, heartbeat: Heartbeat) {
        let _ = self.heartbeats.send(heartbeat);
    }

    pub fn publish_binding(&self, binding: MarketBinding) {
        let _ = self.bindings.send(binding);
    }

    pub fn publish_assignment(&self, assignment: AssignmentEvent) {
        let _ = self.assignments.send(assignment);
    }

    /// Emit a signal toward the signal processor. Awaits when the channel
    /// is full; never dropped.
    pub async fn send_signal(&self, signal: Signal) {
        let _ = self.signals_tx.send(signal).await;
    }

    /// Emit an execution request toward the execution engine. Awaits when
    /// the channel is full; never dropped.
    pub async fn send_request(&self, request: ExecutionRequest) {
        let _ = self.requests_tx.send(request).await;
    }

    // Subscribe side.

    #[must_use]
    pub fn subscribe_prices(&self) -> broadcast::Receiver<MarketPrice> {
        self.prices.subscribe()
    }

    #[must_use]
    pub fn subscribe_states(&self) -> broadcast::Receiver<EventState> {
        self.states.subscribe()
    }

    #[must_use]
    pub fn subscribe_plays(&self) -> broadcast::Receiver<Play> {
        self.plays.subscribe()
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn subscribe_rejected(&self) -> broadcast::Receiver<RejectedSignal> {
        self.rejected.subscribe()
    }

    #[must_use]
    pub fn subscribe_results(&self) -> broadcast::Receiver<ExecutionResult> {
        self.results.subscribe()
    }

    #[must_use]
    pub fn subscribe_position_events(&self) -> broadcast::Receiver<PositionEvent> {
        self.positions.subscribe()
    }

    #[must_use]
    pub fn subscribe_bankroll(&self) -> broadcast::Receiver<Bankroll> {
        self.bankroll.subscribe()
    }

    #[must_use]
    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlEvent> {
        self.control.subscribe()
    }

    #[must_use]
    pub fn subscribe_heartbeats(&self) -> broadcast::Receiver<Heartbeat> {
        self.heartbeats.subscribe()
    }

    #[must_use]
    pub fn subscribe_bindings(&self) -> broadcast::Receiver<MarketBinding> {
        self.bindings.subscribe()
    }

    #[must_use]
    pub fn subscribe_assignments(&self) -> broadcast::Receiver<AssignmentEvent> {
        self.assignments.subscribe()
    }

    /// Take the single signal-processor intake. Panics if taken twice.
    #[must_use]
    pub fn take_signal_intake(&self) -> mpsc::Receiver<Signal> {
        self.signals_rx
            .lock()
            .take()
            .expect("signal intake already taken")
    }

    /// Take the single execution-engine intake. Panics if taken twice.
    #[must_use]
    pub fn take_request_intake(&self) -> mpsc::Receiver<ExecutionRequest> {
        self.requests_rx
            .lock()
            .take()
            .expect("request intake already taken")
    }

    // Kill switch: a single atomic flag observed by the signal processor
    // and execution engine at every dispatch.

    pub fn engage_kill_switch(&self) {
        self.kill_switch.store(true, Ordering::SeqCst);
    }

    pub fn release_kill_switch(&self) {
        self.kill_switch.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
