//! Event shards.
//!
//! A shard owns up to `capacity` events, each running as a cooperatively
//! scheduled fiber on the shared runtime. Within a shard no per-event
//! locking is needed; across shards state is partitioned by event. The
//! shard also runs the vectorised arbitrage sweep across its events on a
//! short interval, forcing a full evaluation for any survivor.

mod monitor;

pub use monitor::{ArbProbe, FiberCommand};

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Heartbeat};
use crate::detector::{scan_arbitrage_pairs, Detector};
use crate::domain::{Event, EventId, ShardId};
use crate::error::ShardError;
use crate::model::ModelRegistry;

/// Shard tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub capacity: usize,
    /// Probability move that triggers a detector evaluation.
    pub prob_delta_trigger: f64,
    pub staleness_ttl_secs: i64,
    pub arb_sweep_interval_ms: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            prob_delta_trigger: 0.02,
            staleness_ttl_secs: 30,
            arb_sweep_interval_ms: 250,
        }
    }
}

struct Entry {
    handle: monitor::MonitorHandle,
}

/// One shard: a unit of horizontal scaling.
pub struct Shard {
    shard_id: ShardId,
    config: ShardConfig,
    bus: Bus,
    models: Arc<ModelRegistry>,
    detector: Arc<Detector>,
    entries: Mutex<HashMap<EventId, Entry>>,
    probes: Arc<DashMap<EventId, ArbProbe>>,
    removed_tx: mpsc::Sender<EventId>,
    removed_rx: Mutex<Option<mpsc::Receiver<EventId>>>,
}

impl Shard {
    #[must_use]
    pub fn new(
        shard_id: ShardId,
        config: ShardConfig,
        bus: Bus,
        models: Arc<ModelRegistry>,
        detector: Arc<Detector>,
    ) -> Self {
        let (removed_tx, removed_rx) = mpsc::channel(64);
        Self {
            shard_id,
            config,
            bus,
            models,
            detector,
            entries: Mutex::new(HashMap::new()),
            probes: Arc::new(DashMap::new()),
            removed_tx,
            removed_rx: Mutex::new(Some(removed_rx)),
        }
    }

    #[must_use]
    pub const fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Number of events currently assigned.
    #[must_use]
    pub fn load(&self) -> usize {
        self.entries.lock().len()
    }

    /// Remaining capacity.
    #[must_use]
    pub fn spare_capacity(&self) -> usize {
        self.config.capacity.saturating_sub(self.load())
    }

    /// Assign an event to this shard, spawning its fiber.
    pub fn add_event(&self, event: Event) -> Result<(), ShardError> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.config.capacity {
            return Err(ShardError::AtCapacity {
                shard_id: self.shard_id.value(),
                capacity: self.config.capacity,
            });
        }
        if entries.contains_key(&event.event_id) {
            debug!(event_id = %event.event_id, "event already assigned");
            return Ok(());
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = tokio::spawn(monitor::monitor_event(
            event.clone(),
            self.config.clone(),
            self.bus.clone(),
            Arc::clone(&self.models),
            Arc::clone(&self.detector),
            Arc::clone(&self.probes),
            self.removed_tx.clone(),
            cmd_rx,
        ));

        info!(
            shard_id = %self.shard_id,
            event_id = %event.event_id,
            load = entries.len() + 1,
            "event assigned"
        );
        entries.insert(
            event.event_id.clone(),
            Entry {
                handle: monitor::MonitorHandle {
                    event,
                    task,
                    cmd_tx,
                },
            },
        );
        Ok(())
    }

    /// Remove an event: stop the fiber, release cached prices, and emit a
    /// terminal heartbeat.
    pub async fn remove_event(&self, event_id: &EventId) {
        let entry = self.entries.lock().remove(event_id);
        let Some(entry) = entry else { return };

        // Polite shutdown first; abort if the fiber is wedged.
        if entry
            .handle
            .cmd_tx
            .try_send(FiberCommand::Shutdown)
            .is_err()
        {
            entry.handle.task.abort();
        }
        self.probes.remove(event_id);
        self.bus
            .publish_heartbeat(Heartbeat::terminal(format!("event_{event_id}")));
        info!(shard_id = %self.shard_id, event_id = %event_id, "event removed");
    }

    /// Does this shard currently own the event?
    #[must_use]
    pub fn owns(&self, event_id: &EventId) -> bool {
        self.entries.lock().contains_key(event_id)
    }

    /// Events currently assigned, by value.
    #[must_use]
    pub fn assigned_events(&self) -> Vec<Event> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.handle.event.clone())
            .collect()
    }

    /// Shard housekeeping loop: reap self-removed fibers and run the
    /// vectorised arbitrage sweep.
    pub async fn run(self: Arc<Self>) {
        let mut removed_rx = self
            .removed_rx
            .lock()
            .take()
            .expect("shard run loop started twice");
        let mut sweep = tokio::time::interval(std::time::Duration::from_millis(
            self.config.arb_sweep_interval_ms,
        ));

        loop {
            tokio::select! {
                Some(event_id) = removed_rx.recv() => {
                    self.remove_event(&event_id).await;
                }
                _ = sweep.tick() => {
                    self.arbitrage_sweep().await;
                }
            }
        }
    }

    /// SIMD pre-scan over every tracked event's top-of-book cents; any
    /// survivor gets a full detector evaluation on its fiber.
    pub async fn arbitrage_sweep(&self) {
        let mut event_ids = Vec::new();
        let mut yes_asks = Vec::new();
        let mut no_asks = Vec::new();

        for entry in self.probes.iter() {
            let probe = *entry.value();
            // Orientation 1: YES on direct, NO on proxied.
            event_ids.push(entry.key().clone());
            yes_asks.push(probe.direct_yes_ask);
            no_asks.push(probe.proxied_no_ask);
            // Orientation 2: YES on proxied, NO on direct.
            event_ids.push(entry.key().clone());
            yes_asks.push(probe.proxied_yes_ask);
            no_asks.push(probe.direct_no_ask);
        }
        if event_ids.is_empty() {
            return;
        }

        let survivors = scan_arbitrage_pairs(&yes_asks, &no_asks);
        if survivors.is_empty() {
            return;
        }

        let entries = self.entries.lock();
        let mut notified: Vec<&EventId> = Vec::new();
        for index in survivors {
            let event_id = &event_ids[index];
            if notified.contains(&event_id) {
                continue;
            }
            notified.push(event_id);
            if let Some(entry) = entries.get(event_id) {
                debug!(event_id = %event_id, "arbitrage sweep survivor, forcing evaluation");
                if entry
                    .handle
                    .cmd_tx
                    .try_send(FiberCommand::Evaluate)
                    .is_err()
                {
                    warn!(event_id = %event_id, "fiber command queue full");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorConfig;
    use crate::domain::{MarketType, Sport};
    use crate::fees::FeeModel;
    use chrono::Utc;

    fn shard(capacity: usize) -> Shard {
        Shard::new(
            ShardId::new(1),
            ShardConfig {
                capacity,
                ..ShardConfig::default()
            },
            Bus::new(),
            Arc::new(ModelRegistry::with_defaults()),
            Arc::new(Detector::new(DetectorConfig::default(), FeeModel::default())),
        )
    }

    fn event(id: &str) -> Event {
        Event {
            event_id: EventId::from(id),
            market_type: MarketType::Sport {
                sport: Sport::Nba,
                league: "NBA".into(),
            },
            entity_a: "Home".into(),
            entity_b: Some("Away".into()),
            scheduled_start_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let s = shard(2);
        s.add_event(event("e1")).unwrap();
        s.add_event(event("e2")).unwrap();
        assert_eq!(s.spare_capacity(), 0);

        let err = s.add_event(event("e3")).unwrap_err();
        assert!(matches!(err, ShardError::AtCapacity { capacity: 2, .. }));
    }

    #[tokio::test]
    async fn duplicate_assignment_is_idempotent() {
        let s = shard(5);
        s.add_event(event("e1")).unwrap();
        s.add_event(event("e1")).unwrap();
        assert_eq!(s.load(), 1);
    }

    #[tokio::test]
    async fn remove_emits_terminal_heartbeat_and_releases() {
        let s = shard(5);
        let mut heartbeats = s.bus.subscribe_heartbeats();
        s.add_event(event("e1")).unwrap();
        s.probes.insert(EventId::from("e1"), ArbProbe::default());

        s.remove_event(&EventId::from("e1")).await;

        assert_eq!(s.load(), 0);
        assert!(s.probes.is_empty());
        let heartbeat = heartbeats.recv().await.unwrap();
        assert_eq!(heartbeat.health, crate::bus::Health::Terminal);
        assert!(heartbeat.component.contains("e1"));
    }

    #[tokio::test]
    async fn sweep_notifies_only_survivors() {
        let s = shard(5);
        s.add_event(event("e1")).unwrap();
        s.add_event(event("e2")).unwrap();

        // e1 has a cross-venue arb (45 + 53 < 100); e2 does not.
        s.probes.insert(
            EventId::from("e1"),
            ArbProbe {
                direct_yes_ask: 45,
                direct_no_ask: 56,
                proxied_yes_ask: 48,
                proxied_no_ask: 53,
            },
        );
        s.probes.insert(
            EventId::from("e2"),
            ArbProbe {
                direct_yes_ask: 51,
                direct_no_ask: 50,
                proxied_yes_ask: 52,
                proxied_no_ask: 50,
            },
        );

        // The sweep sends Evaluate to e1's fiber only; with no cached
        // probability the fiber ignores it, so this just must not panic
        // and must not touch e2.
        s.arbitrage_sweep().await;
    }
}
