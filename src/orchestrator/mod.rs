//! Orchestrator: the control plane.
//!
//! Owns event-to-shard assignments and event-to-market bindings. On
//! discovery it requests market identifiers (with a timeout; a miss still
//! assigns the event so live state is tracked), publishes bindings to the
//! venue feeds, and places the event on a shard by load-weighted selection.
//! Finalised events are removed and archived after a grace window.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::bus::{AssignmentEvent, Bus, MarketBinding};
use crate::domain::{Event, EventId, ShardId};
use crate::error::Result;
use crate::shard::Shard;
use crate::store::Repository;

/// Orchestrator tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub discovery_timeout_secs: u64,
    /// Grace window between finalisation and archive.
    pub finalize_grace_secs: i64,
    pub housekeeping_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: 30,
            finalize_grace_secs: 3_600,
            housekeeping_interval_secs: 60,
        }
    }
}

/// Looks up venue market identifiers for a discovered event.
#[async_trait]
pub trait MarketDiscovery: Send + Sync {
    async fn find_markets(&self, event: &Event) -> Result<Vec<MarketBinding>>;
}

/// Discovery backed by a static table; used in paper mode and tests.
#[derive(Default)]
pub struct StaticDiscovery {
    bindings: Mutex<HashMap<EventId, Vec<MarketBinding>>>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, event_id: EventId, bindings: Vec<MarketBinding>) {
        self.bindings.lock().insert(event_id, bindings);
    }
}

#[async_trait]
impl MarketDiscovery for StaticDiscovery {
    async fn find_markets(&self, event: &Event) -> Result<Vec<MarketBinding>> {
        Ok(self
            .bindings
            .lock()
            .get(&event.event_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// The orchestrator service.
pub struct Orchestrator {
    config: OrchestratorConfig,
    shards: Vec<Arc<Shard>>,
    discovery: Arc<dyn MarketDiscovery>,
    bus: Bus,
    repo: Arc<dyn Repository>,
    assignments: Mutex<HashMap<EventId, ShardId>>,
    market_bindings: Mutex<HashMap<EventId, Vec<MarketBinding>>>,
    finalized: Mutex<HashMap<EventId, DateTime<Utc>>>,
    /// Round-robin cursor for tie-breaking equally loaded shards.
    cursor: Mutex<usize>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        shards: Vec<Arc<Shard>>,
        discovery: Arc<dyn MarketDiscovery>,
        bus: Bus,
        repo: Arc<dyn Repository>,
    ) -> Self {
        Self {
            config,
            shards,
            discovery,
            bus,
            repo,
            assignments: Mutex::new(HashMap::new()),
            market_bindings: Mutex::new(HashMap::new()),
            finalized: Mutex::new(HashMap::new()),
            cursor: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn assignment(&self, event_id: &EventId) -> Option<ShardId> {
        self.assignments.lock().get(event_id).copied()
    }

    #[must_use]
    pub fn bindings(&self, event_id: &EventId) -> Vec<MarketBinding> {
        self.market_bindings
            .lock()
            .get(event_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Handle a newly discovered event end-to-end.
    pub async fn on_event_discovered(&self, event: Event) -> Result<()> {
        if self.assignments.lock().contains_key(&event.event_id) {
            return Ok(());
        }

        self.repo.upsert_event(&event).await?;
        // Announce identity + market type to the trading components.
        self.bus.publish_event(event.clone());

        // Market identifiers, bounded by the discovery timeout. A miss
        // still assigns the event so live state is tracked.
        let timeout = std::time::Duration::from_secs(self.config.discovery_timeout_secs);
        match tokio::time::timeout(timeout, self.discovery.find_markets(&event)).await {
            Ok(Ok(bindings)) if !bindings.is_empty() => {
                for binding in &bindings {
                    self.bus.publish_binding(binding.clone());
                }
                self.market_bindings
                    .lock()
                    .insert(event.event_id.clone(), bindings);
            }
            Ok(Ok(_)) => {
                warn!(event_id = %event.event_id, "no markets found, tracking state only");
            }
            Ok(Err(e)) => {
                warn!(event_id = %event.event_id, error = %e, "market discovery failed");
            }
            Err(_) => {
                warn!(event_id = %event.event_id, "market discovery timed out");
            }
        }

        self.assign_to_shard(event)
    }

    /// Load-weighted selection among healthy shards with spare capacity,
    /// round-robin on ties.
    fn assign_to_shard(&self, event: Event) -> Result<()> {
        let start = {
            let mut cursor = self.cursor.lock();
            *cursor = cursor.wrapping_add(1);
            *cursor
        };

        let candidate = (0..self.shards.len())
            .map(|offset| &self.shards[(start + offset) % self.shards.len()])
            .filter(|shard| shard.spare_capacity() > 0)
            .max_by_key(|shard| shard.spare_capacity());

        let Some(shard) = candidate else {
            warn!(event_id = %event.event_id, "all shards at capacity, event not assigned");
            return Ok(());
        };

        let event_id = event.event_id.clone();
        shard.add_event(event)?;
        self.assignments
            .lock()
            .insert(event_id.clone(), shard.shard_id());
        self.bus.publish_assignment(AssignmentEvent {
            event_id: event_id.clone(),
            shard_id: shard.shard_id(),
        });
        info!(event_id = %event_id, shard_id = %shard.shard_id(), "event assigned to shard");
        Ok(())
    }

    /// Control loop: watch for finalisation and archive after the grace
    /// window.
    pub async fn run(self: Arc<Self>) {
        let mut states = self.bus.subscribe_states();
        let mut housekeeping = tokio::time::interval(std::time::Duration::from_secs(
            self.config.housekeeping_interval_secs,
        ));

        info!(shards = self.shards.len(), "orchestrator started");

        loop {
            tokio::select! {
                Ok(state) = states.recv() => {
                    if state.is_final() {
                        self.finalized
                            .lock()
                            .entry(state.event_id.clone())
                            .or_insert_with(Utc::now);
                    }
                }
                _ = housekeeping.tick() => {
                    self.archive_expired(Utc::now()).await;
                }
            }
        }
    }

    /// Remove and archive events whose grace window has elapsed.
    pub async fn archive_expired(&self, now: DateTime<Utc>) {
        let grace = Duration::seconds(self.config.finalize_grace_secs);
        let expired: Vec<EventId> = self
            .finalized
            .lock()
            .iter()
            .filter(|(_, finalized_at)| now - **finalized_at >= grace)
            .map(|(event_id, _)| event_id.clone())
            .collect();

        for event_id in expired {
            info!(event_id = %event_id, "archiving finalised event");
            let shard_id = self.assignments.lock().remove(&event_id);
            if let Some(shard_id) = shard_id {
                if let Some(shard) = self
                    .shards
                    .iter()
                    .find(|shard| shard.shard_id() == shard_id)
                {
                    shard.remove_event(&event_id).await;
                }
            }
            self.market_bindings.lock().remove(&event_id);
            self.finalized.lock().remove(&event_id);
            if let Err(e) = self.repo.archive_event(&event_id).await {
                warn!(error = %e, event_id = %event_id, "archive failed");
            }
        }
    }
}
