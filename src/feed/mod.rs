//! Venue price feeds.
//!
//! One feed per venue maintains a persistent WebSocket, reconciles
//! orderbook deltas into [`LocalOrderBook`]s, and emits normalized
//! [`MarketPrice`] snapshots to the bus on every book change. Subscriptions
//! follow the orchestrator's market bindings; a REST fallback poller co-runs
//! to plug gaps.

mod direct;
mod proxied;
mod reconnect;
mod rest_poll;

pub use direct::DirectFeedStream;
pub use proxied::{verify_egress, ProxiedFeedStream};
pub use reconnect::{ReconnectConfig, ReconnectingStream};
pub use rest_poll::RestPoller;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Heartbeat};
use crate::domain::{BookSide, EventId, LocalOrderBook, MarketId, MarketPrice, Venue};
use crate::error::{FeedError, Result};
use crate::store::Repository;

/// Normalized message from a venue stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Full book replace with explicit bid and ask ladders.
    Snapshot {
        market_id: MarketId,
        bids: Vec<(i64, i64)>,
        asks: Vec<(i64, i64)>,
        sequence: u64,
    },
    /// Full book replace from a venue that publishes only bids on both
    /// outcomes; YES asks are derived from NO bids.
    BidOnlySnapshot {
        market_id: MarketId,
        yes_bids: Vec<(i64, i64)>,
        no_bids: Vec<(i64, i64)>,
        sequence: u64,
    },
    /// Incremental size change on the YES ladder.
    Delta {
        market_id: MarketId,
        side: BookSide,
        price_cents: i64,
        delta: i64,
        sequence: u64,
    },
    /// Incremental size change expressed on the NO ladder.
    NoSideDelta {
        market_id: MarketId,
        price_cents: i64,
        delta: i64,
        sequence: u64,
    },
    /// Absolute level overwrite, for venues that publish level states.
    SetLevel {
        market_id: MarketId,
        side: BookSide,
        price_cents: i64,
        size: i64,
        sequence: u64,
    },
    /// Trade print; informational, does not mutate the book.
    Trade {
        market_id: MarketId,
        price_cents: i64,
        count: i64,
    },
    /// Connection lost; the reconnect wrapper consumes these.
    Disconnected { reason: String },
}

/// A venue's streaming transport.
#[async_trait]
pub trait FeedStream: Send {
    async fn connect(&mut self) -> Result<()>;

    /// Subscribe to additional markets.
    async fn subscribe(&mut self, market_ids: &[MarketId]) -> Result<()>;

    /// Unsubscribe from markets no longer bound.
    async fn unsubscribe(&mut self, market_ids: &[MarketId]) -> Result<()>;

    /// Ask the venue for a fresh snapshot after a sequence gap.
    async fn request_snapshot(&mut self, market_id: &MarketId) -> Result<()>;

    /// Keep-alive ping on idle.
    async fn ping(&mut self) -> Result<()>;

    /// Next message; `None` when the stream is closed.
    async fn next_message(&mut self) -> Option<FeedMessage>;

    fn venue(&self) -> Venue;
}

/// Health counters for one feed, snapshotted into heartbeats.
#[derive(Debug, Default)]
pub struct FeedStats {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub parse_failures: AtomicU64,
    pub unknown_market: AtomicU64,
    pub resnapshots: AtomicU64,
}

impl FeedStats {
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "received={} processed={} parse_failures={} unknown_market={} resnapshots={}",
            self.received.load(Ordering::Relaxed),
            self.processed.load(Ordering::Relaxed),
            self.parse_failures.load(Ordering::Relaxed),
            self.unknown_market.load(Ordering::Relaxed),
            self.resnapshots.load(Ordering::Relaxed),
        )
    }
}

/// Binding of a market to its event and contract entity.
#[derive(Debug, Clone)]
struct BoundMarket {
    event_id: EventId,
    contract_entity: String,
}

/// One venue's price feed service.
pub struct VenueFeed<S: FeedStream> {
    venue: Venue,
    stream: S,
    books: HashMap<MarketId, LocalOrderBook>,
    bindings: HashMap<MarketId, BoundMarket>,
    subscriptions: HashSet<MarketId>,
    bus: Bus,
    repo: Arc<dyn Repository>,
    stats: Arc<FeedStats>,
}

impl<S: FeedStream> VenueFeed<S> {
    #[must_use]
    pub fn new(stream: S, bus: Bus, repo: Arc<dyn Repository>) -> Self {
        let venue = stream.venue();
        Self {
            venue,
            stream,
            books: HashMap::new(),
            bindings: HashMap::new(),
            subscriptions: HashSet::new(),
            bus,
            repo,
            stats: Arc::new(FeedStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<FeedStats> {
        Arc::clone(&self.stats)
    }

    /// Main loop: connect, follow bindings, reconcile books, emit prices.
    pub async fn run(mut self) -> Result<()> {
        self.stream.connect().await?;
        let component = format!("feed_{}", self.venue);
        let mut bindings_rx = self.bus.subscribe_bindings();
        let mut heartbeat =
            tokio::time::interval(std::time::Duration::from_secs(10));

        info!(venue = %self.venue, "venue feed started");

        loop {
            tokio::select! {
                message = self.stream.next_message() => {
                    let Some(message) = message else {
                        warn!(venue = %self.venue, "feed stream ended");
                        self.bus.publish_heartbeat(Heartbeat::unhealthy(
                            component.clone(),
                            "stream ended",
                        ));
                        return Ok(());
                    };
                    self.stats.received.fetch_add(1, Ordering::Relaxed);
                    self.handle_message(message).await;
                }
                Ok(binding) = bindings_rx.recv() => {
                    if binding.venue == self.venue {
                        self.apply_binding(binding.market_id, BoundMarket {
                            event_id: binding.event_id,
                            contract_entity: binding.contract_entity,
                        }).await;
                    }
                }
                _ = heartbeat.tick() => {
                    self.bus.publish_heartbeat(Heartbeat {
                        component: component.clone(),
                        health: crate::bus::Health::Healthy,
                        at: Utc::now(),
                        detail: Some(self.stats.summary()),
                    });
                }
            }
        }
    }

    /// Diff the new binding against current subscriptions and subscribe.
    async fn apply_binding(&mut self, market_id: MarketId, bound: BoundMarket) {
        self.bindings.insert(market_id.clone(), bound);
        if self.subscriptions.insert(market_id.clone()) {
            debug!(venue = %self.venue, market_id = %market_id, "subscribing to market");
            if let Err(e) = self.stream.subscribe(&[market_id]).await {
                warn!(error = %e, "subscribe failed");
            }
        }
    }

    /// Drop a market: unsubscribe and release its book.
    pub async fn remove_market(&mut self, market_id: &MarketId) {
        self.bindings.remove(market_id);
        if self.subscriptions.remove(market_id) {
            let _ = self.stream.unsubscribe(std::slice::from_ref(market_id)).await;
        }
        self.books.remove(market_id);
    }

    async fn handle_message(&mut self, message: FeedMessage) {
        let now = Utc::now();
        let market_id = match &message {
            FeedMessage::Snapshot { market_id, .. }
            | FeedMessage::BidOnlySnapshot { market_id, .. }
            | FeedMessage::Delta { market_id, .. }
            | FeedMessage::NoSideDelta { market_id, .. }
            | FeedMessage::SetLevel { market_id, .. }
            | FeedMessage::Trade { market_id, .. } => market_id.clone(),
            FeedMessage::Disconnected { reason } => {
                warn!(venue = %self.venue, reason = %reason, "feed disconnected");
                return;
            }
        };

        // Subscription for an unknown market: log, skip, continue.
        if !self.bindings.contains_key(&market_id) {
            self.stats.unknown_market.fetch_add(1, Ordering::Relaxed);
            debug!(market_id = %market_id, "message for unbound market skipped");
            return;
        }

        let book = self
            .books
            .entry(market_id.clone())
            .or_insert_with(|| LocalOrderBook::new(self.venue, market_id.clone()));

        let changed = match message {
            FeedMessage::Snapshot {
                bids,
                asks,
                sequence,
                ..
            } => {
                book.apply_snapshot(bids, asks, sequence, now);
                true
            }
            FeedMessage::BidOnlySnapshot {
                yes_bids,
                no_bids,
                sequence,
                ..
            } => {
                book.apply_two_sided_bid_snapshot(yes_bids, no_bids, sequence, now);
                true
            }
            FeedMessage::Delta {
                side,
                price_cents,
                delta,
                sequence,
                ..
            } => match book.apply_delta(side, price_cents, delta, sequence, now) {
                Ok(()) => true,
                Err(FeedError::SequenceGap { expected, got, .. }) => {
                    self.resnapshot(&market_id, expected, got).await;
                    false
                }
                Err(_) => false,
            },
            FeedMessage::NoSideDelta {
                price_cents,
                delta,
                sequence,
                ..
            } => match book.apply_no_side_delta(price_cents, delta, sequence, now) {
                Ok(()) => true,
                Err(FeedError::SequenceGap { expected, got, .. }) => {
                    self.resnapshot(&market_id, expected, got).await;
                    false
                }
                Err(_) => false,
            },
            FeedMessage::SetLevel {
                side,
                price_cents,
                size,
                sequence,
                ..
            } => match book.set_level(side, price_cents, size, sequence, now) {
                Ok(()) => true,
                Err(FeedError::SequenceGap { expected, got, .. }) => {
                    self.resnapshot(&market_id, expected, got).await;
                    false
                }
                Err(_) => false,
            },
            // Trades do not mutate the book.
            FeedMessage::Trade { .. } => false,
            FeedMessage::Disconnected { .. } => unreachable!("handled above"),
        };

        if changed {
            self.stats.processed.fetch_add(1, Ordering::Relaxed);
            self.emit_price(&market_id).await;
        }
    }

    async fn resnapshot(&mut self, market_id: &MarketId, expected: u64, got: u64) {
        warn!(
            venue = %self.venue,
            market_id = %market_id,
            expected,
            got,
            "sequence gap, requesting resnapshot"
        );
        self.stats.resnapshots.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.stream.request_snapshot(market_id).await {
            warn!(error = %e, "resnapshot request failed");
        }
    }

    async fn emit_price(&mut self, market_id: &MarketId) {
        let Some(book) = self.books.get(market_id) else {
            return;
        };
        let Some(bound) = self.bindings.get(market_id) else {
            return;
        };
        let Some(price) = MarketPrice::from_book(
            book,
            bound.event_id.clone(),
            bound.contract_entity.clone(),
        ) else {
            // One-sided book: nothing usable downstream yet.
            return;
        };

        if let Err(e) = self.repo.record_market_price(&price).await {
            debug!(error = %e, "price not recorded");
        }
        self.bus.publish_price(price);
    }
}
