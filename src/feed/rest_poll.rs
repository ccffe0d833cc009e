//! REST fallback poller.
//!
//! Co-runs beside the WebSocket feed to plug gaps: every `poll_interval`
//! it fetches the book for each bound market over REST and emits the same
//! normalized prices. Duplicates are deduplicated downstream by
//! `(market_id, sequence)`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::domain::{EventId, LocalOrderBook, MarketId, MarketPrice, Venue};
use crate::error::Result;
use crate::store::Repository;

#[derive(Debug, Deserialize)]
struct RestBook {
    #[serde(default)]
    bids: Vec<RestLevel>,
    #[serde(default)]
    asks: Vec<RestLevel>,
    #[serde(default)]
    sequence: u64,
}

#[derive(Debug, Deserialize)]
struct RestLevel {
    price_cents: i64,
    size: i64,
}

/// Periodic REST book poller for one venue.
pub struct RestPoller {
    venue: Venue,
    http: HttpClient,
    base_url: String,
    poll_interval: std::time::Duration,
    bus: Bus,
    repo: Arc<dyn Repository>,
}

impl RestPoller {
    #[must_use]
    pub fn new(
        venue: Venue,
        http: HttpClient,
        base_url: String,
        poll_interval_secs: u64,
        bus: Bus,
        repo: Arc<dyn Repository>,
    ) -> Self {
        Self {
            venue,
            http,
            base_url,
            poll_interval: std::time::Duration::from_secs(poll_interval_secs),
            bus,
            repo,
        }
    }

    /// Poll loop. Tracks bindings for this venue from the bus.
    pub async fn run(self) -> Result<()> {
        let mut bindings_rx = self.bus.subscribe_bindings();
        let mut bound: HashMap<MarketId, (EventId, String)> = HashMap::new();
        let mut ticker = tokio::time::interval(self.poll_interval);

        info!(venue = %self.venue, interval = ?self.poll_interval, "REST fallback poller started");

        loop {
            tokio::select! {
                Ok(binding) = bindings_rx.recv() => {
                    if binding.venue == self.venue {
                        bound.insert(
                            binding.market_id,
                            (binding.event_id, binding.contract_entity),
                        );
                    }
                }
                _ = ticker.tick() => {
                    for (market_id, (event_id, entity)) in &bound {
                        if let Err(e) = self.poll_one(market_id, event_id, entity).await {
                            debug!(market_id = %market_id, error = %e, "REST poll failed");
                        }
                    }
                }
            }
        }
    }

    async fn poll_one(
        &self,
        market_id: &MarketId,
        event_id: &EventId,
        entity: &str,
    ) -> Result<()> {
        let url = format!("{}/book/{market_id}", self.base_url);
        let book: RestBook = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut local = LocalOrderBook::new(self.venue, market_id.clone());
        local.apply_snapshot(
            book.bids.iter().map(|l| (l.price_cents, l.size)),
            book.asks.iter().map(|l| (l.price_cents, l.size)),
            book.sequence,
            Utc::now(),
        );

        if let Some(price) = MarketPrice::from_book(&local, event_id.clone(), entity) {
            if let Err(e) = self.repo.record_market_price(&price).await {
                warn!(error = %e, "REST poll price not recorded");
            }
            self.bus.publish_price(price);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_book_parses_sparse_payload() {
        let book: RestBook = serde_json::from_str(
            r#"{"bids":[{"price_cents":45,"size":300}],"sequence":12}"#,
        )
        .unwrap();
        assert_eq!(book.bids.len(), 1);
        assert!(book.asks.is_empty());
        assert_eq!(book.sequence, 12);
    }
}
