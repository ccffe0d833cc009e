//! Reconnecting wrapper for any venue stream.
//!
//! Exponential backoff capped at 60 s, reset on a successful receive. An
//! idle stream gets a ping after 30 s; a stream that stays silent past the
//! idle window plus the ping is treated as disconnected.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{FeedMessage, FeedStream};
use crate::domain::{MarketId, Venue};
use crate::error::Result;

/// Reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub idle_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            idle_timeout_secs: 30,
        }
    }
}

/// Wrapper that adds reconnection and idle pings to any [`FeedStream`].
pub struct ReconnectingStream<S: FeedStream> {
    inner: S,
    config: ReconnectConfig,
    subscribed: Vec<MarketId>,
    current_delay_ms: u64,
    connected: bool,
}

impl<S: FeedStream> ReconnectingStream<S> {
    pub fn new(inner: S, config: ReconnectConfig) -> Self {
        let initial = config.initial_delay_ms;
        Self {
            inner,
            config,
            subscribed: Vec::new(),
            current_delay_ms: initial,
            connected: false,
        }
    }

    fn reset_backoff(&mut self) {
        self.current_delay_ms = self.config.initial_delay_ms;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.current_delay_ms);
        let next = (self.current_delay_ms as f64 * self.config.backoff_multiplier) as u64;
        self.current_delay_ms = next.min(self.config.max_delay_ms);
        delay
    }

    async fn reconnect(&mut self) -> Result<()> {
        let delay = self.next_delay();
        info!(
            venue = %self.inner.venue(),
            delay_ms = delay.as_millis(),
            "reconnecting after delay"
        );
        sleep(delay).await;

        self.inner.connect().await?;
        self.connected = true;
        if !self.subscribed.is_empty() {
            debug!(markets = self.subscribed.len(), "resubscribing full set");
            self.inner.subscribe(&self.subscribed).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: FeedStream + Send> FeedStream for ReconnectingStream<S> {
    async fn connect(&mut self) -> Result<()> {
        let result = self.inner.connect().await;
        if result.is_ok() {
            self.connected = true;
            self.reset_backoff();
        }
        result
    }

    async fn subscribe(&mut self, market_ids: &[MarketId]) -> Result<()> {
        for market_id in market_ids {
            if !self.subscribed.contains(market_id) {
                self.subscribed.push(market_id.clone());
            }
        }
        self.inner.subscribe(market_ids).await
    }

    async fn unsubscribe(&mut self, market_ids: &[MarketId]) -> Result<()> {
        self.subscribed.retain(|id| !market_ids.contains(id));
        self.inner.unsubscribe(market_ids).await
    }

    async fn request_snapshot(&mut self, market_id: &MarketId) -> Result<()> {
        self.inner.request_snapshot(market_id).await
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner.ping().await
    }

    async fn next_message(&mut self) -> Option<FeedMessage> {
        loop {
            if !self.connected {
                if let Err(e) = self.reconnect().await {
                    warn!(error = %e, "reconnect attempt failed, will retry");
                    continue;
                }
            }

            let idle = Duration::from_secs(self.config.idle_timeout_secs);
            match timeout(idle, self.inner.next_message()).await {
                Ok(Some(FeedMessage::Disconnected { reason })) => {
                    warn!(reason = %reason, "connection lost, will reconnect");
                    self.connected = false;
                }
                Ok(Some(message)) => {
                    // Successful receive resets the backoff schedule.
                    self.reset_backoff();
                    return Some(message);
                }
                Ok(None) => {
                    warn!("stream ended unexpectedly, will reconnect");
                    self.connected = false;
                }
                Err(_) => {
                    // Idle: ping, then give the venue one more window.
                    debug!(venue = %self.inner.venue(), "idle timeout, pinging");
                    if self.inner.ping().await.is_err() {
                        self.connected = false;
                        continue;
                    }
                    match timeout(idle, self.inner.next_message()).await {
                        Ok(Some(FeedMessage::Disconnected { reason })) => {
                            warn!(reason = %reason, "connection lost after ping");
                            self.connected = false;
                        }
                        Ok(Some(message)) => {
                            self.reset_backoff();
                            return Some(message);
                        }
                        Ok(None) | Err(_) => {
                            warn!("no traffic after ping, reconnecting");
                            self.connected = false;
                        }
                    }
                }
            }
        }
    }

    fn venue(&self) -> Venue {
        self.inner.venue()
    }
}
