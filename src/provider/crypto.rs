//! Crypto spot provider for strike/expiry markets.
//!
//! Polls spot prices for every asset referenced by a tracked crypto event,
//! maintains a rolling window of hourly closes for realised volatility, and
//! publishes per-event states.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Heartbeat};
use crate::domain::{CryptoState, Event, EventId, EventState, MarketType, ResolutionStatus, StateData};
use crate::error::Result;
use crate::model::annualized_hourly_vol;
use crate::store::Repository;

/// Hours of history kept for the volatility window.
const VOL_WINDOW_HOURS: usize = 72;

#[derive(Debug, Deserialize)]
struct SpotResponse {
    price: f64,
}

/// Per-asset rolling price history, sampled on hour boundaries.
#[derive(Debug, Default)]
struct AssetHistory {
    hourly_closes: VecDeque<f64>,
    last_bucket: Option<i64>,
    last_spot: f64,
}

impl AssetHistory {
    fn observe(&mut self, spot: f64, at: DateTime<Utc>) {
        self.last_spot = spot;
        let bucket = at.timestamp() / 3_600;
        if self.last_bucket != Some(bucket) {
            self.last_bucket = Some(bucket);
            self.hourly_closes.push_back(spot);
            while self.hourly_closes.len() > VOL_WINDOW_HOURS {
                self.hourly_closes.pop_front();
            }
        } else if let Some(last) = self.hourly_closes.back_mut() {
            // Same hour: the close tracks the latest observation.
            *last = spot;
        }
    }

    fn realized_vol(&self, fallback: f64) -> f64 {
        let returns: Vec<f64> = self
            .hourly_closes
            .iter()
            .zip(self.hourly_closes.iter().skip(1))
            .filter(|(a, b)| **a > 0.0 && **b > 0.0)
            .map(|(a, b)| (b / a).ln())
            .collect();
        annualized_hourly_vol(&returns)
            .filter(|vol| *vol > 0.0)
            .unwrap_or(fallback)
    }
}

/// Crypto provider: spot polling plus realised-vol tracking.
pub struct CryptoProvider {
    http: HttpClient,
    base_url: String,
    poll_interval: std::time::Duration,
    /// Volatility used until enough hourly samples accumulate.
    default_vol: f64,
    bus: Bus,
    repo: Arc<dyn Repository>,
    tracked: HashMap<EventId, Event>,
    history: HashMap<String, AssetHistory>,
    /// Reference price per event, captured at first observation.
    references: HashMap<EventId, f64>,
}

impl CryptoProvider {
    #[must_use]
    pub fn new(
        http: HttpClient,
        base_url: String,
        poll_interval_secs: u64,
        default_vol: f64,
        bus: Bus,
        repo: Arc<dyn Repository>,
    ) -> Self {
        Self {
            http,
            base_url,
            poll_interval: std::time::Duration::from_secs(poll_interval_secs),
            default_vol,
            bus,
            repo,
            tracked: HashMap::new(),
            history: HashMap::new(),
            references: HashMap::new(),
        }
    }

    /// Poll loop; tracks crypto events announced on the bus.
    pub async fn run(mut self) -> Result<()> {
        let mut events_rx = self.bus.subscribe_events();
        let mut ticker = tokio::time::interval(self.poll_interval);

        info!("crypto provider started");

        loop {
            tokio::select! {
                Ok(event) = events_rx.recv() => {
                    if matches!(event.market_type, MarketType::Crypto { .. }) {
                        self.tracked.insert(event.event_id.clone(), event);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(Utc::now()).await {
                        warn!(error = %e, "crypto poll failed");
                        self.bus.publish_heartbeat(Heartbeat::unhealthy(
                            "crypto_provider",
                            e.to_string(),
                        ));
                    }
                }
            }
        }
    }

    async fn poll_once(&mut self, now: DateTime<Utc>) -> Result<()> {
        // One spot request per distinct asset, fanned out to its events.
        let assets: Vec<String> = self
            .tracked
            .values()
            .filter_map(|event| match &event.market_type {
                MarketType::Crypto { asset, .. } => Some(asset.clone()),
                MarketType::Sport { .. } => None,
            })
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();

        for asset in assets {
            let url = format!("{}/spot/{asset}", self.base_url);
            let spot: SpotResponse = self
                .http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            self.history.entry(asset).or_default().observe(spot.price, now);
        }

        let states = self.build_states(now);
        for state in states {
            if let Err(e) = self.repo.record_event_state(&state).await {
                debug!(error = %e, "crypto state not recorded");
            }
            self.bus.publish_state(state);
        }
        Ok(())
    }

    /// Build one state per tracked event from current histories.
    fn build_states(&mut self, now: DateTime<Utc>) -> Vec<EventState> {
        let mut states = Vec::new();

        for event in self.tracked.values() {
            let MarketType::Crypto { asset, expiry_utc, .. } = &event.market_type else {
                continue;
            };
            let Some(history) = self.history.get(asset) else {
                continue;
            };
            if history.last_spot <= 0.0 {
                continue;
            }

            let reference = *self
                .references
                .entry(event.event_id.clone())
                .or_insert(history.last_spot);

            let seconds_to_expiry = (*expiry_utc - now).num_seconds();
            let status = if seconds_to_expiry <= 0 {
                ResolutionStatus::Final
            } else {
                ResolutionStatus::Live
            };

            states.push(EventState {
                event_id: event.event_id.clone(),
                status,
                data: StateData::Crypto(CryptoState {
                    spot: history.last_spot,
                    reference,
                    seconds_to_expiry,
                    realized_vol: history.realized_vol(self.default_vol),
                }),
                fetched_at: now,
                fetch_latency_ms: 0,
            });
        }

        states
    }
}
