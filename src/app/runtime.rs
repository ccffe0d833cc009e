//! Engine wiring and lifecycle.
//!
//! Builds every component against the shared bus, spawns the long-lived
//! tasks, seeds pre-bound events, and runs until shutdown. The kill switch
//! halts all new execution-request processing immediately; exit logic
//! keeps running.

use std::sync::Arc;

use reqwest::Client as HttpClient;
use tokio::signal;
use tracing::{info, warn};

use super::config::Config;
use crate::bus::{Bus, HealthRegistry};
use crate::detector::Detector;
use crate::domain::{AccountId, Cents, Event, MarketType, ShardId, Venue};
use crate::error::Result;
use crate::execution::{
    DirectVenueClient, ExecutionEngine, PaperVenueClient, ProxiedVenueClient, RequestSigner,
    VenueClient,
};
use crate::feed::{
    verify_egress, DirectFeedStream, ProxiedFeedStream, ReconnectConfig, ReconnectingStream,
    RestPoller, VenueFeed,
};
use crate::model::ModelRegistry;
use crate::orchestrator::{MarketDiscovery, Orchestrator, StaticDiscovery};
use crate::position::{BankrollLedger, PositionTracker};
use crate::provider::{CryptoProvider, ScoreboardProvider};
use crate::shard::Shard;
use crate::signal::SignalProcessor;
use crate::store::{MemoryRepository, Repository};

/// Run the engine until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    let bus = Bus::new();
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let http = HttpClient::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("http client");

    // Egress for the proxied venue must leave from an allowed region;
    // anything else is fatal before any subscription goes out.
    if !config.account.paper {
        verify_egress(
            &http,
            &config.proxied.egress_check_url,
            &config.proxied.allowed_regions,
        )
        .await?;
    }

    // Bankroll.
    let account = AccountId::from(config.account.account_id.as_str());
    let ledger = BankrollLedger::new(
        account.clone(),
        Arc::clone(&repo),
        bus.clone(),
        config.position.cas_max_retries,
    );
    ledger
        .load_or_seed(Cents::from_dollars(config.account.opening_balance_dollars))
        .await?;

    // Probability models and detector.
    let models = Arc::new(ModelRegistry::with_defaults());
    let detector = Arc::new(Detector::new(config.detector.clone(), config.fees.clone()));

    // Shards.
    let shards: Vec<Arc<Shard>> = (0..config.shards.count)
        .map(|i| {
            Arc::new(Shard::new(
                ShardId::new(i),
                config.shards.shard.clone(),
                bus.clone(),
                Arc::clone(&models),
                Arc::clone(&detector),
            ))
        })
        .collect();
    for shard in &shards {
        tokio::spawn(Arc::clone(shard).run());
    }

    // Signal processor.
    let processor = Arc::new(SignalProcessor::new(
        config.signals.clone(),
        config.fees.clone(),
        bus.clone(),
        Arc::clone(&repo),
    ));
    tokio::spawn(Arc::clone(&processor).run());

    // Execution engine with per-mode clients.
    let mut engine = ExecutionEngine::new(
        config.execution.clone(),
        config.fees.clone(),
        bus.clone(),
        Arc::clone(&repo),
    );
    if config.account.paper {
        info!("paper mode: simulated fills with real fee attribution");
        for venue in [Venue::Direct, Venue::Proxied] {
            let paper = Arc::new(PaperVenueClient::mirroring(config.fees.clone(), venue));
            spawn_paper_price_feed(&bus, venue, Arc::clone(&paper));
            engine.register_client_as(venue, paper as Arc<dyn VenueClient>);
        }
    } else {
        let direct_creds = config.credentials(Venue::Direct)?;
        engine.register_client(Arc::new(DirectVenueClient::new(
            config.direct.api_url.clone(),
            RequestSigner::new(direct_creds.api_key, direct_creds.api_secret.into_bytes()),
            http.clone(),
        )) as Arc<dyn VenueClient>);

        let proxied_creds = config.credentials(Venue::Proxied)?;
        engine.register_client(Arc::new(ProxiedVenueClient::new(
            config.proxied.api_url.clone(),
            RequestSigner::new(proxied_creds.api_key, proxied_creds.api_secret.into_bytes()),
            http.clone(),
        )) as Arc<dyn VenueClient>);
    }
    let engine = Arc::new(engine);
    tokio::spawn(Arc::clone(&engine).run());

    // Position tracker.
    let tracker = Arc::new(PositionTracker::new(
        config.position.clone(),
        BankrollLedger::new(
            account,
            Arc::clone(&repo),
            bus.clone(),
            config.position.cas_max_retries,
        ),
        bus.clone(),
    ));
    tokio::spawn(Arc::clone(&tracker).run());

    // Venue feeds. Market data is live in both paper and live mode.
    spawn_feeds(&config, &bus, &repo, &http)?;

    // Event providers.
    let scoreboard = ScoreboardProvider::new(
        http.clone(),
        config.provider.scoreboard_url.clone(),
        config.provider.sports.clone(),
        config.provider.cadence.clone(),
        bus.clone(),
        Arc::clone(&repo),
    );
    tokio::spawn(scoreboard.run());

    let crypto = CryptoProvider::new(
        http.clone(),
        config.provider.crypto_spot_url.clone(),
        config.provider.crypto_poll_secs,
        config.provider.crypto_default_vol,
        bus.clone(),
        Arc::clone(&repo),
    );
    tokio::spawn(crypto.run());

    // Orchestrator with statically seeded discovery; the external
    // discovery service plugs in behind the same trait.
    let discovery = Arc::new(StaticDiscovery::new());
    for seed in &config.seed_events {
        let mut bindings = Vec::new();
        for market in &seed.direct_markets {
            bindings.push(market.binding(&seed.event_id, Venue::Direct));
        }
        for market in &seed.proxied_markets {
            bindings.push(market.binding(&seed.event_id, Venue::Proxied));
        }
        discovery.insert(crate::domain::EventId::from(seed.event_id.as_str()), bindings);
    }
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        shards,
        Arc::clone(&discovery) as Arc<dyn MarketDiscovery>,
        bus.clone(),
        Arc::clone(&repo),
    ));
    tokio::spawn(Arc::clone(&orchestrator).run());

    for seed in &config.seed_events {
        let event = Event {
            event_id: crate::domain::EventId::from(seed.event_id.as_str()),
            market_type: MarketType::Sport {
                sport: seed.sport,
                league: seed
                    .league
                    .clone()
                    .unwrap_or_else(|| seed.sport.as_str().to_string()),
            },
            entity_a: seed.home.clone(),
            entity_b: Some(seed.away.clone()),
            scheduled_start_utc: seed.scheduled_start_utc,
        };
        if let Err(e) = orchestrator.on_event_discovered(event).await {
            warn!(event_id = %seed.event_id, error = %e, "seed event not assigned");
        }
    }

    // Component health watchdog.
    let health = Arc::new(HealthRegistry::new());
    {
        let health = Arc::clone(&health);
        let mut heartbeats = bus.subscribe_heartbeats();
        tokio::spawn(async move {
            let mut check = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    Ok(heartbeat) = heartbeats.recv() => health.observe(heartbeat),
                    _ = check.tick() => {
                        let unhealthy = health
                            .unhealthy(chrono::Utc::now(), chrono::Duration::seconds(60));
                        if !unhealthy.is_empty() {
                            warn!(components = ?unhealthy, "components degraded");
                        }
                    }
                }
            }
        });
    }

    info!("engine running; ctrl-c to stop");
    signal::ctrl_c().await?;

    info!("shutdown signal received, engaging kill switch");
    bus.engage_kill_switch();
    // Give in-flight exits a moment to land before the process ends.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    Ok(())
}

/// Forward live prices for one venue into its paper simulator.
fn spawn_paper_price_feed(bus: &Bus, venue: Venue, paper: Arc<PaperVenueClient>) {
    let mut prices = bus.subscribe_prices();
    tokio::spawn(async move {
        while let Ok(price) = prices.recv().await {
            if price.venue == venue {
                paper.observe_price(price);
            }
        }
    });
}

/// Spawn both venue feeds and their REST fallback pollers.
fn spawn_feeds(
    config: &Config,
    bus: &Bus,
    repo: &Arc<dyn Repository>,
    http: &HttpClient,
) -> Result<()> {
    // Direct venue: signed WebSocket upgrade. Paper mode uses placeholder
    // credentials; the public market-data channels do not authenticate.
    let direct_creds = if config.account.paper {
        config.credentials(Venue::Paper)?
    } else {
        config.credentials(Venue::Direct)?
    };
    let direct_stream = ReconnectingStream::new(
        DirectFeedStream::new(
            config.direct.ws_url.clone(),
            RequestSigner::new(direct_creds.api_key, direct_creds.api_secret.into_bytes()),
        ),
        ReconnectConfig::default(),
    );
    let direct_feed = VenueFeed::new(direct_stream, bus.clone(), Arc::clone(repo));
    tokio::spawn(async move {
        if let Err(e) = direct_feed.run().await {
            if matches!(
                e,
                crate::error::Error::Feed(crate::error::FeedError::AuthenticationFailed { .. })
            ) {
                tracing::error!(error = %e, "venue rejected our credentials");
                std::process::exit(1);
            }
            warn!(error = %e, "direct feed terminated");
        }
    });

    let proxied_stream = ReconnectingStream::new(
        ProxiedFeedStream::new(config.proxied.ws_url.clone()),
        ReconnectConfig::default(),
    );
    let proxied_feed = VenueFeed::new(proxied_stream, bus.clone(), Arc::clone(repo));
    tokio::spawn(async move {
        if let Err(e) = proxied_feed.run().await {
            warn!(error = %e, "proxied feed terminated");
        }
    });

    for (venue, base_url, interval) in [
        (
            Venue::Direct,
            config.direct.api_url.clone(),
            config.direct.rest_poll_interval_secs,
        ),
        (
            Venue::Proxied,
            config.proxied.api_url.clone(),
            config.proxied.rest_poll_interval_secs,
        ),
    ] {
        let poller = RestPoller::new(
            venue,
            http.clone(),
            base_url,
            interval,
            bus.clone(),
            Arc::clone(repo),
        );
        tokio::spawn(async move {
            if let Err(e) = poller.run().await {
                warn!(error = %e, venue = %venue, "REST poller terminated");
            }
        });
    }

    Ok(())
}
