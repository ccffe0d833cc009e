//! Application configuration loading and validation.
//!
//! Configuration is loaded from a TOML file with environment variable
//! lookups for credentials. Invalid configuration is fatal: the process
//! exits nonzero before touching a venue.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};

use crate::detector::DetectorConfig;
use crate::domain::{Sport, Venue};
use crate::error::ConfigError;
use crate::execution::ExecutionConfig;
use crate::fees::FeeModel;
use crate::orchestrator::OrchestratorConfig;
use crate::position::PositionConfig;
use crate::provider::PollCadence;
use crate::shard::ShardConfig;
use crate::signal::ProcessorConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub account_id: String,
    pub opening_balance_dollars: i64,
    /// Paper mode simulates fills but consumes live market data.
    pub paper: bool,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            account_id: "default".into(),
            opening_balance_dollars: 1_000,
            paper: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectVenueConfig {
    pub ws_url: String,
    pub api_url: String,
    /// Environment variable names, not the secrets themselves.
    pub api_key_env: String,
    pub api_secret_env: String,
    pub rest_poll_interval_secs: u64,
}

impl Default for DirectVenueConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.direct.example/trade-api/ws/v2".into(),
            api_url: "https://api.direct.example".into(),
            api_key_env: "DIRECT_API_KEY".into(),
            api_secret_env: "DIRECT_API_SECRET".into(),
            rest_poll_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxiedVenueConfig {
    pub ws_url: String,
    pub api_url: String,
    pub api_key_env: String,
    pub api_secret_env: String,
    pub rest_poll_interval_secs: u64,
    /// Region check endpoint asserted at startup.
    pub egress_check_url: String,
    pub allowed_regions: Vec<String>,
}

impl Default for ProxiedVenueConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws.proxied.example/market".into(),
            api_url: "https://api.proxied.example".into(),
            api_key_env: "PROXIED_API_KEY".into(),
            api_secret_env: "PROXIED_API_SECRET".into(),
            rest_poll_interval_secs: 2,
            egress_check_url: "https://api.proxied.example/geo".into(),
            allowed_regions: vec!["IE".into(), "DE".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub scoreboard_url: String,
    pub sports: Vec<Sport>,
    pub cadence: PollCadence,
    pub crypto_spot_url: String,
    pub crypto_poll_secs: u64,
    pub crypto_default_vol: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            scoreboard_url: "https://data.example/v1".into(),
            sports: vec![Sport::Nba],
            cadence: PollCadence::default(),
            crypto_spot_url: "https://data.example/crypto".into(),
            crypto_poll_secs: 3,
            crypto_default_vol: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardsConfig {
    pub count: u32,
    #[serde(flatten)]
    pub shard: ShardConfig,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            count: 2,
            shard: ShardConfig::default(),
        }
    }
}

/// A pre-bound event for paper mode, where the external discovery service
/// is not reachable.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEvent {
    pub event_id: String,
    pub sport: Sport,
    #[serde(default)]
    pub league: Option<String>,
    pub home: String,
    pub away: String,
    pub scheduled_start_utc: DateTime<Utc>,
    #[serde(default)]
    pub direct_markets: Vec<SeedMarket>,
    #[serde(default)]
    pub proxied_markets: Vec<SeedMarket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedMarket {
    pub market_id: String,
    pub contract_entity: String,
}

impl SeedMarket {
    #[must_use]
    pub fn binding(&self, event_id: &str, venue: Venue) -> crate::bus::MarketBinding {
        crate::bus::MarketBinding {
            event_id: crate::domain::EventId::from(event_id),
            venue,
            market_id: crate::domain::MarketId::from(self.market_id.as_str()),
            contract_entity: self.contract_entity.clone(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub account: AccountConfig,
    pub direct: DirectVenueConfig,
    pub proxied: ProxiedVenueConfig,
    pub provider: ProviderConfig,
    pub fees: FeeModel,
    pub detector: DetectorConfig,
    pub signals: ProcessorConfig,
    pub execution: ExecutionConfig,
    pub position: PositionConfig,
    pub shards: ShardsConfig,
    pub orchestrator: OrchestratorConfig,
    pub seed_events: Vec<SeedEvent>,
}

/// Resolved venue credentials, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Unparseable {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants; fatal on violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |ok: bool, key: &str, reason: &str| {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue {
                    key: key.into(),
                    reason: reason.into(),
                })
            }
        };

        check(
            self.account.opening_balance_dollars > 0,
            "account.opening_balance_dollars",
            "must be positive",
        )?;
        check(
            (0.0..=1.0).contains(&self.signals.kelly_fraction),
            "signals.kelly_fraction",
            "must be in [0, 1]",
        )?;
        check(
            self.signals.min_buy_prob < self.signals.max_buy_prob,
            "signals.min_buy_prob",
            "must be below max_buy_prob",
        )?;
        check(
            (0.0..1.0).contains(&self.position.max_drawdown_pct),
            "position.max_drawdown_pct",
            "must be in [0, 1)",
        )?;
        check(self.shards.count > 0, "shards.count", "need at least one shard")?;
        check(
            self.shards.shard.capacity > 0,
            "shards.capacity",
            "need capacity for at least one event",
        )?;
        check(
            !self.account.paper || !self.seed_events.is_empty() || !self.provider.sports.is_empty(),
            "seed_events",
            "paper mode needs seed events or tracked sports",
        )?;
        check(
            self.execution.rate_limit_retries > 0,
            "execution.rate_limit_retries",
            "must allow at least one retry",
        )?;
        Ok(())
    }

    /// Read a venue's credentials from the environment. Only required in
    /// live mode; missing credentials are a fatal configuration error.
    pub fn credentials(&self, venue: Venue) -> Result<Credentials, ConfigError> {
        let (key_env, secret_env) = match venue {
            Venue::Direct => (&self.direct.api_key_env, &self.direct.api_secret_env),
            Venue::Proxied => (&self.proxied.api_key_env, &self.proxied.api_secret_env),
            Venue::Paper => {
                return Ok(Credentials {
                    api_key: "paper".into(),
                    api_secret: "paper".into(),
                })
            }
        };

        let read = |name: &str| {
            std::env::var(name).map_err(|_| ConfigError::MissingCredential { name: name.into() })
        };
        Ok(Credentials {
            api_key: read(key_env)?,
            api_secret: read(secret_env)?,
        })
    }

    /// Initialise the tracing subscriber from the logging section.
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.logging.level.clone()));
        if self.logging.json {
            fmt().with_env_filter(filter).json().init();
        } else {
            fmt().with_env_filter(filter).init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parses_full_toml() {
        let raw = r#"
            [logging]
            level = "debug"

            [account]
            account_id = "prop-1"
            opening_balance_dollars = 25000
            paper = false

            [direct]
            ws_url = "wss://direct.example/ws"
            api_url = "https://direct.example"

            [signals]
            min_edge_pct = 0.015
            kelly_fraction = 0.2

            [shards]
            count = 4
            capacity = 10

            [[seed_events]]
            event_id = "nba-1"
            sport = "NBA"
            home = "Lakers"
            away = "Celtics"
            scheduled_start_utc = "2026-01-15T00:30:00Z"

            [[seed_events.direct_markets]]
            market_id = "NBA-LAL"
            contract_entity = "Lakers"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.account.opening_balance_dollars, 25_000);
        assert!(!config.account.paper);
        assert!((config.signals.min_edge_pct - 0.015).abs() < 1e-12);
        assert_eq!(config.shards.count, 4);
        assert_eq!(config.shards.shard.capacity, 10);
        assert_eq!(config.seed_events.len(), 1);
        assert_eq!(config.seed_events[0].direct_markets[0].market_id, "NBA-LAL");
    }

    #[test]
    fn invalid_kelly_fraction_is_fatal() {
        let mut config = Config::default();
        config.signals.kelly_fraction = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "signals.kelly_fraction"
        ));
    }

    #[test]
    fn missing_credentials_are_fatal_for_live_venues() {
        let mut config = Config::default();
        config.direct.api_key_env = "OVERROUND_TEST_MISSING_KEY".into();
        assert!(matches!(
            config.credentials(Venue::Direct),
            Err(ConfigError::MissingCredential { .. })
        ));
        // Paper never needs credentials.
        assert!(config.credentials(Venue::Paper).is_ok());
    }

    #[test]
    fn missing_file_is_unreadable() {
        assert!(matches!(
            Config::load("/nonexistent/overround.toml"),
            Err(ConfigError::Unreadable { .. })
        ));
    }

    #[test]
    fn load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[account]\nopening_balance_dollars = 5000\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.account.opening_balance_dollars, 5_000);
        assert!(config.account.paper);
    }

    #[test]
    fn garbage_toml_is_unparseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Unparseable { .. })
        ));
    }
}
