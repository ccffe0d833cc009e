//! Error taxonomy for the trading engine.
//!
//! Fatal errors (configuration, authentication) exit the process with a
//! nonzero code. Transient errors are retried at the failing call and only
//! surface as component health degradation. Business rejections are not
//! errors; they travel as [`crate::domain::RejectReason`] on the bus.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal configuration problems. The process exits nonzero on these.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Unparseable {
        path: String,
        source: toml::de::Error,
    },

    #[error("missing credential {name} (set it in the environment)")]
    MissingCredential { name: String },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Venue feed failures.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("authentication rejected by {venue}: {reason}")]
    AuthenticationFailed { venue: String, reason: String },

    #[error("egress verification failed: expected region {expected}, observed {observed}")]
    EgressBlocked { expected: String, observed: String },

    #[error("sequence gap on {market_id}: expected {expected}, got {got}")]
    SequenceGap {
        market_id: String,
        expected: u64,
        got: u64,
    },

    #[error("not connected")]
    NotConnected,

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Order placement failures.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("rate limited by {venue}, retry after {retry_after_ms} ms")]
    RateLimited { venue: String, retry_after_ms: u64 },

    #[error("circuit breaker open for {venue}")]
    CircuitOpen { venue: String },

    #[error("deadline exceeded placing order on {venue}")]
    Timeout { venue: String },

    #[error("venue {venue} rejected order: {reason}")]
    VenueRejected { venue: String, reason: String },

    #[error("protocol violation on {venue}: {detail}")]
    ProtocolViolation { venue: String, detail: String },

    #[error("request expired before placement")]
    Expired,

    #[error("no client registered for venue {venue}")]
    UnknownVenue { venue: String },

    #[error("transport failure on {venue}: {reason}")]
    Transport { venue: String, reason: String },
}

impl ExecutionError {
    /// Rate-limit responses never count against the circuit breaker.
    #[must_use]
    pub const fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Persistence boundary failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("bankroll version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("unknown account {account}")]
    UnknownAccount { account: String },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Shard management failures.
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("shard {shard_id} at capacity ({capacity})")]
    AtCapacity { shard_id: u32, capacity: usize },

    #[error("event {event_id} is not assigned to shard {shard_id}")]
    NotAssigned { event_id: String, shard_id: u32 },
}
