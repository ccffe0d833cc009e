//! Persistence boundary.
//!
//! The engine writes through this narrow repository port; the actual
//! time-series storage lives outside the core. Append-only records are
//! deduplicated by their natural keys, and the bankroll row is guarded by a
//! compare-and-swap on its version.

mod memory;

pub use memory::MemoryRepository;

use async_trait::async_trait;

use crate::domain::{
    AccountId, Bankroll, Event, EventId, EventState, ExecutionResult, MarketPrice, Play, Signal,
};
use crate::error::StoreError;

/// Repository capabilities required by the core pipeline.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Append a completed trade (an execution result).
    async fn record_trade(&self, trade: &ExecutionResult) -> Result<(), StoreError>;

    /// Append an emitted signal.
    async fn record_signal(&self, signal: &Signal) -> Result<(), StoreError>;

    /// Append a play. Idempotent on `(event_id, play_id)`.
    async fn record_play(&self, play: &Play) -> Result<(), StoreError>;

    /// Append an event-state snapshot.
    async fn record_event_state(&self, state: &EventState) -> Result<(), StoreError>;

    /// Append a market price. Deduplicated on
    /// `(time, market_id, venue, entity)`.
    async fn record_market_price(&self, price: &MarketPrice) -> Result<(), StoreError>;

    /// Load the bankroll row for an account.
    async fn load_bankroll(&self, account: &AccountId) -> Result<Option<Bankroll>, StoreError>;

    /// Store the bankroll iff the stored version equals `expected_version`.
    ///
    /// Returns [`StoreError::VersionConflict`] when another writer won.
    async fn store_bankroll(
        &self,
        bankroll: &Bankroll,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Idempotent upsert keyed by `event_id`.
    async fn upsert_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Move a completed event and its attached records to the archive.
    async fn archive_event(&self, event_id: &EventId) -> Result<(), StoreError>;
}
