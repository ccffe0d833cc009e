//! In-memory repository used by paper trading and tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::Repository;
use crate::domain::{
    AccountId, Bankroll, Event, EventId, EventState, ExecutionResult, MarketId, MarketPrice, Play,
    PlayId, Signal, Venue,
};
use crate::error::StoreError;

/// Dedup key for the price time-series.
type PriceKey = (DateTime<Utc>, MarketId, Venue, String);

/// In-memory repository with the same dedup and CAS semantics as the real
/// storage backend.
#[derive(Default)]
pub struct MemoryRepository {
    trades: RwLock<Vec<ExecutionResult>>,
    signals: RwLock<Vec<Signal>>,
    plays: RwLock<Vec<Play>>,
    play_keys: RwLock<HashSet<(EventId, PlayId)>>,
    states: RwLock<Vec<EventState>>,
    prices: RwLock<Vec<MarketPrice>>,
    price_keys: RwLock<HashSet<PriceKey>>,
    bankrolls: RwLock<HashMap<AccountId, Bankroll>>,
    events: RwLock<HashMap<EventId, Event>>,
    archived: RwLock<HashSet<EventId>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a bankroll row (version left as stored).
    pub fn seed_bankroll(&self, bankroll: Bankroll) {
        self.bankrolls
            .write()
            .insert(bankroll.account.clone(), bankroll);
    }

    #[must_use]
    pub fn trades(&self) -> Vec<ExecutionResult> {
        self.trades.read().clone()
    }

    #[must_use]
    pub fn signals(&self) -> Vec<Signal> {
        self.signals.read().clone()
    }

    #[must_use]
    pub fn plays(&self) -> Vec<Play> {
        self.plays.read().clone()
    }

    #[must_use]
    pub fn prices(&self) -> Vec<MarketPrice> {
        self.prices.read().clone()
    }

    #[must_use]
    pub fn event(&self, event_id: &EventId) -> Option<Event> {
        self.events.read().get(event_id).cloned()
    }

    #[must_use]
    pub fn is_archived(&self, event_id: &EventId) -> bool {
        self.archived.read().contains(event_id)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn record_trade(&self, trade: &ExecutionResult) -> Result<(), StoreError> {
        self.trades.write().push(trade.clone());
        Ok(())
    }

    async fn record_signal(&self, signal: &Signal) -> Result<(), StoreError> {
        self.signals.write().push(signal.clone());
        Ok(())
    }

    async fn record_play(&self, play: &Play) -> Result<(), StoreError> {
        let key = (play.event_id.clone(), play.play_id.clone());
        if self.play_keys.write().insert(key) {
            self.plays.write().push(play.clone());
        }
        Ok(())
    }

    async fn record_event_state(&self, state: &EventState) -> Result<(), StoreError> {
        self.states.write().push(state.clone());
        Ok(())
    }

    async fn record_market_price(&self, price: &MarketPrice) -> Result<(), StoreError> {
        let key = (
            price.updated_utc,
            price.market_id.clone(),
            price.venue,
            price.contract_entity.clone(),
        );
        if self.price_keys.write().insert(key) {
            self.prices.write().push(price.clone());
        }
        Ok(())
    }

    async fn load_bankroll(&self, account: &AccountId) -> Result<Option<Bankroll>, StoreError> {
        Ok(self.bankrolls.read().get(account).cloned())
    }

    async fn store_bankroll(
        &self,
        bankroll: &Bankroll,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut rows = self.bankrolls.write();
        match rows.get(&bankroll.account) {
            Some(stored) if stored.version != expected_version => Err(StoreError::VersionConflict {
                expected: expected_version,
                found: stored.version,
            }),
            _ => {
                rows.insert(bankroll.account.clone(), bankroll.clone());
                Ok(())
            }
        }
    }

    async fn upsert_event(&self, event: &Event) -> Result<(), StoreError> {
        self.events
            .write()
            .insert(event.event_id.clone(), event.clone());
        Ok(())
    }

    async fn archive_event(&self, event_id: &EventId) -> Result<(), StoreError> {
        self.archived.write().insert(event_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Cents, PlayKind};

    #[tokio::test]
    async fn plays_dedupe_by_id() {
        let repo = MemoryRepository::new();
        let play = Play {
            play_id: PlayId::from("p1"),
            event_id: EventId::from("e1"),
            kind: PlayKind::Score { points: 2 },
            time_utc: Utc::now(),
        };
        repo.record_play(&play).await.unwrap();
        repo.record_play(&play).await.unwrap();
        assert_eq!(repo.plays().len(), 1);
    }

    #[tokio::test]
    async fn bankroll_cas_detects_conflict() {
        let repo = MemoryRepository::new();
        let mut bankroll = Bankroll::new(AccountId::from("a"), Cents::from_dollars(100));
        repo.seed_bankroll(bankroll.clone());

        // Writer A succeeds from version 0.
        assert!(bankroll.debit_entry(Cents::from_dollars(10), Cents::ZERO));
        repo.store_bankroll(&bankroll, 0).await.unwrap();

        // Writer B raced from the same base version and must fail.
        let err = repo.store_bankroll(&bankroll, 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                found: 1
            }
        ));
    }

    #[tokio::test]
    async fn price_series_dedupes_on_natural_key() {
        let repo = MemoryRepository::new();
        let mut book = crate::domain::LocalOrderBook::new(Venue::Direct, MarketId::from("m1"));
        let at = Utc::now();
        book.apply_snapshot(vec![(70, 100)], vec![(72, 100)], 1, at);
        let price = MarketPrice::from_book(&book, EventId::from("e1"), "Lakers").unwrap();

        repo.record_market_price(&price).await.unwrap();
        repo.record_market_price(&price).await.unwrap();
        assert_eq!(repo.prices().len(), 1);
    }
}
