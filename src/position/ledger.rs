//! Bankroll ledger with optimistic concurrency.
//!
//! Every mutation goes through a read/compute/conditional-write loop on the
//! bankroll row's version. Conflicts retry, bounded. Successful writes are
//! broadcast on `bankroll.updated`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::Bus;
use crate::domain::{AccountId, Bankroll, Cents};
use crate::error::StoreError;
use crate::store::Repository;

pub struct BankrollLedger {
    account: AccountId,
    repo: Arc<dyn Repository>,
    bus: Bus,
    max_retries: u32,
}

impl BankrollLedger {
    #[must_use]
    pub fn new(account: AccountId, repo: Arc<dyn Repository>, bus: Bus, max_retries: u32) -> Self {
        Self {
            account,
            repo,
            bus,
            max_retries,
        }
    }

    /// Load the row, seeding it with `opening_balance` if absent.
    pub async fn load_or_seed(&self, opening_balance: Cents) -> Result<Bankroll, StoreError> {
        if let Some(bankroll) = self.repo.load_bankroll(&self.account).await? {
            return Ok(bankroll);
        }
        let bankroll = Bankroll::new(self.account.clone(), opening_balance);
        self.repo.store_bankroll(&bankroll, 0).await?;
        self.bus.publish_bankroll(bankroll.clone());
        Ok(bankroll)
    }

    /// Apply `mutation` under the CAS loop.
    ///
    /// The closure returns `false` to abort (e.g. insufficient funds);
    /// aborts surface as `Ok(None)` with no write. Version conflicts retry
    /// up to the bound, then surface the conflict.
    pub async fn mutate<F>(&self, mutation: F) -> Result<Option<Bankroll>, StoreError>
    where
        F: Fn(&mut Bankroll) -> bool,
    {
        let mut attempt = 0;
        loop {
            let mut bankroll = self
                .repo
                .load_bankroll(&self.account)
                .await?
                .ok_or_else(|| StoreError::UnknownAccount {
                    account: self.account.to_string(),
                })?;
            let expected = bankroll.version;

            if !mutation(&mut bankroll) {
                return Ok(None);
            }

            match self.repo.store_bankroll(&bankroll, expected).await {
                Ok(()) => {
                    self.bus.publish_bankroll(bankroll.clone());
                    return Ok(Some(bankroll));
                }
                Err(StoreError::VersionConflict { .. }) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        warn!(attempts = attempt, "bankroll CAS retries exhausted");
                        return Err(StoreError::VersionConflict {
                            expected,
                            found: expected,
                        });
                    }
                    debug!(attempt, "bankroll CAS conflict, retrying");
                }
                Err(other) => return Err(other),
            }
        }
    }

    #[must_use]
    pub const fn account(&self) -> &AccountId {
        &self.account
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepository;

    fn ledger(repo: Arc<MemoryRepository>) -> BankrollLedger {
        BankrollLedger::new(AccountId::from("acct"), repo, Bus::new(), 8)
    }

    #[tokio::test]
    async fn seed_then_load() {
        let repo = Arc::new(MemoryRepository::new());
        let l = ledger(repo.clone());
        let seeded = l.load_or_seed(Cents::from_dollars(1_000)).await.unwrap();
        assert_eq!(seeded.balance, Cents::from_dollars(1_000));

        // Second call loads the stored row instead of reseeding.
        let loaded = l.load_or_seed(Cents::from_dollars(5)).await.unwrap();
        assert_eq!(loaded.balance, Cents::from_dollars(1_000));
    }

    #[tokio::test]
    async fn mutation_increments_version_and_publishes() {
        let repo = Arc::new(MemoryRepository::new());
        let bus = Bus::new();
        let mut updates = bus.subscribe_bankroll();
        let l = BankrollLedger::new(AccountId::from("acct"), repo.clone(), bus, 8);
        l.load_or_seed(Cents::from_dollars(100)).await.unwrap();

        let updated = l
            .mutate(|b| b.debit_entry(Cents::from_dollars(10), Cents::from_dollars(10)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.balance, Cents::from_dollars(90));

        // Seed publish plus the mutation publish.
        let first = updates.recv().await.unwrap();
        let second = updates.recv().await.unwrap();
        assert_eq!(first.version, 0);
        assert_eq!(second.version, updated.version);
    }

    #[tokio::test]
    async fn aborted_mutation_writes_nothing() {
        let repo = Arc::new(MemoryRepository::new());
        let l = ledger(repo.clone());
        l.load_or_seed(Cents::from_dollars(10)).await.unwrap();

        let result = l
            .mutate(|b| b.debit_entry(Cents::from_dollars(500), Cents::ZERO))
            .await
            .unwrap();
        assert!(result.is_none());

        let stored = repo
            .load_bankroll(&AccountId::from("acct"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.balance, Cents::from_dollars(10));
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn concurrent_mutations_all_land() {
        let repo = Arc::new(MemoryRepository::new());
        let l = Arc::new(BankrollLedger::new(
            AccountId::from("acct"),
            repo.clone(),
            Bus::new(),
            64,
        ));
        l.load_or_seed(Cents::from_dollars(1_000)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let l = Arc::clone(&l);
            handles.push(tokio::spawn(async move {
                l.mutate(|b| b.debit_entry(Cents::from_dollars(1), Cents::ZERO))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }

        let stored = repo
            .load_bankroll(&AccountId::from("acct"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.balance, Cents::from_dollars(990));
        assert_eq!(stored.version, 10);
    }
}
