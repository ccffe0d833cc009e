//! Bankroll accounting with optimistic concurrency.

use serde::{Deserialize, Serialize};

use super::id::AccountId;
use super::money::Cents;

/// Singleton per-account bankroll row.
///
/// Every mutation increments `version`; a write succeeds only when the
/// caller's expected version matches the stored one. The piggy-bank is a
/// protected slice of profit excluded from position sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bankroll {
    pub account: AccountId,
    /// Tradeable balance, excluding the piggy-bank.
    pub balance: Cents,
    pub piggybank_balance: Cents,
    /// Max-loss reserves held against open positions.
    pub reserved: Cents,
    pub version: u64,
    pub peak: Cents,
    pub trough: Cents,
}

impl Bankroll {
    #[must_use]
    pub fn new(account: AccountId, opening_balance: Cents) -> Self {
        Self {
            account,
            balance: opening_balance,
            piggybank_balance: Cents::ZERO,
            reserved: Cents::ZERO,
            version: 0,
            peak: opening_balance,
            trough: opening_balance,
        }
    }

    /// Balance available for new entries (tradeable minus reserves).
    #[must_use]
    pub fn available(&self) -> Cents {
        self.balance.saturating_sub_zero(self.reserved)
    }

    /// Debit an entry: cost leaves the balance, max loss is reserved.
    /// Returns `false` (no mutation) when the balance cannot cover the cost.
    #[must_use]
    pub fn debit_entry(&mut self, cost: Cents, reserve: Cents) -> bool {
        if cost > self.available() {
            return false;
        }
        self.balance -= cost;
        self.reserved += reserve;
        self.touch();
        true
    }

    /// Credit exit proceeds, release the reserve, and skim the piggy-bank
    /// share of any net profit.
    pub fn credit_exit(
        &mut self,
        proceeds: Cents,
        released_reserve: Cents,
        realized_pnl: Cents,
        piggybank_pct: f64,
    ) {
        self.reserved = self.reserved.saturating_sub_zero(released_reserve);

        if realized_pnl.is_positive() {
            let skim = Cents::new(
                (realized_pnl.value() as f64 * piggybank_pct.clamp(0.0, 1.0)).floor() as i64,
            );
            self.piggybank_balance += skim;
            self.balance += proceeds - skim;
        } else {
            self.balance += proceeds;
        }
        self.touch();
    }

    /// Drawdown from peak as a fraction of peak. Zero when peak is zero.
    #[must_use]
    pub fn drawdown_fraction(&self) -> f64 {
        if !self.peak.is_positive() {
            return 0.0;
        }
        let dd = (self.peak - self.balance).value().max(0);
        dd as f64 / self.peak.value() as f64
    }

    /// True when the drawdown guard should pause new entries.
    #[must_use]
    pub fn breaches_drawdown(&self, max_drawdown_pct: f64) -> bool {
        self.drawdown_fraction() >= max_drawdown_pct
    }

    fn touch(&mut self) {
        self.version += 1;
        self.peak = self.peak.max(self.balance);
        self.trough = self.trough.min(self.balance);
    }
}
