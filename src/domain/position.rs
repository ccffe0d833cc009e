//! Open positions and their exits.
//!
//! Positions are exclusively owned by the position tracker; every other
//! component sees them by value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{EventId, MarketId, PositionId, SignalId};
use super::market::Venue;
use super::money::Cents;
use super::execution::Side;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TimeStop,
    Settlement,
    /// Offsetting IOC issued to neutralise an unpaired arbitrage leg.
    OffsetUnpaired,
}

/// Terminal exit record attached to a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionExit {
    pub exit_price: Cents,
    pub exit_fee: Cents,
    pub reason: ExitReason,
    pub closed_utc: DateTime<Utc>,
    /// Net of entry and exit fees.
    pub realized_pnl: Cents,
}

/// One open (or closed) holding on a single market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: PositionId,
    pub signal_id: SignalId,
    pub venue: Venue,
    pub market_id: MarketId,
    pub event_id: EventId,
    pub entity: String,
    pub side: Side,
    pub qty_open: i64,
    /// Per-unit entry price.
    pub entry_price: Cents,
    pub entry_fee: Cents,
    pub opened_utc: DateTime<Utc>,
    pub stop_loss_price: Cents,
    pub take_profit_price: Cents,
    pub time_stop_utc: Option<DateTime<Utc>>,
    pub exit: Option<PositionExit>,
}

impl Position {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.exit.is_none()
    }

    /// Entry notional excluding fees.
    #[must_use]
    pub const fn entry_notional(&self) -> Cents {
        self.entry_price.times(self.qty_open)
    }

    /// Maximum possible loss: the full entry cost including the entry fee.
    #[must_use]
    pub fn max_loss(&self) -> Cents {
        self.entry_notional() + self.entry_fee
    }

    /// Realized P&L at a given exit price, net of both fees.
    #[must_use]
    pub fn pnl_at(&self, exit_price: Cents, exit_fee: Cents) -> Cents {
        let gross = (exit_price - self.entry_price).times(self.qty_open);
        gross - self.entry_fee - exit_fee
    }

    /// A push exits exactly at entry, losing only fees.
    #[must_use]
    pub fn is_push(&self) -> bool {
        self.exit
            .as_ref()
            .is_some_and(|e| e.exit_price == self.entry_price)
    }
}
