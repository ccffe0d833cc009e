//! Trading signals and rejection reasons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{EventId, SignalId};
use super::market::Venue;
use super::money::{Price, Volume};

/// Trade direction on the YES contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

/// What kind of mispricing produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    ModelEdgeYes,
    ModelEdgeNo,
    /// Buy YES on `venue_buy`, buy NO on `venue_sell`.
    ArbitrageYesNo,
    /// Mirror legs: buy NO on `venue_buy`, buy YES on `venue_sell`.
    ArbitrageNoYes,
    WinProbShift,
}

impl SignalType {
    #[must_use]
    pub const fn is_arbitrage(&self) -> bool {
        matches!(self, Self::ArbitrageYesNo | Self::ArbitrageNoYes)
    }
}

/// Immutable after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: SignalId,
    pub event_id: EventId,
    pub entity: String,
    pub direction: Direction,
    pub signal_type: SignalType,
    pub model_p: f64,
    pub market_p: f64,
    /// Edge before fees, in probability units.
    pub raw_edge_pct: f64,
    /// Edge after entry + exit fees on the proposed venue(s).
    pub net_edge_pct: f64,
    /// Edge scaled into [0, 1]; used as a sizing damper.
    pub confidence: f64,
    pub venue_buy: Option<Venue>,
    pub venue_sell: Option<Venue>,
    pub buy_price: Price,
    pub sell_price: Option<Price>,
    /// Smaller top-of-book size across the legs, in units.
    pub liquidity_min: Volume,
    pub expires_utc: DateTime<Utc>,
    /// Set iff this is one leg of an arbitrage pair; references the other leg.
    pub paired_leg_id: Option<SignalId>,
    pub created_utc: DateTime<Utc>,
}

impl Signal {
    #[must_use]
    pub const fn is_arbitrage(&self) -> bool {
        self.signal_type.is_arbitrage()
    }

    /// Expiry check with strict inequality: a signal exactly at its
    /// `expires_utc` is rejected.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_utc
    }

    /// Confidence from edge: 20 percentage points of edge saturate at 1.0.
    #[must_use]
    pub fn confidence_from_edge(edge_pct: f64) -> f64 {
        (edge_pct.abs() / 0.20).min(1.0)
    }
}

/// Why the signal processor refused a signal. Business data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ThinEdge,
    StalePrice,
    Expired,
    ProbabilityOutOfBounds,
    InsufficientBankroll,
    DailyLossLimit,
    EventExposureLimit,
    CategoryExposureLimit,
    TooManyOpenPositions,
    Cooldown,
    Duplicate,
    DrawdownPause,
    KillSwitch,
    EventSuspended,
    ZeroSize,
    UnpairedLeg,
    NoMarketBinding,
}

impl RejectReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ThinEdge => "thin_edge",
            Self::StalePrice => "stale_price",
            Self::Expired => "expired",
            Self::ProbabilityOutOfBounds => "probability_out_of_bounds",
            Self::InsufficientBankroll => "insufficient_bankroll",
            Self::DailyLossLimit => "daily_loss_limit",
            Self::EventExposureLimit => "event_exposure_limit",
            Self::CategoryExposureLimit => "category_exposure_limit",
            Self::TooManyOpenPositions => "too_many_open_positions",
            Self::Cooldown => "cooldown",
            Self::Duplicate => "duplicate",
            Self::DrawdownPause => "drawdown_pause",
            Self::KillSwitch => "kill_switch",
            Self::EventSuspended => "event_suspended",
            Self::ZeroSize => "zero_size",
            Self::UnpairedLeg => "unpaired_leg",
            Self::NoMarketBinding => "no_market_binding",
        }
    }
}

/// Rejection record published to the observability channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSignal {
    pub signal: Signal,
    pub reason: RejectReason,
    pub rejected_utc: DateTime<Utc>,
}
