//! Live event state and plays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{EventId, PlayId};

/// Resolution status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Scheduled,
    Live,
    Final,
}

/// Which entity currently has the ball/puck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Possession {
    EntityA,
    EntityB,
}

/// Football-specific field situation, used by the possession value lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSituation {
    /// Yards from the opponent end zone, 1..=99.
    pub yard_line: u8,
    pub down: u8,
    /// Yards to go for a first down.
    pub distance: u8,
}

/// Live sport snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SportState {
    pub score_a: u32,
    pub score_b: u32,
    pub period: u8,
    pub seconds_remaining: u32,
    pub possession: Option<Possession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub situation: Option<FieldSituation>,
}

/// Live crypto snapshot for a strike/expiry market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoState {
    /// Current spot price of the underlying asset.
    pub spot: f64,
    /// Reference price at market open (for up/down markets without a strike).
    pub reference: f64,
    pub seconds_to_expiry: i64,
    /// Annualised realised volatility from hourly log-returns.
    pub realized_vol: f64,
}

/// Market-type-specific state payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StateData {
    Sport(SportState),
    Crypto(CryptoState),
}

/// Mutable per-event snapshot, replaced wholesale on every update.
///
/// `fetched_at` is monotonically non-decreasing per event; a state older
/// than the held one is dropped by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventState {
    pub event_id: EventId,
    pub status: ResolutionStatus,
    pub data: StateData,
    pub fetched_at: DateTime<Utc>,
    pub fetch_latency_ms: u32,
}

impl EventState {
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self.status, ResolutionStatus::Final)
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.status, ResolutionStatus::Live)
    }

    /// Fraction of the event elapsed, in [0, 1]. `None` when not derivable.
    #[must_use]
    pub fn elapsed_fraction(&self, regulation_seconds: u32) -> Option<f64> {
        match &self.data {
            StateData::Sport(s) => {
                if regulation_seconds == 0 {
                    return None;
                }
                let total = f64::from(regulation_seconds);
                let remaining = f64::from(s.seconds_remaining).min(total);
                Some(((total - remaining) / total).clamp(0.0, 1.0))
            }
            StateData::Crypto(_) => None,
        }
    }
}

/// Kind of discrete play within a live game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayKind {
    Score { points: u8 },
    Turnover,
    PeriodEnd,
    Other,
}

/// Discrete event within a live game, append-only, idempotent by `play_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Play {
    pub play_id: PlayId,
    pub event_id: EventId,
    pub kind: PlayKind,
    pub time_utc: DateTime<Utc>,
}

impl Play {
    /// Scoring and turnover plays force downstream re-evaluation even when
    /// the probability delta is below the trigger threshold.
    #[must_use]
    pub const fn is_significant(&self) -> bool {
        matches!(self.kind, PlayKind::Score { .. } | PlayKind::Turnover)
    }
}
