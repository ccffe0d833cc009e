//! Execution requests and results.
//!
//! Every venue order is immediate-or-cancel. No result may carry a resting
//! or pending state; a venue answering otherwise is a protocol violation
//! handled by the execution engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::id::{EventId, MarketId, RequestId, SignalId};
use super::market::Venue;
use super::money::Cents;

/// Contract side being bought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::Yes => Self::No,
            Self::No => Self::Yes,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

/// Whether the order opens exposure (buy) or unwinds it (sell).
///
/// Signal-driven requests always buy; sells are issued by the engine to
/// offset unpaired arbitrage legs and by the position tracker to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Deterministic idempotency key.
///
/// Derived from `signal_id + side + venue` so a retry of the same logical
/// order collides with the original instead of placing twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    #[must_use]
    pub fn derive(signal_id: &SignalId, side: Side, venue: Venue) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(signal_id.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(side.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(venue.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Client order id truncated to the venue's allowed length.
    #[must_use]
    pub fn client_order_id(&self, max_len: usize) -> String {
        self.0.chars().take(max_len).collect()
    }
}

/// Order the signal processor asks the execution engine to place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: RequestId,
    pub signal_id: SignalId,
    pub idempotency_key: IdempotencyKey,
    pub venue: Venue,
    pub market_id: MarketId,
    pub event_id: EventId,
    pub side: Side,
    pub action: OrderAction,
    /// Contract units.
    pub quantity: i64,
    pub limit_price: Cents,
    /// Set on both legs of an arbitrage pair; references the other leg.
    pub paired_leg_request_id: Option<RequestId>,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl ExecutionRequest {
    #[must_use]
    pub const fn is_paired(&self) -> bool {
        self.paired_leg_request_id.is_some()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_utc
    }
}

/// Terminal order status. IOC semantics: there is no pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// At least one unit filled; the unfilled remainder was cancelled.
    Filled,
    /// Nothing filled.
    Cancelled,
    /// The venue refused the order.
    Rejected,
}

/// Outcome of one IOC placement, returned to the originating signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: RequestId,
    pub signal_id: SignalId,
    pub idempotency_key: IdempotencyKey,
    pub client_order_id: String,
    pub venue_order_id: Option<String>,
    pub venue: Venue,
    pub market_id: MarketId,
    pub event_id: EventId,
    pub side: Side,
    pub action: OrderAction,
    pub status: OrderStatus,
    pub requested_qty: i64,
    pub filled_qty: i64,
    pub avg_price: Cents,
    pub fees: Cents,
    pub reason: Option<String>,
    pub executed_utc: DateTime<Utc>,
}

impl ExecutionResult {
    #[must_use]
    pub const fn is_fill(&self) -> bool {
        matches!(self.status, OrderStatus::Filled) && self.filled_qty > 0
    }

    #[must_use]
    pub const fn is_full_fill(&self) -> bool {
        self.is_fill() && self.filled_qty == self.requested_qty
    }

    /// Notional paid for the filled units, excluding fees.
    #[must_use]
    pub const fn notional(&self) -> Cents {
        self.avg_price.times(self.filled_qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let a = IdempotencyKey::derive(&SignalId::from("s1"), Side::Yes, Venue::Direct);
        let b = IdempotencyKey::derive(&SignalId::from("s1"), Side::Yes, Venue::Direct);
        assert_eq!(a, b);
    }

    #[test]
    fn idempotency_key_differs_by_side_and_venue() {
        let base = IdempotencyKey::derive(&SignalId::from("s1"), Side::Yes, Venue::Direct);
        assert_ne!(
            base,
            IdempotencyKey::derive(&SignalId::from("s1"), Side::No, Venue::Direct)
        );
        assert_ne!(
            base,
            IdempotencyKey::derive(&SignalId::from("s1"), Side::Yes, Venue::Proxied)
        );
    }

    #[test]
    fn client_order_id_truncates() {
        let key = IdempotencyKey::derive(&SignalId::from("s1"), Side::Yes, Venue::Direct);
        assert_eq!(key.client_order_id(20).len(), 20);
        assert!(key.as_str().starts_with(&key.client_order_id(20)));
    }

    #[test]
    fn full_fill_detection() {
        let result = ExecutionResult {
            request_id: RequestId::from("r1"),
            signal_id: SignalId::from("s1"),
            idempotency_key: IdempotencyKey::derive(&SignalId::from("s1"), Side::Yes, Venue::Paper),
            client_order_id: "c1".into(),
            venue_order_id: Some("v1".into()),
            venue: Venue::Paper,
            market_id: MarketId::from("m1"),
            event_id: EventId::from("e1"),
            side: Side::Yes,
            action: OrderAction::Buy,
            status: OrderStatus::Filled,
            requested_qty: 100,
            filled_qty: 60,
            avg_price: Cents::new(72),
            fees: Cents::new(85),
            reason: None,
            executed_utc: Utc::now(),
        };
        assert!(result.is_fill());
        assert!(!result.is_full_fill());
        assert_eq!(result.notional(), Cents::new(4320));
    }
}
