//! Venues, market types, and event identity.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::id::EventId;

/// Trading venue.
///
/// `Direct` is reached natively and charges an integer-cent fee schedule.
/// `Proxied` sits behind a geographic proxy and charges a percentage fee.
/// `Paper` simulates fills locally while still attributing real fees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Direct,
    Proxied,
    Paper,
}

impl Venue {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Proxied => "proxied",
            Self::Paper => "paper",
        }
    }

    /// Deterministic tie-break rank: lower wins (Direct beats Proxied).
    #[must_use]
    pub const fn tie_break_rank(&self) -> u8 {
        match self {
            Self::Direct => 0,
            Self::Proxied => 1,
            Self::Paper => 2,
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sports with live win-probability models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sport {
    Nba,
    Ncaab,
    Nfl,
    Ncaaf,
    Nhl,
    Mlb,
}

impl Sport {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nba => "NBA",
            Self::Ncaab => "NCAAB",
            Self::Nfl => "NFL",
            Self::Ncaaf => "NCAAF",
            Self::Nhl => "NHL",
            Self::Mlb => "MLB",
        }
    }

    /// Regulation game length in seconds.
    #[must_use]
    pub const fn regulation_seconds(&self) -> u32 {
        match self {
            Self::Nba => 48 * 60,
            Self::Ncaab => 40 * 60,
            Self::Nfl | Self::Ncaaf => 60 * 60,
            Self::Nhl => 60 * 60,
            // Baseball has no clock; innings are mapped onto a nominal span.
            Self::Mlb => 9 * 60 * 60 / 3,
        }
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a crypto strike market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpOrDown {
    Up,
    Down,
}

/// Market type discriminant used for probability-model registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Sport,
    Crypto,
}

/// What kind of real-world outcome a market is bound to.
///
/// Adding a market type means implementing a probability model and an entity
/// matcher and registering them; nothing downstream changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarketType {
    Sport {
        sport: Sport,
        league: String,
    },
    Crypto {
        asset: String,
        strike: Option<Decimal>,
        expiry_utc: DateTime<Utc>,
        direction: UpOrDown,
    },
}

impl MarketType {
    /// Discriminant for constant-time model registry lookup.
    #[must_use]
    pub const fn kind(&self) -> MarketKind {
        match self {
            Self::Sport { .. } => MarketKind::Sport,
            Self::Crypto { .. } => MarketKind::Crypto,
        }
    }

    #[must_use]
    pub const fn sport(&self) -> Option<Sport> {
        match self {
            Self::Sport { sport, .. } => Some(*sport),
            Self::Crypto { .. } => None,
        }
    }
}

/// Immutable identity of a tradeable outcome.
///
/// Entities are team names for sports, asset symbols for crypto.
/// `entity_b` is absent for single-entity markets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub market_type: MarketType,
    pub entity_a: String,
    pub entity_b: Option<String>,
    pub scheduled_start_utc: DateTime<Utc>,
}

impl Event {
    /// Entities participating in this event.
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.entity_a.as_str()).chain(self.entity_b.as_deref())
    }

    /// True if `name` matches one of this event's entities, case-insensitive.
    #[must_use]
    pub fn has_entity(&self, name: &str) -> bool {
        self.entities().any(|e| e.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> Event {
        Event {
            event_id: EventId::from("nba-LAL-BOS"),
            market_type: MarketType::Sport {
                sport: Sport::Nba,
                league: "NBA".into(),
            },
            entity_a: "Lakers".into(),
            entity_b: Some("Celtics".into()),
            scheduled_start_utc: Utc.with_ymd_and_hms(2026, 1, 15, 0, 30, 0).unwrap(),
        }
    }

    #[test]
    fn kind_discriminant() {
        assert_eq!(sample_event().market_type.kind(), MarketKind::Sport);
    }

    #[test]
    fn entity_matching_is_case_insensitive() {
        let event = sample_event();
        assert!(event.has_entity("lakers"));
        assert!(event.has_entity("CELTICS"));
        assert!(!event.has_entity("Warriors"));
    }

    #[test]
    fn venue_tie_break_prefers_direct() {
        assert!(Venue::Direct.tie_break_rank() < Venue::Proxied.tie_break_rank());
    }
}
