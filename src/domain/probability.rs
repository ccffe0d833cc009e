//! Model probability output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::EventId;

/// Win probability for one entity of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probability {
    pub event_id: EventId,
    pub for_entity: String,
    /// Blended probability in [0, 1].
    pub p: f64,
    pub computed_utc: DateTime<Utc>,
    pub used_pregame_blend: bool,
    pub blend_weight: f64,
    /// Live-model probability before the pregame blend, kept for analytics.
    pub p_without_blend: f64,
}

impl Probability {
    #[must_use]
    pub fn new(event_id: EventId, for_entity: impl Into<String>, p: f64) -> Self {
        let p = p.clamp(0.0, 1.0);
        Self {
            event_id,
            for_entity: for_entity.into(),
            p,
            computed_utc: Utc::now(),
            used_pregame_blend: false,
            blend_weight: 0.0,
            p_without_blend: p,
        }
    }

    /// Absolute probability move versus an earlier computation.
    #[must_use]
    pub fn delta_from(&self, earlier: &Self) -> f64 {
        (self.p - earlier.p).abs()
    }
}

/// Model evaluation outcome.
///
/// `Unknown` is the sentinel for malformed or insufficient state; it
/// disables signal generation for the tick instead of panicking.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Known(Probability),
    Unknown,
}

impl ModelOutput {
    #[must_use]
    pub const fn as_known(&self) -> Option<&Probability> {
        match self {
            Self::Known(p) => Some(p),
            Self::Unknown => None,
        }
    }

    #[must_use]
    pub fn into_known(self) -> Option<Probability> {
        match self {
            Self::Known(p) => Some(p),
            Self::Unknown => None,
        }
    }
}
