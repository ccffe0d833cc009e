//! Probability engine.
//!
//! Pure, deterministic, side-effect-free. Models are registered by
//! [`MarketKind`] discriminant; lookup is constant-time. Adding a market
//! type means implementing [`ProbabilityModel`] and registering it.

mod crypto;
mod sport;

pub use crypto::{annualized_hourly_vol, CryptoModel};
pub use sport::{SportModel, SportParams};

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{Event, EventState, MarketKind, ModelOutput, Probability};

/// A win-probability model for one market kind.
///
/// Implementations must never panic on input: malformed state returns
/// [`ModelOutput::Unknown`], which disables signal generation for the tick.
pub trait ProbabilityModel: Send + Sync {
    /// Probability that `event.entity_a` wins (or the YES outcome resolves),
    /// before any pregame blending.
    fn probability(&self, event: &Event, state: &EventState) -> ModelOutput;
}

/// Pregame blend weight: 0.5 at scheduled start, decaying linearly to zero
/// by 25% of the event elapsed.
#[must_use]
pub fn pregame_blend_weight(elapsed_fraction: f64) -> f64 {
    const FULL_WEIGHT: f64 = 0.5;
    const DECAY_END: f64 = 0.25;
    if elapsed_fraction <= 0.0 {
        return FULL_WEIGHT;
    }
    if elapsed_fraction >= DECAY_END {
        return 0.0;
    }
    FULL_WEIGHT * (1.0 - elapsed_fraction / DECAY_END)
}

/// Registry of probability models keyed by market-type discriminant.
pub struct ModelRegistry {
    models: HashMap<MarketKind, Arc<dyn ProbabilityModel>>,
}

impl ModelRegistry {
    /// Registry with the built-in sport and crypto models.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            models: HashMap::new(),
        };
        registry.register(MarketKind::Sport, Arc::new(SportModel::with_defaults()));
        registry.register(MarketKind::Crypto, Arc::new(CryptoModel::new()));
        registry
    }

    pub fn register(&mut self, kind: MarketKind, model: Arc<dyn ProbabilityModel>) {
        self.models.insert(kind, model);
    }

    #[must_use]
    pub fn get(&self, kind: MarketKind) -> Option<&Arc<dyn ProbabilityModel>> {
        self.models.get(&kind)
    }

    /// Evaluate the model for an event, blending in the pregame prior when
    /// one is available and the event is early enough for it to matter.
    #[must_use]
    pub fn calculate(
        &self,
        event: &Event,
        state: &EventState,
        pregame_prior: Option<f64>,
    ) -> ModelOutput {
        let Some(model) = self.get(event.market_type.kind()) else {
            return ModelOutput::Unknown;
        };

        let ModelOutput::Known(live) = model.probability(event, state) else {
            return ModelOutput::Unknown;
        };

        let elapsed = event
            .market_type
            .sport()
            .and_then(|sport| state.elapsed_fraction(sport.regulation_seconds()));

        match (pregame_prior, elapsed) {
            (Some(prior), Some(elapsed)) => {
                let weight = pregame_blend_weight(elapsed);
                if weight <= 0.0 {
                    return ModelOutput::Known(live);
                }
                let blended = weight * prior.clamp(0.0, 1.0) + (1.0 - weight) * live.p;
                let mut probability =
                    Probability::new(live.event_id.clone(), live.for_entity.clone(), blended);
                probability.used_pregame_blend = true;
                probability.blend_weight = weight;
                probability.p_without_blend = live.p;
                ModelOutput::Known(probability)
            }
            _ => ModelOutput::Known(live),
        }
    }
}
