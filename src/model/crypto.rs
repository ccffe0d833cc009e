//! Probability model for crypto strike/expiry markets.
//!
//! Uses the risk-neutral probability that spot finishes beyond the strike:
//! `Φ(d2)` with the annualised realised volatility supplied by the data
//! provider (computed from hourly log-returns).

use statrs::distribution::{ContinuousCDF, Normal};

use super::ProbabilityModel;
use crate::domain::{
    CryptoState, Event, EventState, MarketType, ModelOutput, Probability, StateData, UpOrDown,
};

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;

pub struct CryptoModel {
    normal: Normal,
}

impl CryptoModel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            normal: Normal::new(0.0, 1.0).expect("unit normal"),
        }
    }

    fn evaluate(&self, state: &CryptoState, strike: f64, direction: UpOrDown) -> Option<f64> {
        if !(state.spot.is_finite() && strike.is_finite()) || state.spot <= 0.0 || strike <= 0.0 {
            return None;
        }

        // Expired: the outcome is determined by spot vs strike.
        if state.seconds_to_expiry <= 0 {
            let above = state.spot >= strike;
            let p_up = if above { 1.0 } else { 0.0 };
            return Some(match direction {
                UpOrDown::Up => p_up,
                UpOrDown::Down => 1.0 - p_up,
            });
        }

        if !(state.realized_vol.is_finite()) || state.realized_vol <= 0.0 {
            return None;
        }

        let tau = state.seconds_to_expiry as f64 / SECONDS_PER_YEAR;
        let sigma_sqrt_tau = state.realized_vol * tau.sqrt();
        let d2 =
            ((state.spot / strike).ln() - 0.5 * state.realized_vol.powi(2) * tau) / sigma_sqrt_tau;

        let p_up = self.normal.cdf(d2);
        Some(match direction {
            UpOrDown::Up => p_up,
            UpOrDown::Down => 1.0 - p_up,
        })
    }
}

impl Default for CryptoModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbabilityModel for CryptoModel {
    fn probability(&self, event: &Event, state: &EventState) -> ModelOutput {
        let MarketType::Crypto {
            strike, direction, ..
        } = &event.market_type
        else {
            return ModelOutput::Unknown;
        };
        let StateData::Crypto(ref crypto) = state.data else {
            return ModelOutput::Unknown;
        };

        // Up/down markets without an explicit strike settle against the
        // reference price recorded at market open.
        let strike = strike
            .and_then(|s| rust_decimal::prelude::ToPrimitive::to_f64(&s))
            .unwrap_or(crypto.reference);

        match self.evaluate(crypto, strike, *direction) {
            Some(p) => ModelOutput::Known(Probability::new(
                event.event_id.clone(),
                event.entity_a.clone(),
                p,
            )),
            None => ModelOutput::Unknown,
        }
    }
}

/// Annualised realised volatility from a window of hourly log-returns.
///
/// Providers call this with their rolling return buffer; fewer than two
/// samples yields `None`.
#[must_use]
pub fn annualized_hourly_vol(hourly_log_returns: &[f64]) -> Option<f64> {
    if hourly_log_returns.len() < 2 {
        return None;
    }
    let n = hourly_log_returns.len() as f64;
    let mean = hourly_log_returns.iter().sum::<f64>() / n;
    let variance = hourly_log_returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    // Hourly variance scaled to a year of hours.
    Some((variance * 24.0 * 365.25).sqrt())
}
