//! Fractional Kelly position sizing.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::Cents;

/// Raw Kelly fraction for a binary contract bought at `price` with win
/// probability `p`. Zero when there is no positive expectation.
#[must_use]
pub fn kelly_fraction(p: f64, price: f64) -> f64 {
    if !(0.0..=1.0).contains(&p) || price <= 0.0 || price >= 1.0 {
        return 0.0;
    }
    let q = 1.0 - p;
    // Net odds received on the stake: win pays (1 - price) per price risked.
    let b = (1.0 / price) - 1.0;
    if b <= 0.0 {
        return 0.0;
    }
    ((p * b - q) / b).max(0.0)
}

/// Inputs for sizing one entry.
#[derive(Debug, Clone)]
pub struct SizingInputs {
    pub model_p: f64,
    /// Executable per-unit price of the contract being bought.
    pub buy_price: Decimal,
    pub raw_edge_pct: f64,
    pub confidence: f64,
    /// Smaller top-of-book size across the legs, in units.
    pub liquidity_min: Decimal,
    /// Tradeable balance (piggy-bank already excluded) minus reserves.
    pub available: Cents,
    pub total_balance: Cents,
    /// Entry plus exit fee rate at the executable price.
    pub round_trip_fee_rate: f64,
}

/// Sizing knobs.
#[derive(Debug, Clone, Copy)]
pub struct SizingParams {
    pub kelly_fraction: f64,
    /// Edges above this are suspicious and sized at half fraction.
    pub large_edge_pp: f64,
    pub max_position_pct: f64,
}

/// Units to buy, floored to whole contracts. Zero means "do not trade".
#[must_use]
pub fn size_entry(inputs: &SizingInputs, params: &SizingParams) -> i64 {
    let price = inputs.buy_price.to_f64().unwrap_or(0.0);
    if price <= 0.0 {
        return 0;
    }

    let kelly = kelly_fraction(inputs.model_p, price);
    if kelly <= 0.0 {
        return 0;
    }

    // Suspiciously large edges are usually stale books or bad state.
    let fraction = if inputs.raw_edge_pct.abs() > params.large_edge_pp {
        params.kelly_fraction * 0.5
    } else {
        params.kelly_fraction
    };
    let damped = kelly * fraction * inputs.confidence.clamp(0.0, 1.0);

    let available = inputs.available.value() as f64;
    // Reserve the fee budget so the entry plus its round trip stays payable.
    let max_notional = available / (1.0 + inputs.round_trip_fee_rate);

    let kelly_notional = available * damped;
    let cap_notional = inputs.total_balance.value() as f64 * params.max_position_pct;

    let notional = kelly_notional.min(cap_notional).min(max_notional);
    if notional <= 0.0 {
        return 0;
    }

    let price_cents = price * 100.0;
    let qty = (notional / price_cents).floor() as i64;
    let liquidity = inputs.liquidity_min.to_f64().unwrap_or(0.0).floor() as i64;
    qty.min(liquidity).max(0)
}
