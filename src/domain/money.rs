//! Monetary types.
//!
//! Contract prices on the venue wire and all bankroll arithmetic use
//! fixed-point integer hundredths ([`Cents`]). Probabilities and normalized
//! prices in [0, 1] use [`Decimal`]. Floating point is acceptable for model
//! probabilities, never for order pricing or money.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalized price in [0, 1], exact decimal.
pub type Price = Decimal;

/// Contract volume in units.
pub type Volume = Decimal;

/// Fixed-point money: integer hundredths of a dollar.
///
/// A binary contract price is a value in 1..=99 cents; bankroll balances are
/// unbounded. Arithmetic is plain integer arithmetic; division only appears
/// in fee schedules where the rounding mode is explicit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cents(i64);

impl Cents {
    pub const ZERO: Self = Self(0);

    /// One full contract payout ($1.00).
    pub const PAYOUT: Self = Self(100);

    /// Create from a raw cent count.
    #[must_use]
    pub const fn new(cents: i64) -> Self {
        Self(cents)
    }

    /// Create from whole dollars.
    #[must_use]
    pub const fn from_dollars(dollars: i64) -> Self {
        Self(dollars * 100)
    }

    /// Convert a normalized price in [0, 1] to cents, if it lands exactly
    /// on a cent boundary after rounding to two decimal places.
    #[must_use]
    pub fn from_price(price: Price) -> Option<Self> {
        let scaled = (price * Decimal::ONE_HUNDRED).round();
        scaled.to_i64().map(Self)
    }

    /// Raw cent count.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Normalized price representation (`self / 100`).
    #[must_use]
    pub fn as_price(&self) -> Price {
        Decimal::from(self.0) / Decimal::ONE_HUNDRED
    }

    /// Decimal dollars, for logging and analytics.
    #[must_use]
    pub fn as_dollars(&self) -> Decimal {
        Decimal::new(self.0, 2)
    }

    /// Multiply by a unit quantity.
    #[must_use]
    pub const fn times(&self, qty: i64) -> Self {
        Self(self.0 * qty)
    }

    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    /// Saturating subtraction floored at zero.
    #[must_use]
    pub const fn saturating_sub_zero(self, other: Self) -> Self {
        let v = self.0 - other.0;
        Self(if v < 0 { 0 } else { v })
    }
}

impl Add for Cents {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Cents {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for Cents {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Cents {
    type Output = Self;
    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl Mul<i64> for Cents {
    type Output = Self;
    fn mul(self, rhs: i64) -> Self {
        Self(self.0 * rhs)
    }
}

impl Sum for Cents {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{sign}${}.{:02}", abs / 100, abs % 100)
    }
}
