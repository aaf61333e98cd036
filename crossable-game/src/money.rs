//! Exact money and multiplier representations.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::MULTIPLIER_SCALE;
use crate::numbers::{apply_basis_points, i64_to_f64, ratio_to_basis_points};

/// Amount in cents to avoid floating-point issues.
pub type Cents = i64;

/// Payout multiplier stored in basis points (10_000 = x1.00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(i64);

impl Multiplier {
    /// The neutral x1.00 multiplier.
    pub const ONE: Self = Self(MULTIPLIER_SCALE);

    #[must_use]
    pub const fn from_basis_points(points: i64) -> Self {
        Self(points)
    }

    /// Build from a decimal ratio such as `1.09`.
    #[must_use]
    pub fn from_ratio(ratio: f64) -> Self {
        Self(ratio_to_basis_points(ratio))
    }

    #[must_use]
    pub const fn basis_points(self) -> i64 {
        self.0
    }

    /// Decimal view for display and reports.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        i64_to_f64(self.0) / i64_to_f64(MULTIPLIER_SCALE)
    }

    #[must_use]
    pub const fn saturating_add(self, delta: Self) -> Self {
        Self(self.0.saturating_add(delta.0))
    }

    /// Apply the multiplier to a stake, rounding to the nearest cent.
    #[must_use]
    pub fn apply(self, stake: Cents) -> Cents {
        apply_basis_points(stake, self.0)
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{:.2}", self.as_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_applies_exactly() {
        let m = Multiplier::from_ratio(1.62);
        assert_eq!(m.basis_points(), 16_200);
        assert_eq!(m.apply(1_000), 1_620);
        assert_eq!(m.to_string(), "x1.62");
    }

    #[test]
    fn default_is_neutral() {
        assert_eq!(Multiplier::default(), Multiplier::ONE);
        assert_eq!(Multiplier::ONE.apply(4_321), 4_321);
    }
}
