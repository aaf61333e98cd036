//! Numeric conversion helpers centralizing safe numeric casts.

use num_traits::cast::cast;

use crate::constants::{CENTS_PER_UNIT, MULTIPLIER_SCALE};

/// Round a f64 and clamp it to the i64 range, returning 0 for non-finite values.
#[must_use]
pub fn round_f64_to_i64(value: f64) -> i64 {
    if !value.is_finite() {
        return 0;
    }
    let min = cast::<i64, f64>(i64::MIN).unwrap_or(f64::MIN);
    let max = cast::<i64, f64>(i64::MAX).unwrap_or(f64::MAX);
    let clamped = value.clamp(min, max).round();
    cast::<f64, i64>(clamped).unwrap_or(0)
}

/// Convert i64 to f64 while allowing precision loss in a single location.
#[must_use]
pub fn i64_to_f64(value: i64) -> f64 {
    cast::<i64, f64>(value).unwrap_or(0.0)
}

/// Convert a decimal ratio (1.09) to basis points (10_900).
#[must_use]
pub fn ratio_to_basis_points(ratio: f64) -> i64 {
    round_f64_to_i64(ratio * i64_to_f64(MULTIPLIER_SCALE))
}

/// Convert a whole-unit amount (10.00) to cents (1_000).
#[must_use]
pub fn units_to_cents(units: f64) -> i64 {
    round_f64_to_i64(units * i64_to_f64(CENTS_PER_UNIT))
}

/// Convert cents back to whole units for display.
#[must_use]
pub fn cents_to_units(cents: i64) -> f64 {
    i64_to_f64(cents) / i64_to_f64(CENTS_PER_UNIT)
}

/// Scale a basis-point quantity by a float factor, rounding to the nearest point.
#[must_use]
pub fn scale_basis_points(points: i64, factor: f64) -> i64 {
    if !factor.is_finite() {
        return points;
    }
    round_f64_to_i64(i64_to_f64(points) * factor)
}

/// Apply a basis-point multiplier to a cent amount, rounding half away from zero.
#[must_use]
pub fn apply_basis_points(cents: i64, points: i64) -> i64 {
    let scale = i128::from(MULTIPLIER_SCALE);
    let product = i128::from(cents) * i128::from(points);
    let half = scale / 2;
    let rounded = if product >= 0 {
        (product + half) / scale
    } else {
        (product - half) / scale
    };
    i64::try_from(rounded).unwrap_or(if rounded > 0 { i64::MAX } else { i64::MIN })
}

/// Map a raw `u32` draw onto the open interval (0, 1).
#[must_use]
pub fn sample_ratio(sample: u32) -> f64 {
    let denom = f64::from(u32::MAX) + 1.0;
    ((f64::from(sample) + 0.5) / denom).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounders_handle_non_finite() {
        assert_eq!(round_f64_to_i64(f64::NAN), 0);
        assert_eq!(round_f64_to_i64(f64::INFINITY), 0);
        assert_eq!(round_f64_to_i64(1.5), 2);
    }

    #[test]
    fn ratio_and_cents_conversions_are_exact_for_table_values() {
        assert_eq!(ratio_to_basis_points(1.09), 10_900);
        assert_eq!(ratio_to_basis_points(0.15), 1_500);
        assert_eq!(units_to_cents(10.0), 1_000);
        assert_eq!(units_to_cents(0.29), 29);
        assert!((cents_to_units(10_620) - 106.2).abs() < 1e-9);
    }

    #[test]
    fn scaling_rounds_to_nearest_point() {
        assert_eq!(scale_basis_points(1_000, 1.2), 1_200);
        assert_eq!(scale_basis_points(1_500, 1.2), 1_800);
        assert_eq!(scale_basis_points(1_000, f64::NAN), 1_000);
    }

    #[test]
    fn apply_basis_points_rounds_half_away_from_zero() {
        assert_eq!(apply_basis_points(1_000, 16_200), 1_620);
        assert_eq!(apply_basis_points(1, 15_000), 2);
        assert_eq!(apply_basis_points(-1, 15_000), -2);
        assert_eq!(apply_basis_points(333, 10_900), 363);
    }

    #[test]
    fn sample_ratio_stays_inside_unit_interval() {
        assert!(sample_ratio(0) > 0.0);
        assert!(sample_ratio(u32::MAX) < 1.0);
    }
}
