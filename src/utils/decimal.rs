//! Decimal helpers for prices, quantities and rates.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round to the nearest multiple of `tick_size`.
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round a quantity toward zero to a multiple of `lot_size`.
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return value;
    }
    (value / lot_size).trunc() * lot_size
}

/// Convert basis points to a decimal rate.
pub fn from_basis_points(bps: Decimal) -> Decimal {
    bps / dec!(10000)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Weighted average of `(value, weight)` pairs; zero when weights sum to zero.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.01)), dec!(50123.46));
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.5)), dec!(50123.5));
        assert_eq!(round_to_tick(dec!(50123.456), Decimal::ZERO), dec!(50123.456));
    }

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(0.0009), dec!(0.001)), Decimal::ZERO);
        assert_eq!(round_down_to_lot(dec!(-1.567), dec!(0.1)), dec!(-1.5));
    }

    #[test]
    fn test_from_basis_points() {
        assert_eq!(from_basis_points(dec!(5)), dec!(0.0005));
        assert_eq!(from_basis_points(dec!(50)), dec!(0.005));
    }

    #[test]
    fn test_weighted_average() {
        let entry = weighted_average(&[(dec!(100), dec!(0.3)), (dec!(110), dec!(0.1))]);
        assert_eq!(entry, dec!(102.5));
        assert_eq!(weighted_average(&[]), Decimal::ZERO);
    }
}
