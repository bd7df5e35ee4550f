//! Decimal helpers for prices, sizes and scores.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round to the nearest tick.
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round down to a tick (bids never improve by rounding).
pub fn floor_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).floor() * tick_size
}

/// Round up to a tick (asks never improve by rounding).
pub fn ceil_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).ceil() * tick_size
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Signed change from `from` to `to` in percent.
pub fn pct_change(from: Decimal, to: Decimal) -> Decimal {
    if from == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (to - from) / from * dec!(100)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Calculate weighted average.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

/// Convert a [0, 1] score into a decimal with six places.
pub fn from_score(score: f64) -> Decimal {
    if !score.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::from_f64_retain(score.clamp(0.0, 1.0))
        .map(|d| d.round_dp(6))
        .unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_rounding() {
        assert_eq!(round_to_tick(dec!(0.5234), dec!(0.01)), dec!(0.52));
        assert_eq!(floor_to_tick(dec!(0.5289), dec!(0.01)), dec!(0.52));
        assert_eq!(ceil_to_tick(dec!(0.5211), dec!(0.01)), dec!(0.53));
        assert_eq!(ceil_to_tick(dec!(0.52), dec!(0.01)), dec!(0.52));
    }

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
    }

    #[test]
    fn test_pct_change() {
        assert_eq!(pct_change(dec!(0.50), dec!(0.51)), dec!(2));
        assert_eq!(pct_change(dec!(0.50), dec!(0.49)), dec!(-2));
        assert_eq!(pct_change(Decimal::ZERO, dec!(1)), Decimal::ZERO);
    }

    #[test]
    fn test_weighted_average() {
        let values = vec![(dec!(0.50), dec!(30)), (dec!(0.60), dec!(10))];
        assert_eq!(weighted_average(&values), dec!(0.525));
    }

    #[test]
    fn test_from_score() {
        assert_eq!(from_score(0.4), dec!(0.4));
        assert_eq!(from_score(7.0), Decimal::ONE);
        assert_eq!(from_score(f64::NAN), Decimal::ZERO);
    }
}
