//! Decimal helpers for amounts and lending rates.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Smallest amount the exchange accepts (8 decimal places).
pub const AMOUNT_STEP: Decimal = dec!(0.00000001);

/// Round down to lot size (amount precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Daily rate as a percentage, for logs (0.0002 -> 0.02).
pub fn to_percent(rate: Decimal) -> Decimal {
    (rate * dec!(100)).normalize()
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Clamp a rate into `[min, max]`.
pub fn clamp_rate(rate: Decimal, min: Decimal, max: Decimal) -> Decimal {
    rate.max(min).min(max)
}
