//! Money helpers shared by the fee rule and the payment gateway.
//!
//! Amounts are stored as decimals in major units (e.g. 150.50 NGN) and
//! converted to minor units (kobo, cents) only at the gateway boundary.
use bigdecimal::{BigDecimal, RoundingMode};
use num_traits::{ToPrimitive, Zero};

/// Round to two decimal places, half away from zero.
pub fn round2(amount: &BigDecimal) -> BigDecimal {
    amount.with_scale_round(2, RoundingMode::HalfUp)
}

/// Convert a major-unit amount to minor units (multiply by 100)
pub fn to_minor_units(amount: &BigDecimal) -> Result<i64, String> {
    if amount < &BigDecimal::zero() {
        return Err("Amount cannot be negative".to_string());
    }

    (amount * BigDecimal::from(100))
        .with_scale_round(0, RoundingMode::HalfUp)
        .to_i64()
        .ok_or_else(|| "Amount out of range".to_string())
}

/// `percent`% of `amount`, rounded to two decimal places.
pub fn percent_of(amount: &BigDecimal, percent: u8) -> BigDecimal {
    round2(&(amount * BigDecimal::from(percent) / BigDecimal::from(100)))
}

/// Basis points of `amount` (500 bps = 5%), rounded to two decimal places.
pub fn basis_points_of(amount: &BigDecimal, bps: u32) -> BigDecimal {
    round2(&(amount * BigDecimal::from(bps) / BigDecimal::from(10_000)))
}

/// Currency codes are three ASCII letters (ISO 4217).
pub fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())
}
