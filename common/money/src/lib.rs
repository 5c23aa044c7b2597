use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rounding mode applied when reducing a decimal amount to cents.
/// Selected once per process via the MONEY_ROUNDING env var
/// (half-up | bankers | truncate); half-up is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    HalfUp,
    Bankers,
    Truncate,
}

static ROUNDING_MODE: OnceLock<RoundingMode> = OnceLock::new();

pub fn init_rounding_mode_from_env() -> RoundingMode {
    *ROUNDING_MODE.get_or_init(|| {
        match std::env::var("MONEY_ROUNDING").ok().as_deref() {
            Some("bankers") => RoundingMode::Bankers,
            Some("truncate") => RoundingMode::Truncate,
            Some("half-up") | None => RoundingMode::HalfUp,
            Some(other) => {
                tracing::warn!(mode = %other, "Unknown MONEY_ROUNDING value; using half-up");
                RoundingMode::HalfUp
            }
        }
    })
}

pub fn log_rounding_mode_once() {
    let mode = init_rounding_mode_from_env();
    tracing::info!(?mode, "Money rounding mode initialised");
}

fn is_even_integer(value: &BigDecimal) -> bool {
    // value is integer-valued; halve, truncate, double and compare.
    let halved = (value / BigDecimal::from(2)).with_scale(0);
    halved * BigDecimal::from(2) == *value
}

fn round_to_cents(value: &BigDecimal, mode: RoundingMode) -> BigDecimal {
    let shifted = value * BigDecimal::from(100);
    let trunc = shifted.with_scale(0);
    let frac = (&shifted - &trunc).abs();
    let half = BigDecimal::from_str("0.5").expect("constant");
    let negative = shifted < BigDecimal::from(0);
    let step = if negative {
        BigDecimal::from(-1)
    } else {
        BigDecimal::from(1)
    };
    let cents = match mode {
        RoundingMode::Truncate => trunc,
        RoundingMode::HalfUp => {
            if frac >= half {
                trunc + step
            } else {
                trunc
            }
        }
        RoundingMode::Bankers => {
            if frac > half {
                trunc + step
            } else if frac == half && !is_even_integer(&trunc) {
                trunc + step
            } else {
                trunc
            }
        }
    };
    (cents / BigDecimal::from(100)).with_scale(2)
}

/// Normalize a monetary value to 2 decimal places using the process rounding mode.
pub fn normalize_scale(value: &BigDecimal) -> BigDecimal {
    round_to_cents(value, init_rounding_mode_from_env())
}

/// Compare two monetary values allowing a tolerance (in cents) after normalization.
pub fn nearly_equal(a: &BigDecimal, b: &BigDecimal, cents_tolerance: i64) -> bool {
    let diff = (normalize_scale(a) - normalize_scale(b)) * BigDecimal::from(100);
    diff.abs() <= BigDecimal::from(cents_tolerance)
}

#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("amount overflow")]
    Overflow,
    #[error("invalid money literal: {0}")]
    Parse(String),
}

/// Integer minor-unit amount (cents). All order/ticket arithmetic stays in
/// this representation; BigDecimal appears only at display/report edges.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_mul(self, factor: i64) -> Result<Money, MoneyError> {
        self.0
            .checked_mul(factor)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0).max(0))
    }

    /// Apply a basis-point fraction with half-up rounding:
    /// 1500 bps of $10.00 is exactly $1.50.
    pub fn apply_bps(self, bps: i64) -> Money {
        debug_assert!(self.0 >= 0 && bps >= 0);
        Money((self.0 * bps + 5_000) / 10_000)
    }

    /// Whole-percent convenience over apply_bps.
    pub fn percent(self, percent: i64) -> Money {
        self.apply_bps(percent * 100)
    }

    pub fn min(self, other: Money) -> Money {
        Money(self.0.min(other.0))
    }
}

impl From<Money> for BigDecimal {
    fn from(value: Money) -> Self {
        (BigDecimal::from(value.0) / BigDecimal::from(100)).with_scale(2)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let v = BigDecimal::from_str("12.3456").unwrap();
        assert_eq!(normalize_scale(&v).to_string(), "12.35");
    }

    #[test]
    fn test_normalize_half_up_midpoint() {
        let v = BigDecimal::from_str("2.675").unwrap();
        assert_eq!(round_to_cents(&v, RoundingMode::HalfUp).to_string(), "2.68");
        let v = BigDecimal::from_str("-2.675").unwrap();
        assert_eq!(
            round_to_cents(&v, RoundingMode::HalfUp).to_string(),
            "-2.68"
        );
    }

    #[test]
    fn test_bankers_tie_goes_even() {
        let v = BigDecimal::from_str("0.125").unwrap();
        assert_eq!(
            round_to_cents(&v, RoundingMode::Bankers).to_string(),
            "0.12"
        );
        let v = BigDecimal::from_str("0.135").unwrap();
        assert_eq!(
            round_to_cents(&v, RoundingMode::Bankers).to_string(),
            "0.14"
        );
    }

    #[test]
    fn test_nearly_equal() {
        let a = BigDecimal::from_str("10.001").unwrap();
        let b = BigDecimal::from_str("10.009").unwrap();
        assert!(nearly_equal(&a, &b, 1)); // 1 cent tolerance
    }

    #[test]
    fn test_apply_bps_half_up() {
        // 15% of $10.00 = $1.50 exact
        assert_eq!(Money::from_cents(1000).apply_bps(1500).cents(), 150);
        // 10% of $0.05 = 0.5 cents, rounds up to 1
        assert_eq!(Money::from_cents(5).apply_bps(1000).cents(), 1);
    }

    #[test]
    fn test_saturating_sub_clamps_at_zero() {
        let a = Money::from_cents(100);
        let b = Money::from_cents(250);
        assert_eq!(a.saturating_sub(b), Money::ZERO);
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(1995).to_string(), "19.95");
        assert_eq!(Money::from_cents(-5).to_string(), "-0.05");
    }
}
