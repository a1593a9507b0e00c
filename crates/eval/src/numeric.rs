//! Fixed-point decimal model.
//!
//! All arithmetic uses `rust_decimal::Decimal`; no `f64` anywhere on the
//! evaluation path. Intermediate results are carried at full precision and
//! rounded exactly once, when a step output is produced, under the run's
//! [`PrecisionMode`].

use std::cmp::Ordering;
use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::types::EvalError;

/// Largest scale `Decimal` can carry.
pub const MAX_SCALE: u32 = 28;

// ──────────────────────────────────────────────
// Precision modes
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    /// Midpoint to the even neighbour (banker's rounding).
    HalfEven,
    /// Midpoint away from zero.
    HalfUp,
    /// Toward zero.
    Down,
    /// Away from zero.
    Up,
}

impl Rounding {
    pub fn as_str(self) -> &'static str {
        match self {
            Rounding::HalfEven => "half_even",
            Rounding::HalfUp => "half_up",
            Rounding::Down => "down",
            Rounding::Up => "up",
        }
    }

    fn strategy(self) -> RoundingStrategy {
        match self {
            Rounding::HalfEven => RoundingStrategy::MidpointNearestEven,
            Rounding::HalfUp => RoundingStrategy::MidpointAwayFromZero,
            Rounding::Down => RoundingStrategy::ToZero,
            Rounding::Up => RoundingStrategy::AwayFromZero,
        }
    }
}

impl fmt::Display for Rounding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Rounding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "half_even" => Ok(Rounding::HalfEven),
            "half_up" => Ok(Rounding::HalfUp),
            "down" => Ok(Rounding::Down),
            "up" => Ok(Rounding::Up),
            other => Err(format!("unknown rounding rule '{}'", other)),
        }
    }
}

/// Named scale and rounding rule applied at step-output boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrecisionMode {
    pub name: String,
    pub scale: u32,
    pub rounding: Rounding,
}

impl PrecisionMode {
    pub fn new(name: impl Into<String>, scale: u32, rounding: Rounding) -> Result<Self, String> {
        let name = name.into();
        if scale > MAX_SCALE {
            return Err(format!(
                "precision mode '{}': scale {} exceeds maximum {}",
                name, scale, MAX_SCALE
            ));
        }
        Ok(PrecisionMode {
            name,
            scale,
            rounding,
        })
    }

    pub fn standard() -> Self {
        Self::builtin_unchecked("standard", 2, Rounding::HalfEven)
    }

    pub fn high() -> Self {
        Self::builtin_unchecked("high", 6, Rounding::HalfEven)
    }

    pub fn currency_half_up() -> Self {
        Self::builtin_unchecked("currency_half_up", 2, Rounding::HalfUp)
    }

    pub fn truncate() -> Self {
        Self::builtin_unchecked("truncate", 2, Rounding::Down)
    }

    fn builtin_unchecked(name: &str, scale: u32, rounding: Rounding) -> Self {
        PrecisionMode {
            name: name.to_string(),
            scale,
            rounding,
        }
    }

    pub fn builtins() -> Vec<PrecisionMode> {
        vec![
            Self::standard(),
            Self::high(),
            Self::currency_half_up(),
            Self::truncate(),
        ]
    }

    pub fn builtin(name: &str) -> Option<PrecisionMode> {
        Self::builtins().into_iter().find(|m| m.name == name)
    }

    /// Round to this mode's scale and pad to exactly `scale` fractional
    /// digits. Negative zero comes out as zero.
    ///
    /// Fails when the integer part leaves no room for `scale` fractional
    /// digits in 96 bits.
    pub fn round(&self, d: Decimal) -> Result<Decimal, EvalError> {
        let mut r = d.round_dp_with_strategy(self.scale, self.rounding.strategy());
        r.rescale(self.scale);
        if r.scale() != self.scale {
            return Err(EvalError::Overflow {
                message: format!(
                    "{} cannot carry {} fractional digits in precision mode '{}'",
                    d, self.scale, self.name
                ),
            });
        }
        if r.is_zero() {
            r.set_sign_positive(true);
        }
        Ok(r)
    }

    /// Canonical decimal text: fixed scale, `.` separator, no exponent.
    pub fn format(&self, d: Decimal) -> Result<String, EvalError> {
        self.round(d).map(|r| r.to_string())
    }

    /// Smallest representable step at this scale (`10^-scale`).
    pub fn unit(&self) -> Decimal {
        Decimal::new(1, self.scale)
    }
}

impl Default for PrecisionMode {
    fn default() -> Self {
        Self::standard()
    }
}

// ──────────────────────────────────────────────
// Checked arithmetic
// ──────────────────────────────────────────────

fn overflow(op: &str) -> EvalError {
    EvalError::Overflow {
        message: format!("{} overflow", op),
    }
}

pub fn add(left: Decimal, right: Decimal) -> Result<Decimal, EvalError> {
    left.checked_add(right).ok_or_else(|| overflow("addition"))
}

pub fn sub(left: Decimal, right: Decimal) -> Result<Decimal, EvalError> {
    left.checked_sub(right).ok_or_else(|| overflow("subtraction"))
}

pub fn mul(left: Decimal, right: Decimal) -> Result<Decimal, EvalError> {
    left.checked_mul(right).ok_or_else(|| overflow("multiplication"))
}

pub fn div(left: Decimal, right: Decimal) -> Result<Decimal, EvalError> {
    if right.is_zero() {
        return Err(EvalError::DivisionByZero);
    }
    left.checked_div(right).ok_or_else(|| overflow("division"))
}

/// Truncated remainder; the result takes the dividend's sign.
pub fn rem(left: Decimal, right: Decimal) -> Result<Decimal, EvalError> {
    if right.is_zero() {
        return Err(EvalError::DivisionByZero);
    }
    left.checked_rem(right).ok_or_else(|| overflow("remainder"))
}

/// Value comparison, ignoring scale (`1.0 == 1`).
pub fn compare(left: Decimal, right: Decimal) -> Ordering {
    left.cmp(&right)
}
