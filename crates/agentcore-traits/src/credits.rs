//! Fixed-point credit amounts.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Signed USD amount stored as whole nano-dollars.
///
/// Integer storage keeps `balance == sum(entries)` exact.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Credits(i64);

impl Credits {
    pub const ZERO: Credits = Credits(0);
    pub const NANOS_PER_DOLLAR: i64 = 1_000_000_000;

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn nanos(self) -> i64 {
        self.0
    }

    pub fn from_dollars(dollars: f64) -> Self {
        Self((dollars * Self::NANOS_PER_DOLLAR as f64).round() as i64)
    }

    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / Self::NANOS_PER_DOLLAR as f64
    }

    /// Cost of `tokens` at `rate_per_1m` dollars per million tokens.
    pub fn for_tokens(tokens: u64, rate_per_1m: f64) -> Self {
        // dollars/1M tokens == 1000 nano-dollars per token
        Self((tokens as f64 * rate_per_1m * 1_000.0).round() as i64)
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }
}

impl Add for Credits {
    type Output = Credits;

    fn add(self, rhs: Credits) -> Credits {
        Credits(self.0 + rhs.0)
    }
}

impl AddAssign for Credits {
    fn add_assign(&mut self, rhs: Credits) {
        self.0 += rhs.0;
    }
}

impl Sub for Credits {
    type Output = Credits;

    fn sub(self, rhs: Credits) -> Credits {
        Credits(self.0 - rhs.0)
    }
}

impl Neg for Credits {
    type Output = Credits;

    fn neg(self) -> Credits {
        Credits(-self.0)
    }
}

impl std::iter::Sum for Credits {
    fn sum<I: Iterator<Item = Credits>>(iter: I) -> Credits {
        iter.fold(Credits::ZERO, |acc, c| acc + c)
    }
}

/// Renders dollars with at least two decimals and no trailing zeros beyond
/// that: `4.985`, `-0.05`, `5.00`.
impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let whole = magnitude / Self::NANOS_PER_DOLLAR as u64;
        let frac = magnitude % Self::NANOS_PER_DOLLAR as u64;

        let mut digits = format!("{:09}", frac);
        while digits.len() > 2 && digits.ends_with('0') {
            digits.pop();
        }
        write!(f, "{}{}.{}", sign, whole, digits)
    }
}

impl FromStr for Credits {
    type Err = String;

    /// Parses a decimal dollar amount such as `5`, `-0.15` or `$4.985`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('$');
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = body.split_once('.').unwrap_or((body, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(format!("invalid amount: {}", s));
        }
        if frac.len() > 9 {
            return Err(format!("too many decimal places: {}", s));
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| format!("invalid amount: {}", s))?
        };
        let frac_nanos: i64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<9}", frac)
                .parse()
                .map_err(|_| format!("invalid amount: {}", s))?
        };
        let nanos = whole
            .checked_mul(Self::NANOS_PER_DOLLAR)
            .and_then(|n| n.checked_add(frac_nanos))
            .ok_or_else(|| format!("amount out of range: {}", s))?;
        Ok(Credits(if negative { -nanos } else { nanos }))
    }
}
