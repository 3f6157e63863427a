//! Fixed-point decimal with 18 fractional digits.
//!
//! Delegation shares, validator share totals, community pool coins and
//! conversion constants all arrive as decimal strings such as
//! `"333.330000000000000000"`. They are held as an arbitrary-precision
//! integer count of 10^-18 units so every product and quotient is exact
//! until the final truncation to whole tokens.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of fractional digits.
pub const PRECISION: usize = 18;

/// Decimal parse error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid decimal {input:?}: {reason}")]
pub struct ParseDecError {
    input: String,
    reason: &'static str,
}

/// Non-negative fixed-point decimal.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dec(BigUint);

fn unit() -> BigUint {
    BigUint::from(10u32).pow(PRECISION as u32)
}

impl Dec {
    /// Build from a raw count of 10^-18 units.
    pub fn from_atomics(atomics: BigUint) -> Self {
        Self(atomics)
    }

    /// Whole-number decimal.
    pub fn from_u128(value: u128) -> Self {
        Self(BigUint::from(value) * unit())
    }

    /// Raw count of 10^-18 units.
    pub fn atomics(&self) -> &BigUint {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Integer part, truncated toward zero.
    ///
    /// Returns `None` if it does not fit in a u128.
    pub fn truncate(&self) -> Option<u128> {
        (&self.0 / unit()).to_u128()
    }

    /// `floor(self * numerator / denominator)`.
    ///
    /// This is the share-to-token exchange: `shares * stake / total_shares`.
    /// Returns `None` when the denominator is zero or the result overflows.
    pub fn mul_div_floor(&self, numerator: u128, denominator: &Dec) -> Option<u128> {
        if denominator.is_zero() {
            return None;
        }
        (&self.0 * BigUint::from(numerator) / &denominator.0).to_u128()
    }

    /// `floor(amount / self)`.
    ///
    /// Returns `None` when `self` is zero or the result overflows.
    pub fn divide_floor(&self, amount: u128) -> Option<u128> {
        if self.is_zero() {
            return None;
        }
        (BigUint::from(amount) * unit() / &self.0).to_u128()
    }
}

impl Dec {
    pub fn one() -> Self {
        Self(unit())
    }

    /// Smallest representable step, 10^-18.
    pub fn smallest() -> Self {
        Self(BigUint::from(1u32))
    }

    /// `self - other`, or `None` if the result would be negative.
    pub fn checked_sub(&self, other: &Dec) -> Option<Dec> {
        (self.0 >= other.0).then(|| Self(&self.0 - &other.0))
    }

    /// Product, truncated to 18 digits.
    pub fn mul_truncate(&self, other: &Dec) -> Dec {
        Self(&self.0 * &other.0 / unit())
    }

    /// Quotient, truncated to 18 digits. `None` when dividing by zero.
    pub fn quo_truncate(&self, other: &Dec) -> Option<Dec> {
        if other.is_zero() {
            return None;
        }
        Some(Self(&self.0 * unit() / &other.0))
    }

    /// Quotient rounded half-to-even at the 18th digit.
    ///
    /// Matches how staking computes a delegation's current stake from its
    /// shares. `None` when dividing by zero.
    pub fn quo_round(&self, other: &Dec) -> Option<Dec> {
        if other.is_zero() {
            return None;
        }
        let unit = unit();
        let scaled = &self.0 * &unit * &unit / &other.0;
        let quotient = &scaled / &unit;
        let remainder = &scaled % &unit;
        let half = &unit / 2u32;
        let round_up = match remainder.cmp(&half) {
            Ordering::Less => false,
            Ordering::Greater => true,
            Ordering::Equal => quotient.bit(0),
        };
        Some(Self(if round_up { quotient + 1u32 } else { quotient }))
    }

    pub fn mul_int(&self, value: u128) -> Dec {
        Self(&self.0 * BigUint::from(value))
    }

    /// Fractional part.
    pub fn fraction(&self) -> Dec {
        Self(&self.0 % unit())
    }
}

impl Add for &Dec {
    type Output = Dec;

    fn add(self, other: &Dec) -> Dec {
        Dec(&self.0 + &other.0)
    }
}

impl FromStr for Dec {
    type Err = ParseDecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseDecError {
            input: s.to_string(),
            reason,
        };
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() {
            return Err(err("missing integer part"));
        }
        if frac_part.len() > PRECISION {
            return Err(err("more than 18 fractional digits"));
        }
        if s.contains('.') && frac_part.is_empty() {
            return Err(err("missing fractional digits"));
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(err("not an unsigned decimal number"));
        }

        let digits = format!("{int_part}{frac_part:0<PRECISION$}");
        BigUint::parse_bytes(digits.as_bytes(), 10)
            .map(Self)
            .ok_or_else(|| err("not an unsigned decimal number"))
    }
}

impl fmt::Display for Dec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = unit();
        let int = &self.0 / &unit;
        let frac = &self.0 % &unit;
        write!(f, "{int}.{:0>width$}", frac.to_string(), width = PRECISION)
    }
}

impl Serialize for Dec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Dec {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(dec("333.33").to_string(), "333.330000000000000000");
        assert_eq!(dec("1000").to_string(), "1000.000000000000000000");
        assert_eq!(dec("0.000000000000000001").atomics(), &BigUint::from(1u32));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<Dec>().is_err());
        assert!("-1".parse::<Dec>().is_err());
        assert!("1.".parse::<Dec>().is_err());
        assert!(".5".parse::<Dec>().is_err());
        assert!("1e5".parse::<Dec>().is_err());
        assert!("0.0000000000000000001".parse::<Dec>().is_err());
    }

    // Critical: share exchange truncates, never rounds up
    #[test]
    fn test_tokens_from_shares_truncates() {
        let total = dec("1000.0");
        assert_eq!(dec("250.0").mul_div_floor(1000, &total), Some(250));
        assert_eq!(dec("333.33").mul_div_floor(1000, &total), Some(333));
        assert_eq!(dec("0.5").mul_div_floor(1, &dec("1")), Some(0));
        assert_eq!(dec("1").mul_div_floor(1, &Dec::default()), None);
    }

    #[test]
    fn test_divide_floor() {
        assert_eq!(dec("10").divide_floor(100), Some(10));
        assert_eq!(dec("3").divide_floor(100), Some(33));
        assert_eq!(dec("118.344").divide_floor(1_000_000), Some(8449));
        assert_eq!(Dec::default().divide_floor(100), None);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(dec("42.999999999999999999").truncate(), Some(42));
        assert_eq!(Dec::from_u128(7).truncate(), Some(7));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(&dec("1.5") + &dec("2.25"), dec("3.75"));
        assert_eq!(dec("3").checked_sub(&dec("1.25")), Some(dec("1.75")));
        assert_eq!(dec("1").checked_sub(&dec("1.000000000000000001")), None);
        assert_eq!(dec("2.5").mul_int(4), dec("10"));
        assert_eq!(dec("10.75").fraction(), dec("0.75"));
    }

    // Critical: truncating ops never hand out more than owed
    #[test]
    fn test_truncating_mul_and_quo() {
        assert_eq!(dec("0.000000000000000003").mul_truncate(&dec("0.5")), Dec::smallest());
        assert_eq!(dec("1").quo_truncate(&dec("3")), Some(dec("0.333333333333333333")));
        assert_eq!(dec("2").quo_truncate(&dec("3")), Some(dec("0.666666666666666666")));
        assert_eq!(dec("1").quo_truncate(&Dec::default()), None);
    }

    #[test]
    fn test_quo_round_half_even() {
        assert_eq!(dec("2").quo_round(&dec("3")), Some(dec("0.666666666666666667")));
        assert_eq!(dec("1").quo_round(&dec("3")), Some(dec("0.333333333333333333")));
        // exact halves round to the even neighbour
        assert_eq!(dec("0.000000000000000001").quo_round(&dec("2")), Some(Dec::default()));
        assert_eq!(dec("0.000000000000000003").quo_round(&dec("2")), Some(dec("0.000000000000000002")));
        assert_eq!(dec("1").quo_round(&Dec::default()), None);
    }

    #[test]
    fn test_serde_as_string() {
        let value = serde_json::to_value(dec("1.5")).unwrap();
        assert_eq!(value, serde_json::json!("1.500000000000000000"));
        let back: Dec = serde_json::from_value(value).unwrap();
        assert_eq!(back, dec("1.5"));
    }
}
