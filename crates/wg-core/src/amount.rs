//! Arbitrary-precision monetary amounts.
//!
//! Amounts are non-negative integers in the smallest unit of an asset (wei,
//! lamports, token base units). They travel as decimal strings in rule payloads
//! and storage and are never narrowed to a fixed-width or floating-point type.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing an amount.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountParseError {
    /// The input string was empty.
    #[error("Amount is empty")]
    Empty,

    /// The input contained something other than ASCII digits.
    #[error("Amount '{0}' is not a non-negative decimal integer")]
    InvalidDigits(String),
}

/// A non-negative integer amount of unbounded size.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(BigUint);

impl Amount {
    /// Returns the zero amount.
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// Returns true if this amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Returns the underlying big integer.
    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// The boundary at and above which a token approval is treated as
    /// effectively unlimited: `(2^256 - 1) / 2`.
    pub fn unlimited_approval_threshold() -> Self {
        let max_u256 = (BigUint::one() << 256u32) - BigUint::one();
        Self(max_u256 / 2u32)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Self(BigUint::from(value))
    }
}

impl From<BigUint> for Amount {
    fn from(value: BigUint) -> Self {
        Self(value)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AmountParseError::Empty);
        }
        // BigUint's own parser tolerates '+' and '_'; amounts must be plain digits.
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountParseError::InvalidDigits(s.to_string()));
        }
        BigUint::parse_bytes(s.as_bytes(), 10)
            .map(Self)
            .ok_or_else(|| AmountParseError::InvalidDigits(s.to_string()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Amount> for Amount {
    type Output = Amount;

    fn add(self, rhs: &'a Amount) -> Amount {
        Amount(self.0 + &rhs.0)
    }
}

impl AddAssign<&Amount> for Amount {
    fn add_assign(&mut self, rhs: &Amount) {
        self.0 += &rhs.0;
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, a| acc + a)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, a| acc + a)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl<'de> de::Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal-string encoded non-negative integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse().map_err(E::custom)
            }

            // YAML configs may leave small amounts unquoted.
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Ok(Amount::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                u64::try_from(v)
                    .map(Amount::from)
                    .map_err(|_| E::custom(format!("amount must be non-negative, got {}", v)))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_digits() {
        let amount: Amount = "500000000".parse().unwrap();
        assert_eq!(amount, Amount::from(500_000_000u64));
        assert_eq!(amount.to_string(), "500000000");
    }

    #[test]
    fn test_parse_rejects_non_canonical_input() {
        for input in ["-1", "+1", " 1", "1 ", "1.5", "1_000", "0x10", "1e9"] {
            assert!(
                matches!(input.parse::<Amount>(), Err(AmountParseError::InvalidDigits(_))),
                "expected rejection for {:?}",
                input
            );
        }
        assert_eq!("".parse::<Amount>(), Err(AmountParseError::Empty));
    }

    #[test]
    fn test_unlimited_threshold_value() {
        assert_eq!(
            Amount::unlimited_approval_threshold().to_string(),
            "57896044618658097711785492504343953926634992332820282019728792003956564819967"
        );
    }

    #[test]
    fn test_sum_beyond_u256() {
        let huge = Amount::unlimited_approval_threshold();
        let total: Amount = vec![huge.clone(), huge.clone(), huge.clone(), huge].into_iter().sum();
        assert!(total > Amount::unlimited_approval_threshold());
        // 4 * (2^255 - 1) exceeds 2^256 - 1
        let max_u256: Amount = "115792089237316195423570985008687907853269984665640564039457584007913129639935"
            .parse()
            .unwrap();
        assert!(total > max_u256);
    }

    #[test]
    fn test_serde_as_decimal_string() {
        let amount: Amount = "340282366920938463463374607431768211456".parse().unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211456\"");

        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);

        let from_number: Amount = serde_json::from_str("42").unwrap();
        assert_eq!(from_number, Amount::from(42u64));
        assert!(serde_json::from_str::<Amount>("-3").is_err());
        assert!(serde_json::from_str::<Amount>("\"1.0\"").is_err());
    }
}
