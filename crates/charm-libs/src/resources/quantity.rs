//! Kubernetes quantity parsing
//!
//! Quantities keep the full precision of their input so arithmetic on them is
//! exact. Rounding to milli precision, away from zero, happens only when a
//! value is rendered or compared canonically, since that is the finest
//! granularity the API server keeps (`"1000m" == "1"`, `"1n" == "1m"`).

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::SpecError;

/// Decimal places kept by the API server
const PRECISION: u32 = 3;

/// A parsed resource quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity(Decimal);

impl Quantity {
    /// Parse a quantity expression such as `"500m"`, `"0.8Gi"` or `"1e3"`
    pub fn parse(input: &str) -> Result<Self, SpecError> {
        let invalid = || SpecError::InvalidQuantity(input.to_string());
        let trimmed = input.trim();

        let (number, multiplier) = split_suffix(trimmed);
        if number.is_empty() {
            return Err(invalid());
        }

        let mantissa = if number.contains(|c| c == 'e' || c == 'E') {
            Decimal::from_scientific(number).map_err(|_| invalid())?
        } else {
            Decimal::from_str(number).map_err(|_| invalid())?
        };

        let value = mantissa.checked_mul(multiplier).ok_or_else(invalid)?;
        Ok(Self(value))
    }

    pub fn from_decimal(value: Decimal) -> Self {
        Self(value)
    }

    /// The value as the API server would store it
    pub fn to_milli(&self) -> Self {
        Self(self.0.round_dp_with_strategy(PRECISION, RoundingStrategy::AwayFromZero))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// True when the value is not a whole number
    pub fn has_fraction(&self) -> bool {
        !self.0.fract().is_zero()
    }

    /// Smallest whole quantity not below this one
    pub fn ceil(&self) -> Self {
        Self(self.0.ceil())
    }

    /// Plain string without suffix and without trailing zeros
    pub fn to_plain_string(&self) -> String {
        self.0.normalize().to_string()
    }

    /// Plain string with exactly three decimal places, e.g. `"0.800"`
    pub fn to_milli_string(&self) -> String {
        let mut value = self.to_milli().0;
        value.rescale(PRECISION);
        value.to_string()
    }
}

impl FromStr for Quantity {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_plain_string())
    }
}

/// Compare two quantity strings canonically; unparseable input never matches
pub fn equals_canonically(a: &str, b: &str) -> bool {
    match (Quantity::parse(a), Quantity::parse(b)) {
        (Ok(a), Ok(b)) => a.to_milli() == b.to_milli(),
        _ => false,
    }
}

fn split_suffix(input: &str) -> (&str, Decimal) {
    if let Some(stem) = input.strip_suffix('i') {
        if let Some(last) = stem.chars().last() {
            if let Some(exp) = binary_exponent(last) {
                let number = &stem[..stem.len() - last.len_utf8()];
                return (number, Decimal::from(1u64 << exp));
            }
        }
    }

    if let Some(last) = input.chars().last() {
        if let Some(multiplier) = decimal_multiplier(last) {
            return (&input[..input.len() - last.len_utf8()], multiplier);
        }
    }

    (input, Decimal::ONE)
}

fn binary_exponent(c: char) -> Option<u32> {
    match c {
        'K' => Some(10),
        'M' => Some(20),
        'G' => Some(30),
        'T' => Some(40),
        'P' => Some(50),
        'E' => Some(60),
        _ => None,
    }
}

fn decimal_multiplier(c: char) -> Option<Decimal> {
    let (mantissa, scale, power) = match c {
        'n' => (1, 9, 0),
        'u' => (1, 6, 0),
        'm' => (1, 3, 0),
        'k' => (1, 0, 3),
        'M' => (1, 0, 6),
        'G' => (1, 0, 9),
        'T' => (1, 0, 12),
        'P' => (1, 0, 15),
        'E' => (1, 0, 18),
        _ => return None,
    };
    Some(Decimal::new(mantissa * 10i64.pow(power), scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    #[test]
    fn test_parse_plain_and_milli() {
        assert_eq!(q("1").as_decimal(), Decimal::ONE);
        assert_eq!(q("500m").as_decimal(), Decimal::new(5, 1));
        assert_eq!(q("1000m"), q("1"));
        assert_eq!(q("0.5"), q("500m"));
    }

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(q("1Ki").as_decimal(), Decimal::from(1024));
        assert_eq!(q("2Mi").as_decimal(), Decimal::from(2 * 1024 * 1024));
        assert_eq!(q("1Gi").as_decimal(), Decimal::from(1u64 << 30));
        assert_eq!(q("1Ei").as_decimal(), Decimal::from(1u64 << 60));
    }

    #[test]
    fn test_parse_decimal_suffixes_and_exponent() {
        assert_eq!(q("1k"), q("1000"));
        assert_eq!(q("1G"), q("1000M"));
        assert_eq!(q("1e3"), q("1k"));
        assert_eq!(q("1E"), q("1000P"));
    }

    #[test]
    fn test_sub_milli_values_keep_precision_until_rendered() {
        assert_eq!(q("1n").as_decimal(), Decimal::new(1, 9));
        assert_eq!(q("1.0001m").as_decimal(), Decimal::new(10_001, 7));
        assert_eq!(q("0.8Gi").as_decimal(), Decimal::new(8_589_934_592, 1));

        assert_eq!(q("1n").to_milli_string(), "0.001");
        assert_eq!(q("1.0001m").to_milli_string(), "0.002");
        assert_eq!(q("-1n").to_milli().as_decimal(), Decimal::new(-1, 3));
        assert!(q("1n") < q("1m"));
    }

    #[test]
    fn test_invalid_quantities() {
        for bad in ["", "m", "4x", "1Gx", "Gi", "abc", "1.2.3"] {
            assert!(Quantity::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_negative_values_parse_but_are_flagged() {
        assert!(q("-1").is_negative());
        assert!(q("-1Gi").is_negative());
        assert!(!q("0").is_negative());
    }

    #[test]
    fn test_ceil_and_formatting() {
        let mem = q("0.8Gi");
        assert!(mem.has_fraction());
        assert_eq!(mem.ceil().to_plain_string(), "858993460");
        assert_eq!(q("800m").to_milli_string(), "0.800");
        assert_eq!(q("2").to_milli_string(), "2.000");
    }

    #[test]
    fn test_equals_canonically() {
        assert!(equals_canonically("1000m", "1"));
        assert!(equals_canonically("1Gi", "1073741824"));
        assert!(!equals_canonically("1G", "1Gi"));
        assert!(equals_canonically("1n", "1m"));
        assert!(equals_canonically("1.0001m", "2m"));
        assert!(!equals_canonically("bogus", "bogus"));
    }
}
