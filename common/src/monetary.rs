//! Monetary types for the ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// Maximum number of fractional digits an amount may carry.
///
/// Matches the `NUMERIC(20, 4)` money columns.
pub const MAX_SCALE: u32 = 4;

/// Maximum number of integer digits a money column holds.
pub const MAX_INTEGER_DIGITS: u32 = 16;

/// Whether `value` can be stored in a `NUMERIC(20, 4)` money column.
pub fn fits_money_column(value: Decimal) -> bool {
    value.abs() < Decimal::from(10u64.pow(MAX_INTEGER_DIGITS))
        && value.normalize().scale() <= MAX_SCALE
}

/// A strictly positive amount of money.
///
/// Ledger records store magnitudes; the direction lives in the record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    /// Create an amount, rejecting zero, negative, over-precise and
    /// out-of-range values.
    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "amount must be positive, got {}",
                value
            )));
        }
        if value.normalize().scale() > MAX_SCALE {
            return Err(LedgerError::InvalidAmount(format!(
                "amount {} has more than {} decimal places",
                value, MAX_SCALE
            )));
        }
        if !fits_money_column(value) {
            return Err(LedgerError::InvalidAmount(format!(
                "amount {} exceeds {} integer digits",
                value, MAX_INTEGER_DIGITS
            )));
        }
        Ok(Self(value.normalize()))
    }

    /// Create from a whole number of units.
    pub fn from_units(units: u64) -> Result<Self, LedgerError> {
        Self::new(Decimal::from(units))
    }

    /// Get the decimal value.
    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str_exact(s)
            .map_err(|e| LedgerError::InvalidAmount(format!("{}: {}", s, e)))?;
        Self::new(value)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_positive_amounts_accepted() {
        let amount: Amount = "100.50".parse().unwrap();
        assert_eq!(amount.value(), dec!(100.5));
        assert_eq!(Amount::from_units(7).unwrap().value(), dec!(7));
    }

    #[test]
    fn test_non_positive_amounts_rejected() {
        assert!(matches!(
            Amount::new(Decimal::ZERO),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(Amount::new(dec!(-1)).is_err());
    }

    #[test]
    fn test_excess_precision_rejected() {
        assert!(Amount::new(dec!(0.00001)).is_err());
        // Trailing zeros do not count towards the scale.
        assert!(Amount::new(dec!(1.23400000)).is_ok());
    }

    #[test]
    fn test_magnitude_bounded_by_money_column() {
        assert!(Amount::new(dec!(9999999999999999.9999)).is_ok());
        assert!(matches!(
            Amount::new(dec!(10000000000000000)),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(Amount::new(Decimal::MAX).is_err());
        assert!(!fits_money_column(dec!(-10000000000000000)));
        assert!(fits_money_column(dec!(-9999999999999999.9999)));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Amount = serde_json::from_str("\"12.5\"").unwrap();
        assert_eq!(ok.value(), dec!(12.5));
        assert!(serde_json::from_str::<Amount>("\"-3\"").is_err());
    }
}
