use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};

/// An order or position size in base units. Always finite and positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Quantity(f64);

impl Quantity {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value <= 0.0 {
            return Err(ValidationError::MustBePositive);
        }
        Ok(Quantity(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Quantity {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Quantity::new(value)
    }
}

impl From<Quantity> for f64 {
    fn from(quantity: Quantity) -> f64 {
        quantity.0
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_new_valid() {
        assert_eq!(Quantity::new(0.25).unwrap().value(), 0.25);
    }

    #[test]
    fn test_quantity_rejects_zero() {
        assert!(Quantity::new(0.0).is_err());
    }

    #[test]
    fn test_quantity_rejects_negative() {
        assert!(Quantity::new(-1.0).is_err());
    }

    #[test]
    fn test_quantity_rejects_infinite() {
        assert!(Quantity::new(f64::INFINITY).is_err());
    }
}
