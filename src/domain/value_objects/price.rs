use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};

/// A market price in quote currency. Always finite and non-negative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Price(f64);

impl Price {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value < 0.0 {
            return Err(ValidationError::MustBeNonNegative);
        }
        Ok(Price(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn multiply(&self, factor: f64) -> Result<Price, ValidationError> {
        if !factor.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        Price::new(self.0 * factor)
    }

    /// Round to cents; display prices and derived stop levels use this.
    pub fn rounded_2dp(&self) -> f64 {
        (self.0 * 100.0).round() / 100.0
    }
}

impl TryFrom<f64> for Price {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Price::new(value)
    }
}

impl From<Price> for f64 {
    fn from(price: Price) -> f64 {
        price.0
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}
