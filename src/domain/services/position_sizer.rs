//! Plan-aware position sizing
//!
//! Sizing rule: commit `balance × position_size_fraction` of margin, capped
//! at the plan's `max_position_value`, then scale by the plan's maximum
//! leverage. The resulting notional never exceeds
//! `balance × fraction × max_leverage`.

use crate::domain::errors::ExecutionError;
use crate::domain::services::plan_validator::PlanLimits;
use crate::domain::value_objects::{price::Price, quantity::Quantity};

/// Result of a sizing calculation.
#[derive(Debug, Clone)]
pub struct SizedOrder {
    pub quantity: Quantity,
    pub notional_usd: f64,
    pub margin_usd: f64,
    pub leverage: f64,
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    /// Orders below this notional are not worth sending to a venue.
    min_order_notional_usd: f64,
}

impl PositionSizer {
    pub fn new(min_order_notional_usd: f64) -> Self {
        Self {
            min_order_notional_usd,
        }
    }

    /// Size an order from the user's balance and plan limits at the current
    /// price.
    pub fn size_order(
        &self,
        available_balance_usd: f64,
        limits: &PlanLimits,
        price: Price,
    ) -> Result<SizedOrder, ExecutionError> {
        if available_balance_usd <= 0.0 {
            return Err(ExecutionError::Sizing {
                reason: "no available balance".to_string(),
            });
        }
        if price.value() <= 0.0 {
            return Err(ExecutionError::Sizing {
                reason: "price must be positive".to_string(),
            });
        }

        let margin_usd = (available_balance_usd * limits.position_size_fraction)
            .min(limits.max_position_value);
        let leverage = limits.max_leverage.max(1.0);
        let notional_usd = margin_usd * leverage;

        if notional_usd < self.min_order_notional_usd {
            return Err(ExecutionError::Sizing {
                reason: format!(
                    "order notional ${:.2} below minimum ${:.2}",
                    notional_usd, self.min_order_notional_usd
                ),
            });
        }

        let quantity =
            Quantity::new(notional_usd / price.value()).map_err(|e| ExecutionError::Sizing {
                reason: format!("invalid quantity: {}", e),
            })?;

        Ok(SizedOrder {
            quantity,
            notional_usd,
            margin_usd,
            leverage,
        })
    }

    /// Margin required to carry `notional_usd` at `leverage`.
    pub fn required_margin(&self, notional_usd: f64, leverage: f64) -> f64 {
        if notional_usd <= 0.0 || leverage < 1.0 {
            0.0
        } else {
            notional_usd / leverage
        }
    }
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(10.0)
    }
}
