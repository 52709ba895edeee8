//! Inbound trading signal
//!
//! Signals arrive from an external webhook collaborator and are immutable:
//! the engine never rewrites a signal, it only derives per-user orders from
//! one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
}

impl SignalAction {
    pub fn name(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One externally-supplied signal. `price` is the strategy's reference price
/// at emission time; `None` means execute at market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: SignalAction,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Originating strategy; the webhook payload calls this `strategy`.
    #[serde(default, alias = "strategy")]
    pub source: Option<String>,
}

impl Signal {
    pub fn new(symbol: impl Into<String>, action: SignalAction) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            price: None,
            timestamp: Utc::now(),
            source: None,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    /// Basic intake validation before a signal reaches the engine.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("signal symbol must not be empty".to_string());
        }
        if let Some(price) = self.price {
            if !price.is_finite() || price <= 0.0 {
                return Err(format!("signal price must be positive, got {}", price));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_deserializes_webhook_shape() {
        let json = r#"{"symbol":"BTC-USD","action":"BUY","price":50000.0,"strategy":"momentum"}"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.symbol, "BTC-USD");
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.price, Some(50000.0));
    }

    #[test]
    fn test_signal_without_price_is_market() {
        let json = r#"{"symbol":"ETH-USD","action":"SELL"}"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.price, None);
        assert!(signal.validate().is_ok());
    }

    #[test]
    fn test_signal_rejects_empty_symbol() {
        let signal = Signal::new("  ", SignalAction::Buy);
        assert!(signal.validate().is_err());
    }

    #[test]
    fn test_signal_rejects_non_positive_price() {
        let signal = Signal::new("BTC-USD", SignalAction::Buy).with_price(0.0);
        assert!(signal.validate().is_err());
    }
}
