//! Shared market-context decision
//!
//! One decision is computed per inbound signal — not per user — so fan-out
//! stays cheap and every user trades the same read of the market. The
//! fixed price-drift thresholds are intentionally simple; the strategy sits
//! behind a trait so a better model can replace it without touching the
//! engine.

use serde::Serialize;

use crate::domain::entities::signal::{Signal, SignalAction};

/// Market context available at decision time.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: f64,
}

/// The decision shared by every user execution of one signal.
#[derive(Debug, Clone, Serialize)]
pub struct MarketDecision {
    pub direction: SignalAction,
    pub confidence: f64,
    pub reasoning: String,
}

pub trait DecisionStrategy: Send + Sync {
    fn decide(&self, signal: &Signal, market: &MarketSnapshot) -> MarketDecision;
}

/// Fixed percentage cutoffs on the drift between the signal's reference
/// price and the live price.
#[derive(Debug, Clone)]
pub struct PriceDriftThresholds {
    /// Drift beyond this (against the signal) drops confidence hard.
    pub adverse_drift_pct: f64,
    /// Drift under this counts as confirmation.
    pub confirm_drift_pct: f64,
}

impl Default for PriceDriftThresholds {
    fn default() -> Self {
        Self {
            adverse_drift_pct: 2.0,
            confirm_drift_pct: 0.5,
        }
    }
}

impl DecisionStrategy for PriceDriftThresholds {
    fn decide(&self, signal: &Signal, market: &MarketSnapshot) -> MarketDecision {
        let reference = signal.price.unwrap_or(market.current_price);
        let drift_pct = if reference > 0.0 {
            (market.current_price - reference) / reference * 100.0
        } else {
            0.0
        };

        // Drift in the signal's direction means the move already happened;
        // drift against it means the entry improved.
        let signed_drift = match signal.action {
            SignalAction::Buy => drift_pct,
            SignalAction::Sell => -drift_pct,
        };

        let (confidence, reasoning) = if signed_drift.abs() <= self.confirm_drift_pct {
            (
                0.9,
                format!(
                    "price within {:.2}% of signal reference, executing as signaled",
                    signed_drift.abs()
                ),
            )
        } else if signed_drift > self.adverse_drift_pct {
            (
                0.3,
                format!(
                    "price ran {:.2}% past the signal reference, chasing entry",
                    signed_drift
                ),
            )
        } else if signed_drift < -self.adverse_drift_pct {
            (
                0.5,
                format!(
                    "price moved {:.2}% against the signal since emission",
                    signed_drift.abs()
                ),
            )
        } else {
            (
                0.7,
                format!("moderate drift of {:.2}% since signal emission", signed_drift),
            )
        };

        MarketDecision {
            direction: signal.action,
            confidence,
            reasoning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(price: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTC-USD".to_string(),
            current_price: price,
        }
    }

    #[test]
    fn test_decision_keeps_signal_direction() {
        let strategy = PriceDriftThresholds::default();
        let signal = Signal::new("BTC-USD", SignalAction::Sell).with_price(50000.0);
        let decision = strategy.decide(&signal, &snapshot(50000.0));
        assert_eq!(decision.direction, SignalAction::Sell);
    }

    #[test]
    fn test_no_drift_is_high_confidence() {
        let strategy = PriceDriftThresholds::default();
        let signal = Signal::new("BTC-USD", SignalAction::Buy).with_price(50000.0);
        let decision = strategy.decide(&signal, &snapshot(50100.0)); // 0.2%
        assert_eq!(decision.confidence, 0.9);
    }

    #[test]
    fn test_chased_entry_drops_confidence() {
        let strategy = PriceDriftThresholds::default();
        let signal = Signal::new("BTC-USD", SignalAction::Buy).with_price(50000.0);
        let decision = strategy.decide(&signal, &snapshot(51500.0)); // +3%
        assert_eq!(decision.confidence, 0.3);
    }

    #[test]
    fn test_adverse_move_is_cautious() {
        let strategy = PriceDriftThresholds::default();
        let signal = Signal::new("BTC-USD", SignalAction::Buy).with_price(50000.0);
        let decision = strategy.decide(&signal, &snapshot(48500.0)); // -3%
        assert_eq!(decision.confidence, 0.5);
    }

    #[test]
    fn test_market_signal_uses_live_price_as_reference() {
        let strategy = PriceDriftThresholds::default();
        let signal = Signal::new("BTC-USD", SignalAction::Buy); // no price
        let decision = strategy.decide(&signal, &snapshot(43000.0));
        assert_eq!(decision.confidence, 0.9);
    }
}
