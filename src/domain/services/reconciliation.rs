//! Two-sided open-position diff
//!
//! Compares the exchange's open set E against the locally known open set L
//! for one user and venue, keyed by (exchange, symbol). The exchange is
//! authoritative for existence: present only in E means adopt, present only
//! in L means the venue closed it behind our back, present in both with
//! diverging fields means overwrite from exchange values.
//!
//! This module only plans; applying the resolutions against tracker and
//! ledger is the reconciliation actor's job, so the diff stays pure and
//! trivially testable.

use serde::Serialize;

use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::repositories::exchange_adapter::ExchangeOrder;
use crate::domain::value_objects::quantity::Quantity;

/// Size differences below this are venue rounding, not a mismatch.
const QUANTITY_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyKind {
    OrphanOnExchange,
    OrphanLocally,
    FieldMismatch,
}

/// Resolution taken for one discrepancy, for the audit record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Resolution {
    AdoptedFromExchange,
    ClosedLocally { exit_price: f64 },
    FieldsOverwritten { size: f64, side: PositionSide },
}

/// One resolved difference between exchange and local state.
#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub user_id: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub operation_id: Option<String>,
    pub kind: DiscrepancyKind,
    pub resolution: Resolution,
}

/// A correction the actor must apply.
#[derive(Debug, Clone)]
pub enum ReconcileAction {
    /// In E, not in L: adopt the venue's position as OPEN.
    Adopt { order: ExchangeOrder },
    /// In L, not in E: close locally at the last known price.
    CloseLocal { operation_id: String, symbol: String },
    /// In both, fields diverge: exchange values win.
    Overwrite {
        operation_id: String,
        symbol: String,
        size: Quantity,
        side: PositionSide,
    },
}

/// Plan the corrections for one user on one venue.
///
/// Idempotent by construction: once the corrections are applied, a second
/// diff of the same exchange state produces no actions.
pub fn diff_open_sets(exchange_open: &[ExchangeOrder], local_open: &[Position]) -> Vec<ReconcileAction> {
    let mut actions = Vec::new();

    for order in exchange_open {
        match local_open.iter().find(|p| p.symbol == order.symbol) {
            None => actions.push(ReconcileAction::Adopt {
                order: order.clone(),
            }),
            Some(local) => {
                let size_differs =
                    (local.size.value() - order.quantity.value()).abs() > QUANTITY_TOLERANCE;
                let side_differs = local.side != order.side;
                if size_differs || side_differs {
                    actions.push(ReconcileAction::Overwrite {
                        operation_id: local.operation_id.clone(),
                        symbol: local.symbol.clone(),
                        size: order.quantity,
                        side: order.side,
                    });
                }
            }
        }
    }

    for local in local_open {
        if !exchange_open.iter().any(|o| o.symbol == local.symbol) {
            actions.push(ReconcileAction::CloseLocal {
                operation_id: local.operation_id.clone(),
                symbol: local.symbol.clone(),
            });
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::price::Price;
    use chrono::Utc;

    fn exchange_order(symbol: &str, side: PositionSide, quantity: f64) -> ExchangeOrder {
        ExchangeOrder {
            operation_id: format!("venue-{}", symbol),
            symbol: symbol.to_string(),
            side,
            quantity: Quantity::new(quantity).unwrap(),
            entry_price: Price::new(100.0).unwrap(),
            opened_at: Utc::now(),
        }
    }

    fn local_position(operation_id: &str, symbol: &str, side: PositionSide, size: f64) -> Position {
        Position::open(
            operation_id.to_string(),
            "user-1".to_string(),
            symbol.to_string(),
            side,
            Price::new(100.0).unwrap(),
            Quantity::new(size).unwrap(),
            1.0,
            Exchange::Binance,
        )
    }

    #[test]
    fn test_matching_sets_produce_no_actions() {
        let exchange = vec![exchange_order("BTC-USD", PositionSide::Long, 0.5)];
        let local = vec![local_position("op-1", "BTC-USD", PositionSide::Long, 0.5)];
        assert!(diff_open_sets(&exchange, &local).is_empty());
    }

    #[test]
    fn test_orphan_on_exchange_is_adopted() {
        let exchange = vec![exchange_order("ETH-USD", PositionSide::Long, 1.0)];
        let actions = diff_open_sets(&exchange, &[]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], ReconcileAction::Adopt { order } if order.symbol == "ETH-USD"));
    }

    #[test]
    fn test_orphan_locally_is_closed() {
        let local = vec![local_position("op-1", "BTC-USD", PositionSide::Long, 0.5)];
        let actions = diff_open_sets(&[], &local);
        assert_eq!(actions.len(), 1);
        assert!(
            matches!(&actions[0], ReconcileAction::CloseLocal { operation_id, .. } if operation_id == "op-1")
        );
    }

    #[test]
    fn test_quantity_mismatch_overwrites_from_exchange() {
        let exchange = vec![exchange_order("BTC-USD", PositionSide::Long, 0.75)];
        let local = vec![local_position("op-1", "BTC-USD", PositionSide::Long, 0.5)];
        let actions = diff_open_sets(&exchange, &local);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ReconcileAction::Overwrite { size, side, .. } => {
                assert_eq!(size.value(), 0.75);
                assert_eq!(*side, PositionSide::Long);
            }
            other => panic!("expected overwrite, got {:?}", other),
        }
    }

    #[test]
    fn test_side_mismatch_overwrites_from_exchange() {
        let exchange = vec![exchange_order("BTC-USD", PositionSide::Short, 0.5)];
        let local = vec![local_position("op-1", "BTC-USD", PositionSide::Long, 0.5)];
        let actions = diff_open_sets(&exchange, &local);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            ReconcileAction::Overwrite {
                side: PositionSide::Short,
                ..
            }
        ));
    }

    #[test]
    fn test_rounding_noise_is_not_a_mismatch() {
        let exchange = vec![exchange_order("BTC-USD", PositionSide::Long, 0.5 + 1e-12)];
        let local = vec![local_position("op-1", "BTC-USD", PositionSide::Long, 0.5)];
        assert!(diff_open_sets(&exchange, &local).is_empty());
    }

    #[test]
    fn test_mixed_differences_all_reported() {
        let exchange = vec![
            exchange_order("BTC-USD", PositionSide::Long, 0.5), // matches
            exchange_order("ETH-USD", PositionSide::Long, 2.0), // orphan on exchange
            exchange_order("SOL-USD", PositionSide::Short, 10.0), // side mismatch
        ];
        let local = vec![
            local_position("op-1", "BTC-USD", PositionSide::Long, 0.5),
            local_position("op-2", "SOL-USD", PositionSide::Long, 10.0),
            local_position("op-3", "DOGE-USD", PositionSide::Long, 100.0), // orphan locally
        ];
        let actions = diff_open_sets(&exchange, &local);
        assert_eq!(actions.len(), 3);
    }
}
