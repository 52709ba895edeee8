//! Exchange Adapter Trait
//!
//! Uniform capability set the engine requires from a venue client. Every
//! call is tenant-scoped: the adapter resolves the user's credentials or
//! subaccount internally, the core never sees venue wire formats.
//!
//! Settlement is event-driven: adapters expose a broadcast stream of
//! [`FillEvent`]s emitted when a position is closed on the venue (filled
//! stop, manual close, liquidation). The engine subscribes instead of
//! polling or sleeping.

use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::position::PositionSide;
use crate::domain::value_objects::{price::Price, quantity::Quantity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors a venue adapter can surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// Transient: network failure, 5xx, venue maintenance. Retryable.
    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    /// The venue answered and said no. Not retryable.
    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid order parameters: {0}")]
    InvalidOrder(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Unavailable(_) | AdapterError::Timeout)
    }
}

/// Per-asset balance as reported by the venue.
#[derive(Debug, Clone)]
pub struct AssetBalance {
    pub currency: String,
    pub available: f64,
    pub total: f64,
}

/// Account snapshot for one tenant.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub balances: Vec<AssetBalance>,
    pub can_trade: bool,
}

impl AccountInfo {
    pub fn available(&self, currency: &str) -> f64 {
        self.balances
            .iter()
            .find(|balance| balance.currency == currency)
            .map(|balance| balance.available)
            .unwrap_or(0.0)
    }
}

/// An open order/position as the venue reports it.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    /// Client order id; matches the engine's operation id for orders this
    /// engine placed. Venue-originated orders carry the venue's id.
    pub operation_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Quantity,
    pub entry_price: Price,
    pub opened_at: DateTime<Utc>,
}

/// Order placement request.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub operation_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Quantity,
    /// Limit price; `None` places at market.
    pub price: Option<Price>,
    pub leverage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Acknowledgement of a placed order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Acknowledgement of a close request.
#[derive(Debug, Clone)]
pub struct CloseAck {
    pub success: bool,
    /// True when the venue had already closed the position; the caller
    /// treats this the same as success.
    pub already_closed: bool,
}

/// Emitted when the venue reports a position closed.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub user_id: String,
    pub operation_id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub exit_price: f64,
    pub reason: String,
    pub closed_at: DateTime<Utc>,
}

/// Venue capability set consumed by the engine.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Which venue this adapter talks to.
    fn exchange(&self) -> Exchange;

    /// Account balances and trade permission for one tenant.
    async fn account_info(&self, user_id: &str) -> AdapterResult<AccountInfo>;

    /// Last traded price for a symbol.
    async fn symbol_price(&self, symbol: &str) -> AdapterResult<Price>;

    /// Open orders/positions the venue currently holds for one tenant.
    async fn open_orders(&self, user_id: &str) -> AdapterResult<Vec<ExchangeOrder>>;

    /// Place an order for one tenant. Returns the venue order id.
    async fn place_order(&self, user_id: &str, spec: &OrderSpec) -> AdapterResult<OrderAck>;

    /// Close the position behind `operation_id` for one tenant.
    async fn close_position(
        &self,
        user_id: &str,
        operation_id: &str,
        reason: &str,
    ) -> AdapterResult<CloseAck>;

    /// Subscribe to close/fill events for settlement.
    fn subscribe_fills(&self) -> broadcast::Receiver<FillEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_and_timeout_are_retryable() {
        assert!(AdapterError::Unavailable("503".to_string()).is_retryable());
        assert!(AdapterError::Timeout.is_retryable());
    }

    #[test]
    fn test_rejection_is_not_retryable() {
        assert!(!AdapterError::Rejected("insufficient margin".to_string()).is_retryable());
        assert!(!AdapterError::Auth("bad key".to_string()).is_retryable());
    }

    #[test]
    fn test_account_info_lookup() {
        let info = AccountInfo {
            balances: vec![
                AssetBalance {
                    currency: "USD".to_string(),
                    available: 900.0,
                    total: 1000.0,
                },
                AssetBalance {
                    currency: "BTC".to_string(),
                    available: 0.5,
                    total: 0.5,
                },
            ],
            can_trade: true,
        };
        assert_eq!(info.available("USD"), 900.0);
        assert_eq!(info.available("ETH"), 0.0);
    }
}
