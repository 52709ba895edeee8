//! PositionManagementService - hybrid read path
//!
//! Live position views come from the exchange (authoritative for price and
//! unrealized PnL), enriched with protective stop levels derived from the
//! CURRENT price, because venues do not persist this engine's intended
//! SL/TP. If the venue cannot be reached the call fails hard: callers rely
//! on "current" meaning real-time, so stale ledger data is never
//! substituted.
//!
//! History and analytics are the opposite: ledger only, the exchange is
//! never consulted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::position::PositionSide;
use crate::domain::repositories::exchange_adapter::ExchangeAdapter;
use crate::domain::value_objects::price::Price;
use crate::persistence::models::{AnalyticsSummary, LedgerRecord};
use crate::persistence::repository::LedgerRepository;
use crate::persistence::DatabaseError;

/// Fixed 2% stop / 4% target: risk:reward 1:2.
const STOP_LOSS_PCT: f64 = 0.02;
const TAKE_PROFIT_PCT: f64 = 0.04;

/// Stop-loss and take-profit derived from the current price.
pub fn derived_protective_prices(side: PositionSide, current: Price) -> (f64, f64) {
    let price = current.value();
    let (stop_loss, take_profit) = match side {
        PositionSide::Long => (price * (1.0 - STOP_LOSS_PCT), price * (1.0 + TAKE_PROFIT_PCT)),
        PositionSide::Short => (price * (1.0 + STOP_LOSS_PCT), price * (1.0 - TAKE_PROFIT_PCT)),
    };
    (round_2dp(stop_loss), round_2dp(take_profit))
}

fn round_2dp(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, thiserror::Error)]
pub enum PositionViewError {
    /// Live data could not be fetched; the caller gets an error, never a
    /// stale substitute.
    #[error("Exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] DatabaseError),
}

/// Live position view: exchange truth plus derived stop levels.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayPosition {
    pub operation_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub exchange: Exchange,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl_usd: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
}

pub struct PositionManagementService {
    adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>>,
    ledger: Arc<LedgerRepository>,
}

impl PositionManagementService {
    pub fn new(
        adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>>,
        ledger: Arc<LedgerRepository>,
    ) -> Self {
        Self { adapters, ledger }
    }

    /// Current positions for display, straight from the venue(s).
    pub async fn positions_for_display(
        &self,
        user_id: &str,
        exchange: Option<Exchange>,
    ) -> Result<Vec<DisplayPosition>, PositionViewError> {
        let mut positions = Vec::new();

        for (venue, adapter) in &self.adapters {
            if let Some(filter) = exchange {
                if *venue != filter {
                    continue;
                }
            }

            let orders = adapter.open_orders(user_id).await.map_err(|e| {
                PositionViewError::ExchangeUnavailable(format!("{}: {}", venue, e))
            })?;

            for order in orders {
                let current = adapter.symbol_price(&order.symbol).await.map_err(|e| {
                    PositionViewError::ExchangeUnavailable(format!("{}: {}", venue, e))
                })?;

                let (stop_loss, take_profit) = derived_protective_prices(order.side, current);
                let unrealized = (current.value() - order.entry_price.value())
                    * order.quantity.value()
                    * order.side.direction();

                positions.push(DisplayPosition {
                    operation_id: order.operation_id,
                    symbol: order.symbol,
                    side: order.side,
                    exchange: *venue,
                    quantity: order.quantity.value(),
                    entry_price: order.entry_price.value(),
                    current_price: current.value(),
                    unrealized_pnl_usd: unrealized,
                    stop_loss,
                    take_profit,
                    opened_at: order.opened_at,
                });
            }
        }

        debug!(
            "display positions for {}: {} live entries",
            user_id,
            positions.len()
        );
        Ok(positions)
    }

    /// Closed-trade history. Ledger only, not on the real-time path.
    pub async fn historical_trades(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<LedgerRecord>, PositionViewError> {
        Ok(self.ledger.history_for_user(user_id, limit).await?)
    }

    /// Aggregate analytics. Ledger only, not on the real-time path.
    pub async fn analytics_summary(
        &self,
        user_id: &str,
    ) -> Result<AnalyticsSummary, PositionViewError> {
        Ok(self.ledger.analytics_for_user(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use crate::persistence::init_database;

    #[test]
    fn test_protective_prices_long() {
        let (stop_loss, take_profit) =
            derived_protective_prices(PositionSide::Long, Price::new(50000.0).unwrap());
        assert_eq!(stop_loss, 49000.00);
        assert_eq!(take_profit, 52000.00);
    }

    #[test]
    fn test_protective_prices_short() {
        let (stop_loss, take_profit) =
            derived_protective_prices(PositionSide::Short, Price::new(50000.0).unwrap());
        assert_eq!(stop_loss, 51000.00);
        assert_eq!(take_profit, 48000.00);
    }

    #[test]
    fn test_protective_prices_round_to_cents() {
        let (stop_loss, take_profit) =
            derived_protective_prices(PositionSide::Long, Price::new(333.333).unwrap());
        assert_eq!(stop_loss, 326.67); // 333.333 * 0.98 = 326.66634
        assert_eq!(take_profit, 346.67); // 333.333 * 1.04 = 346.66632
    }

    async fn service_with_paper_venue() -> (PositionManagementService, Arc<PaperExchange>) {
        let venue = Arc::new(PaperExchange::new(Exchange::Binance));
        let mut adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(Exchange::Binance, venue.clone());

        let pool = init_database("sqlite::memory:").await.unwrap();
        let ledger = Arc::new(LedgerRepository::new(pool));
        (PositionManagementService::new(adapters, ledger), venue)
    }

    #[tokio::test]
    async fn test_display_uses_live_price_for_stops() {
        let (service, venue) = service_with_paper_venue().await;
        venue.set_price("BTC-USD", 50000.0);
        venue.inject_order("user-1", "op-1", "BTC-USD", PositionSide::Long, 0.5, 48000.0);

        let positions = service
            .positions_for_display("user-1", None)
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);
        let position = &positions[0];

        // Stops derive from the CURRENT 50000, not the 48000 entry.
        assert_eq!(position.stop_loss, 49000.00);
        assert_eq!(position.take_profit, 52000.00);
        assert_eq!(position.unrealized_pnl_usd, 1000.0); // (50000-48000)*0.5
    }

    #[tokio::test]
    async fn test_display_fails_hard_when_venue_is_down() {
        let (service, venue) = service_with_paper_venue().await;
        venue.set_price("BTC-USD", 50000.0);
        venue.inject_order("user-1", "op-1", "BTC-USD", PositionSide::Long, 0.5, 48000.0);
        venue.fail_next_requests(5);

        let result = service.positions_for_display("user-1", None).await;
        assert!(matches!(
            result,
            Err(PositionViewError::ExchangeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_history_never_touches_the_venue() {
        let (service, venue) = service_with_paper_venue().await;
        // A venue that fails every call must not affect ledger reads.
        venue.fail_next_requests(100);

        let history = service.historical_trades("user-1", 50).await.unwrap();
        assert!(history.is_empty());

        let analytics = service.analytics_summary("user-1").await.unwrap();
        assert_eq!(analytics.total_trades, 0);
    }
}
