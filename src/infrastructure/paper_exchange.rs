//! Paper venue
//!
//! Deterministic in-process exchange. Serves two jobs: the testnet venue
//! TRIAL accounts are routed to, and the venue double for the e2e suites.
//! Orders fill instantly at the current mark price; closing emits a
//! `FillEvent` on the broadcast stream exactly like a live venue's close
//! notification would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::position::PositionSide;
use crate::domain::repositories::exchange_adapter::{
    AccountInfo, AdapterError, AdapterResult, AssetBalance, CloseAck, ExchangeAdapter,
    ExchangeOrder, FillEvent, OrderAck, OrderSpec, OrderStatus,
};
use crate::domain::value_objects::{price::Price, quantity::Quantity};

const FILL_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct PaperOrder {
    user_id: String,
    symbol: String,
    side: PositionSide,
    quantity: f64,
    entry_price: f64,
    opened_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default)]
struct PaperState {
    prices: HashMap<String, f64>,
    balances: HashMap<String, f64>,
    orders: HashMap<String, PaperOrder>,
}

pub struct PaperExchange {
    exchange: Exchange,
    state: Mutex<PaperState>,
    fills: broadcast::Sender<FillEvent>,
    /// When non-zero, the next N calls fail as Unavailable. Lets tests
    /// exercise the retry/backoff path.
    fail_next: AtomicU32,
}

impl PaperExchange {
    pub fn new(exchange: Exchange) -> Self {
        let (fills, _) = broadcast::channel(FILL_CHANNEL_CAPACITY);
        Self {
            exchange,
            state: Mutex::new(PaperState::default()),
            fills,
            fail_next: AtomicU32::new(0),
        }
    }

    /// Testnet venue with a few seeded quotes.
    pub fn testnet() -> Self {
        let venue = Self::new(Exchange::Testnet);
        venue.set_price("BTC-USD", 50000.0);
        venue.set_price("ETH-USD", 3000.0);
        venue.set_price("SOL-USD", 100.0);
        venue
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, user_id: &str, available_usd: f64) {
        self.lock()
            .balances
            .insert(user_id.to_string(), available_usd);
    }

    /// Number of orders currently open on the venue for one tenant.
    pub fn open_order_count(&self, user_id: &str) -> usize {
        self.lock()
            .orders
            .values()
            .filter(|order| order.user_id == user_id)
            .count()
    }

    /// Queue `count` Unavailable failures for upcoming calls.
    pub fn fail_next_requests(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Create a venue-side position this engine never placed. Reconciliation
    /// must adopt it.
    pub fn inject_order(
        &self,
        user_id: &str,
        operation_id: &str,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
    ) {
        self.lock().orders.insert(
            operation_id.to_string(),
            PaperOrder {
                user_id: user_id.to_string(),
                symbol: symbol.to_string(),
                side,
                quantity,
                entry_price,
                opened_at: Utc::now(),
            },
        );
    }

    /// Drop an order without emitting a fill, as if the venue closed it
    /// while we were not listening. Reconciliation must close it locally.
    pub fn vanish_order(&self, operation_id: &str) -> bool {
        self.lock().orders.remove(operation_id).is_some()
    }

    /// Venue-side close: removes the order and emits the fill event, the
    /// same path a stop-loss or liquidation would take.
    pub fn trigger_close(&self, operation_id: &str, reason: &str) -> bool {
        let (order, exit_price) = {
            let mut state = self.lock();
            let order = match state.orders.remove(operation_id) {
                Some(order) => order,
                None => return false,
            };
            let exit_price = state
                .prices
                .get(&order.symbol)
                .copied()
                .unwrap_or(order.entry_price);
            (order, exit_price)
        };

        let event = FillEvent {
            user_id: order.user_id,
            operation_id: operation_id.to_string(),
            symbol: order.symbol,
            exchange: self.exchange,
            exit_price,
            reason: reason.to_string(),
            closed_at: Utc::now(),
        };
        debug!(
            "paper venue close {} on {} at {}",
            operation_id, self.exchange, exit_price
        );
        // Nobody listening is fine; settlement may not be wired in tests.
        let _ = self.fills.send(event);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn check_availability(&self) -> AdapterResult<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(AdapterError::Unavailable(
                "paper venue offline (injected)".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn account_info(&self, user_id: &str) -> AdapterResult<AccountInfo> {
        self.check_availability()?;
        let available = self.lock().balances.get(user_id).copied().unwrap_or(0.0);
        Ok(AccountInfo {
            balances: vec![AssetBalance {
                currency: "USD".to_string(),
                available,
                total: available,
            }],
            can_trade: true,
        })
    }

    async fn symbol_price(&self, symbol: &str) -> AdapterResult<Price> {
        self.check_availability()?;
        let price = self
            .lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| AdapterError::Unavailable(format!("no quote for {}", symbol)))?;
        Price::new(price).map_err(|e| AdapterError::Unavailable(e.to_string()))
    }

    async fn open_orders(&self, user_id: &str) -> AdapterResult<Vec<ExchangeOrder>> {
        self.check_availability()?;
        let state = self.lock();
        let mut orders = Vec::new();
        for (operation_id, order) in &state.orders {
            if order.user_id != user_id {
                continue;
            }
            orders.push(ExchangeOrder {
                operation_id: operation_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: Quantity::new(order.quantity)
                    .map_err(|e| AdapterError::Unavailable(e.to_string()))?,
                entry_price: Price::new(order.entry_price)
                    .map_err(|e| AdapterError::Unavailable(e.to_string()))?,
                opened_at: order.opened_at,
            });
        }
        Ok(orders)
    }

    async fn place_order(&self, user_id: &str, spec: &OrderSpec) -> AdapterResult<OrderAck> {
        self.check_availability()?;
        let mut state = self.lock();

        if state.orders.contains_key(&spec.operation_id) {
            return Err(AdapterError::Rejected(format!(
                "duplicate client order id {}",
                spec.operation_id
            )));
        }

        let fill_price = match spec.price {
            Some(price) => price.value(),
            None => state
                .prices
                .get(&spec.symbol)
                .copied()
                .ok_or_else(|| AdapterError::Unavailable(format!("no quote for {}", spec.symbol)))?,
        };

        state.orders.insert(
            spec.operation_id.clone(),
            PaperOrder {
                user_id: user_id.to_string(),
                symbol: spec.symbol.clone(),
                side: spec.side,
                quantity: spec.quantity.value(),
                entry_price: fill_price,
                opened_at: Utc::now(),
            },
        );

        Ok(OrderAck {
            order_id: format!("paper-{}", spec.operation_id),
            status: OrderStatus::Filled,
        })
    }

    async fn close_position(
        &self,
        _user_id: &str,
        operation_id: &str,
        reason: &str,
    ) -> AdapterResult<CloseAck> {
        self.check_availability()?;
        if self.trigger_close(operation_id, reason) {
            Ok(CloseAck {
                success: true,
                already_closed: false,
            })
        } else {
            // The venue no longer has the order; the caller converges on
            // "closed" without an error.
            Ok(CloseAck {
                success: true,
                already_closed: true,
            })
        }
    }

    fn subscribe_fills(&self) -> broadcast::Receiver<FillEvent> {
        self.fills.subscribe()
    }
}
