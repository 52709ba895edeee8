//! BalanceTradingEngine - signal fan-out orchestration
//!
//! One inbound signal becomes many independent per-user executions:
//! validate → size → place → register, bounded-parallel across users,
//! serialized per user. A failure or denial for one user never stops the
//! rest of the batch; the batch result carries exactly one outcome per
//! eligible user.
//!
//! Settlement is event-driven: the engine subscribes to each adapter's fill
//! stream and settles when the venue reports a close. A manual close and a
//! venue-driven close may race; the tracker's idempotent close plus the
//! ledger's settlement guard make the second path a no-op.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use lru::LruCache;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::application::services::position_service::derived_protective_prices;
use crate::config::EngineConfig;
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::entities::signal::{Signal, SignalAction};
use crate::domain::entities::user::{PlanType, UserAccount};
use crate::domain::errors::ExecutionError;
use crate::domain::repositories::exchange_adapter::{
    AdapterError, ExchangeAdapter, FillEvent, OrderSpec,
};
use crate::domain::services::decision::{DecisionStrategy, MarketDecision, MarketSnapshot};
use crate::domain::services::plan_validator::{
    OperationRequest, PlanValidator, TradingMode,
};
use crate::domain::services::position_sizer::PositionSizer;
use crate::domain::services::position_tracker::PositionTracker;
use crate::domain::services::settlement::split_for_plan;
use crate::domain::value_objects::price::Price;
use crate::persistence::models::CreateLedgerEntry;
use crate::persistence::repository::{LedgerRepository, SettleOutcome, UserRepository};

/// Per-user outcome of one signal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UserOutcome {
    Executed {
        operation_id: String,
        exchange: Exchange,
        quantity: f64,
        entry_price: f64,
        notional_usd: f64,
    },
    Denied {
        trading_mode: TradingMode,
        reasons: Vec<String>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct UserExecution {
    pub user_id: String,
    #[serde(flatten)]
    pub outcome: UserOutcome,
}

/// Aggregate result of one signal fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct SignalBatchResult {
    pub success: bool,
    pub total_users: usize,
    pub executed_trades: usize,
    pub denied: usize,
    pub failed: usize,
    pub decision: Option<MarketDecision>,
    pub message: String,
    pub executions: Vec<UserExecution>,
}

impl SignalBatchResult {
    fn aborted(message: String) -> Self {
        Self {
            success: false,
            total_users: 0,
            executed_trades: 0,
            denied: 0,
            failed: 0,
            decision: None,
            message,
            executions: Vec::new(),
        }
    }
}

/// A settlement the ledger refused; reconciliation retries these.
#[derive(Debug, Clone)]
pub struct PendingSettlement {
    pub position: Position,
    pub exit_price: f64,
    pub reason: String,
}

struct CachedPrice {
    price: Price,
    fetched_at: Instant,
}

pub struct BalanceTradingEngine {
    config: EngineConfig,
    adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>>,
    tracker: Arc<PositionTracker>,
    users: Arc<UserRepository>,
    ledger: Arc<LedgerRepository>,
    validator: PlanValidator,
    sizer: PositionSizer,
    decision_strategy: Arc<dyn DecisionStrategy>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    price_cache: Mutex<LruCache<(Exchange, String), CachedPrice>>,
    pending_settlements: Mutex<Vec<PendingSettlement>>,
    listener_started: AtomicBool,
    distribute_pnl: AtomicBool,
}

impl BalanceTradingEngine {
    pub fn new(
        config: EngineConfig,
        adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>>,
        tracker: Arc<PositionTracker>,
        users: Arc<UserRepository>,
        ledger: Arc<LedgerRepository>,
        decision_strategy: Arc<dyn DecisionStrategy>,
    ) -> Self {
        let validator = PlanValidator::new(config.validator.clone());
        let sizer = PositionSizer::new(config.min_order_notional_usd);
        let cache_capacity = NonZeroUsize::new(config.price_cache_capacity.max(1))
            .expect("capacity is at least 1");

        Self {
            config,
            adapters,
            tracker,
            users,
            ledger,
            validator,
            sizer,
            decision_strategy,
            user_locks: Mutex::new(HashMap::new()),
            price_cache: Mutex::new(LruCache::new(cache_capacity)),
            pending_settlements: Mutex::new(Vec::new()),
            listener_started: AtomicBool::new(false),
            distribute_pnl: AtomicBool::new(true),
        }
    }

    pub fn tracker(&self) -> &Arc<PositionTracker> {
        &self.tracker
    }

    pub fn validator(&self) -> &PlanValidator {
        &self.validator
    }

    /// Fan one signal out across every trading-enabled account.
    pub async fn process_signal_for_all_users(&self, signal: &Signal) -> SignalBatchResult {
        if let Err(reason) = signal.validate() {
            return SignalBatchResult::aborted(format!("invalid signal: {}", reason));
        }

        let users = match self.users.eligible().await {
            Ok(users) => users,
            Err(e) => {
                error!("eligible-user fetch failed: {}", e);
                return SignalBatchResult::aborted(format!("user store unavailable: {}", e));
            }
        };

        if users.is_empty() {
            return SignalBatchResult {
                success: true,
                message: "no eligible users".to_string(),
                ..SignalBatchResult::aborted(String::new())
            };
        }

        // One market decision per signal, shared by every user execution.
        let decision = match self.shared_decision(signal).await {
            Ok(decision) => decision,
            Err(e) => {
                error!("market decision unavailable for {}: {}", signal.symbol, e);
                return SignalBatchResult::aborted(format!(
                    "market data unavailable for {}: {}",
                    signal.symbol, e
                ));
            }
        };
        info!(
            "signal {} {} decision: {} (confidence {:.2})",
            signal.action, signal.symbol, decision.reasoning, decision.confidence
        );

        let total_users = users.len();
        let executions: Vec<UserExecution> = stream::iter(users)
            .map(|user| self.execute_for_user(user, signal, &decision))
            .buffer_unordered(self.config.max_concurrent_executions.max(1))
            .collect()
            .await;

        let executed_trades = executions
            .iter()
            .filter(|execution| matches!(execution.outcome, UserOutcome::Executed { .. }))
            .count();
        let denied = executions
            .iter()
            .filter(|execution| matches!(execution.outcome, UserOutcome::Denied { .. }))
            .count();
        let failed = total_users - executed_trades - denied;

        SignalBatchResult {
            success: true,
            total_users,
            executed_trades,
            denied,
            failed,
            message: format!(
                "{} of {} users executed, {} denied, {} failed",
                executed_trades, total_users, denied, failed
            ),
            decision: Some(decision),
            executions,
        }
    }

    /// Fan-out plus lifecycle semantics: the fill listener settles each
    /// position once the venue reports it closed, and `distribute_pnl`
    /// decides whether settlement moves balances or only records.
    pub async fn process_trade_lifecycle(
        &self,
        signal: &Signal,
        distribute_pnl: bool,
    ) -> SignalBatchResult {
        self.distribute_pnl.store(distribute_pnl, Ordering::SeqCst);
        if !self.listener_started.load(Ordering::SeqCst) {
            warn!("settlement listener not running; venue closes will wait for reconciliation");
        }
        self.process_signal_for_all_users(signal).await
    }

    /// Subscribe to every adapter's fill stream. Call once after wiring the
    /// engine; later calls are no-ops.
    pub fn spawn_settlement_listener(engine: &Arc<Self>) {
        if engine.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }

        for adapter in engine.adapters.values() {
            let mut fills = adapter.subscribe_fills();
            let engine = Arc::clone(engine);
            let venue = adapter.exchange();
            tokio::spawn(async move {
                info!("settlement listener started for {}", venue);
                loop {
                    match fills.recv().await {
                        Ok(event) => engine.handle_fill(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Reconciliation closes whatever we missed.
                            warn!("fill stream on {} lagged by {}", venue, missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("fill stream on {} closed", venue);
                            break;
                        }
                    }
                }
            });
        }
    }

    /// Settle one venue-reported close. Safe to call for events the engine
    /// has already processed.
    pub async fn handle_fill(&self, event: FillEvent) {
        let exit_price = match Price::new(event.exit_price) {
            Ok(price) => price,
            Err(e) => {
                warn!(
                    "discarding fill for {} with bad exit price {}: {}",
                    event.operation_id, event.exit_price, e
                );
                return;
            }
        };

        let outcome = self.tracker.close(&event.operation_id, exit_price);
        if !outcome.changed {
            debug!("fill for {} already handled", event.operation_id);
            return;
        }

        if let Some(position) = outcome.position {
            self.settle_position(&position, exit_price, &event.reason)
                .await;
        }
    }

    /// Manually close one operation. Converges with a venue-driven close of
    /// the same operation: whichever settles first wins, the other path is
    /// a no-op. Returns whether the operation was still open locally when
    /// the call started.
    pub async fn close_operation(
        &self,
        operation_id: &str,
        reason: &str,
    ) -> Result<bool, ExecutionError> {
        let position = match self.tracker.get(operation_id) {
            Some(position) => position,
            None => {
                debug!("close_operation: {} not tracked, nothing to do", operation_id);
                return Ok(false);
            }
        };

        let adapter = self.adapter_for(position.exchange)?;
        let ack = self
            .with_retry(position.exchange, "close_position", || {
                adapter.close_position(&position.user_id, operation_id, reason)
            })
            .await?;
        if ack.already_closed {
            debug!("venue had already closed {}", operation_id);
        }

        let exit_price = self
            .current_price(position.exchange, &position.symbol)
            .await
            .unwrap_or(position.entry_price);

        // The venue's fill event may have raced us here; both closes are
        // idempotent, so exactly one settlement happens either way.
        let outcome = self.tracker.close(operation_id, exit_price);
        if outcome.changed {
            if let Some(closed) = outcome.position {
                self.settle_position(&closed, exit_price, reason).await;
            }
        }
        Ok(true)
    }

    /// Close a position locally when the venue no longer holds it (the
    /// venue's absence of the order is authoritative for closure). Settles
    /// through the normal path; a position that was already closed and
    /// settled comes out unchanged.
    pub async fn close_locally(&self, position: &Position, exit_price: Price, reason: &str) {
        let outcome = self.tracker.close(&position.operation_id, exit_price);
        let closed = match outcome.position {
            Some(tracked) => tracked,
            None => {
                // Not in the tracker (restart, or ledger-only row): settle
                // from the caller's view of the position.
                let mut synthesized = position.clone();
                synthesized.mark_closed(exit_price, Utc::now());
                synthesized
            }
        };
        self.settle_position(&closed, exit_price, reason).await;
    }

    /// Retry settlements the ledger previously refused: the in-memory queue
    /// first, then persisted `closed_unsettled` rows. Returns how many were
    /// settled. Called by the reconciliation sweep.
    pub async fn retry_unsettled(&self) -> usize {
        let mut settled = 0;

        let queued: Vec<PendingSettlement> =
            self.pending_settlements.lock().await.drain(..).collect();
        for pending in queued {
            if let Ok(exit_price) = Price::new(pending.exit_price) {
                if self
                    .settle_position(&pending.position, exit_price, &pending.reason)
                    .await
                {
                    settled += 1;
                }
            }
        }

        let rows = match self.ledger.unsettled().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("cannot list unsettled ledger rows: {}", e);
                return settled;
            }
        };

        for row in rows {
            let pnl = match row.profit_loss_usd {
                Some(pnl) => pnl,
                None => continue,
            };
            let user = match self.users.get(&row.user_id).await {
                Ok(Some(user)) => user,
                _ => {
                    warn!("unsettled row {} has unknown user {}", row.operation_id, row.user_id);
                    continue;
                }
            };
            let rate = self.validator.config().policy_for(user.plan).commission_rate;
            let split = split_for_plan(user.plan, pnl, rate);
            let distribute =
                self.distribute_pnl.load(Ordering::SeqCst) && !split.recorded_only;
            match self
                .ledger
                .settle_close(
                    &row.operation_id,
                    &row.user_id,
                    row.exit_price.unwrap_or(row.entry_price),
                    row.exit_time.unwrap_or_else(Utc::now),
                    pnl,
                    split.commission_usd,
                    split.user_delta_usd,
                    distribute,
                )
                .await
            {
                Ok(SettleOutcome::Settled) => {
                    info!("retried settlement for {}", row.operation_id);
                    settled += 1;
                }
                Ok(SettleOutcome::AlreadySettled) => {}
                Err(e) => warn!("settlement retry for {} failed: {}", row.operation_id, e),
            }
        }

        settled
    }

    /// Snapshot of settlements still waiting on a ledger retry.
    pub async fn pending_settlement_count(&self) -> usize {
        self.pending_settlements.lock().await.len()
    }

    // ---- per-user execution -------------------------------------------------

    async fn execute_for_user(
        &self,
        user: UserAccount,
        signal: &Signal,
        decision: &MarketDecision,
    ) -> UserExecution {
        // Per-user serialization: two signals close together must not both
        // pass the concurrency/cooldown checks.
        let lock = self.user_lock(&user.id).await;
        let _guard = lock.lock().await;

        let user_id = user.id.clone();
        match self.try_execute(&user, signal, decision).await {
            Ok(outcome) => {
                match &outcome {
                    UserOutcome::Executed { operation_id, .. } => {
                        info!("executed {} for {}", operation_id, user_id);
                    }
                    UserOutcome::Denied { reasons, .. } => {
                        // A denial is a decision, not an error.
                        debug!("denied {}: {}", user_id, reasons.join("; "));
                    }
                    UserOutcome::Failed { .. } => {}
                }
                UserExecution {
                    user_id,
                    outcome,
                }
            }
            Err(e) => {
                warn!("execution failed for {}: {}", user_id, e);
                UserExecution {
                    user_id,
                    outcome: UserOutcome::Failed {
                        error: e.to_string(),
                    },
                }
            }
        }
    }

    async fn try_execute(
        &self,
        user: &UserAccount,
        signal: &Signal,
        _decision: &MarketDecision,
    ) -> Result<UserOutcome, ExecutionError> {
        let exchange = self.route_exchange(user);
        let adapter = self.adapter_for(exchange)?;
        let price = self.current_price(exchange, &signal.symbol).await?;

        let activity = self.tracker.activity_for(&user.id);
        let intended_margin =
            user.balances.operational_usd() * user.risk_level.position_size_fraction();
        let request = OperationRequest {
            exchange,
            symbol: signal.symbol.clone(),
            amount_usd: intended_margin,
        };

        let verdict = self.validator.validate(user, &request, &activity);
        if !verdict.allowed {
            return Ok(UserOutcome::Denied {
                trading_mode: verdict.trading_mode,
                reasons: verdict.reasons.iter().map(|r| r.to_string()).collect(),
            });
        }

        // Plan position cap, on top of the validator's trailing-window check.
        let open_count = self.tracker.open_count_for(&user.id);
        if open_count >= verdict.limits.max_positions {
            return Ok(UserOutcome::Denied {
                trading_mode: verdict.trading_mode,
                reasons: vec![format!(
                    "position limit reached: {} of {} open",
                    open_count, verdict.limits.max_positions
                )],
            });
        }

        if self.tracker.has_open(&user.id, exchange, &signal.symbol) {
            return Err(ExecutionError::DuplicatePosition {
                user_id: user.id.clone(),
                exchange,
                symbol: signal.symbol.clone(),
            });
        }

        let sized = self
            .sizer
            .size_order(user.balances.operational_usd(), &verdict.limits, price)?;

        let side = match signal.action {
            SignalAction::Buy => PositionSide::Long,
            SignalAction::Sell => PositionSide::Short,
        };
        let operation_id = generate_operation_id();
        let spec = OrderSpec {
            operation_id: operation_id.clone(),
            symbol: signal.symbol.clone(),
            side,
            quantity: sized.quantity,
            price: None, // market
            leverage: sized.leverage,
        };

        let ack = self
            .with_retry(exchange, "place_order", || {
                adapter.place_order(&user.id, &spec)
            })
            .await?;
        debug!(
            "order {} accepted on {} as {} ({})",
            operation_id, exchange, ack.order_id, ack.status
        );

        let mut position = Position::open(
            operation_id.clone(),
            user.id.clone(),
            signal.symbol.clone(),
            side,
            price,
            sized.quantity,
            sized.leverage,
            exchange,
        );
        let (stop_loss, take_profit) = derived_protective_prices(side, price);
        position.stop_loss = Price::new(stop_loss).ok();
        position.take_profit = Price::new(take_profit).ok();

        if let Err(e) = self.tracker.open(position.clone()) {
            // Lost a race despite the per-user lock (e.g. reconciliation
            // adopted the same symbol meanwhile). Unwind the venue order.
            warn!("registration lost race for {}: {}", operation_id, e);
            let _ = adapter
                .close_position(&user.id, &operation_id, "duplicate registration")
                .await;
            return Err(e);
        }

        if let Err(e) = self
            .ledger
            .insert_open(&CreateLedgerEntry::from_position(&position))
            .await
        {
            // The position is live on the venue and tracked; reconciliation
            // will adopt the missing ledger row.
            warn!("ledger OPEN write failed for {}: {}", operation_id, e);
        }

        Ok(UserOutcome::Executed {
            operation_id,
            exchange,
            quantity: sized.quantity.value(),
            entry_price: price.value(),
            notional_usd: sized.notional_usd,
        })
    }

    /// Returns true when this call performed the settlement.
    async fn settle_position(&self, position: &Position, exit_price: Price, reason: &str) -> bool {
        let pnl = position
            .profit_loss_usd
            .unwrap_or_else(|| position.unrealized_pnl(exit_price));

        let user = match self.users.get(&position.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                error!(
                    "settlement for {}: user {} not found",
                    position.operation_id, position.user_id
                );
                self.queue_pending(position, exit_price, reason, pnl).await;
                return false;
            }
            Err(e) => {
                error!(
                    "settlement for {}: user lookup failed: {}",
                    position.operation_id, e
                );
                self.queue_pending(position, exit_price, reason, pnl).await;
                return false;
            }
        };

        let rate = self.validator.config().policy_for(user.plan).commission_rate;
        let split = split_for_plan(user.plan, pnl, rate);
        let distribute = self.distribute_pnl.load(Ordering::SeqCst) && !split.recorded_only;

        match self
            .ledger
            .settle_close(
                &position.operation_id,
                &position.user_id,
                exit_price.value(),
                position.exit_time.unwrap_or_else(Utc::now),
                pnl,
                split.commission_usd,
                split.user_delta_usd,
                distribute,
            )
            .await
        {
            Ok(SettleOutcome::Settled) => {
                info!(
                    "settled {} ({}): pnl {:.2}, commission {:.2}, user delta {:.2}",
                    position.operation_id,
                    reason,
                    pnl,
                    split.commission_usd,
                    split.user_delta_usd
                );
                true
            }
            Ok(SettleOutcome::AlreadySettled) => {
                debug!("{} was already settled", position.operation_id);
                false
            }
            Err(e) => {
                error!(
                    "ledger settlement for {} failed: {}",
                    position.operation_id, e
                );
                self.queue_pending(position, exit_price, reason, pnl).await;
                false
            }
        }
    }

    async fn queue_pending(&self, position: &Position, exit_price: Price, reason: &str, pnl: f64) {
        // Best effort: persist the CLOSED-UNSETTLED marker so a restart
        // still finds the debt; the in-memory queue covers the case where
        // even that write fails.
        let _ = self
            .ledger
            .mark_unsettled(&position.operation_id, exit_price.value(), pnl)
            .await;

        let mut position = position.clone();
        position.status = crate::domain::entities::position::PositionStatus::ClosedUnsettled;
        self.pending_settlements.lock().await.push(PendingSettlement {
            position,
            exit_price: exit_price.value(),
            reason: reason.to_string(),
        });
    }

    // ---- shared context -----------------------------------------------------

    async fn shared_decision(&self, signal: &Signal) -> Result<MarketDecision, ExecutionError> {
        // Prefer the default live venue's quote; fall back to any venue that
        // answers so a paper-only deployment still gets a decision.
        let mut last_error = ExecutionError::AdapterMissing {
            exchange: self.config.default_exchange,
        };

        let mut venues: Vec<Exchange> = vec![self.config.default_exchange];
        venues.extend(self.adapters.keys().copied().filter(|venue| *venue != self.config.default_exchange));

        for venue in venues {
            if !self.adapters.contains_key(&venue) {
                continue;
            }
            match self.current_price(venue, &signal.symbol).await {
                Ok(price) => {
                    let snapshot = MarketSnapshot {
                        symbol: signal.symbol.clone(),
                        current_price: price.value(),
                    };
                    return Ok(self.decision_strategy.decide(signal, &snapshot));
                }
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    fn route_exchange(&self, user: &UserAccount) -> Exchange {
        match user.plan {
            PlanType::Trial => Exchange::Testnet,
            PlanType::Pro | PlanType::Flex => self.config.default_exchange,
        }
    }

    fn adapter_for(&self, exchange: Exchange) -> Result<Arc<dyn ExchangeAdapter>, ExecutionError> {
        self.adapters
            .get(&exchange)
            .cloned()
            .ok_or(ExecutionError::AdapterMissing { exchange })
    }

    async fn current_price(
        &self,
        exchange: Exchange,
        symbol: &str,
    ) -> Result<Price, ExecutionError> {
        let ttl = Duration::from_millis(self.config.price_cache_ttl_ms);
        let key = (exchange, symbol.to_string());

        {
            let mut cache = self.price_cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                if cached.fetched_at.elapsed() < ttl {
                    return Ok(cached.price);
                }
            }
        }

        let adapter = self.adapter_for(exchange)?;
        let price = self
            .with_retry(exchange, "symbol_price", || adapter.symbol_price(symbol))
            .await?;

        self.price_cache.lock().await.put(
            key,
            CachedPrice {
                price,
                fetched_at: Instant::now(),
            },
        );
        Ok(price)
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn with_retry<T, F, Fut>(
        &self,
        exchange: Exchange,
        operation: &str,
        mut call: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        let attempts = self.config.exchange_retry_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.exchange_retry_initial_delay_ms);

        for attempt in 1..=attempts {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "{} on {} failed (attempt {}/{}): {}",
                        operation, exchange, attempt, attempts, e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(map_adapter_error(exchange, e)),
            }
        }

        unreachable!("retry loop always returns")
    }
}

fn map_adapter_error(exchange: Exchange, error: AdapterError) -> ExecutionError {
    if error.is_retryable() {
        ExecutionError::ExchangeUnavailable {
            exchange,
            reason: error.to_string(),
        }
    } else {
        ExecutionError::OrderRejected {
            reason: error.to_string(),
        }
    }
}

fn generate_operation_id() -> String {
    let nonce: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("op_{}_{:06x}", Utc::now().timestamp_millis(), nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::user::{
        AccountBalances, RiskLevel, SubscriptionStatus,
    };
    use crate::domain::services::decision::PriceDriftThresholds;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use crate::persistence::init_database;

    pub(crate) fn account(id: &str, plan: PlanType, real_usd: f64) -> UserAccount {
        UserAccount {
            id: id.to_string(),
            plan,
            subscription_status: SubscriptionStatus::Active,
            subscription_expires_at: None,
            trading_enabled: true,
            risk_level: RiskLevel::Moderate,
            balances: AccountBalances {
                real_usd,
                admin_usd: 0.0,
                commission_usd: 0.0,
            },
        }
    }

    pub(crate) struct Harness {
        pub engine: Arc<BalanceTradingEngine>,
        pub live: Arc<PaperExchange>,
        pub testnet: Arc<PaperExchange>,
        pub users: Arc<UserRepository>,
        pub ledger: Arc<LedgerRepository>,
    }

    pub(crate) async fn harness(accounts: &[UserAccount]) -> Harness {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let users = Arc::new(UserRepository::new(pool.clone()));
        let ledger = Arc::new(LedgerRepository::new(pool));
        for account in accounts {
            users.upsert(account).await.unwrap();
        }

        let live = Arc::new(PaperExchange::new(Exchange::Binance));
        live.set_price("BTC-USD", 50000.0);
        let testnet = Arc::new(PaperExchange::new(Exchange::Testnet));
        testnet.set_price("BTC-USD", 50000.0);

        let mut adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(Exchange::Binance, live.clone());
        adapters.insert(Exchange::Testnet, testnet.clone());

        let engine = Arc::new(BalanceTradingEngine::new(
            EngineConfig::default(),
            adapters,
            Arc::new(PositionTracker::new()),
            users.clone(),
            ledger.clone(),
            Arc::new(PriceDriftThresholds::default()),
        ));
        BalanceTradingEngine::spawn_settlement_listener(&engine);

        Harness {
            engine,
            live,
            testnet,
            users,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_batch_has_one_entry_per_eligible_user() {
        let accounts = vec![
            account("user-1", PlanType::Pro, 1000.0),
            account("user-2", PlanType::Flex, 1000.0),
            account("user-3", PlanType::Flex, 50.0), // denied: below minimum
            account("user-4", PlanType::Trial, 0.0), // fails sizing on testnet
        ];
        let h = harness(&accounts).await;

        let signal = Signal::new("BTC-USD", SignalAction::Buy);
        let result = h.engine.process_signal_for_all_users(&signal).await;

        assert!(result.success);
        assert_eq!(result.total_users, 4);
        assert_eq!(result.executions.len(), 4);
        assert_eq!(result.executed_trades, 2);
        assert!(result.denied >= 1);

        let mut user_ids: Vec<&str> = result
            .executions
            .iter()
            .map(|e| e.user_id.as_str())
            .collect();
        user_ids.sort();
        assert_eq!(user_ids, vec!["user-1", "user-2", "user-3", "user-4"]);
    }

    #[tokio::test]
    async fn test_trial_never_reaches_live_venue() {
        let accounts = vec![{
            let mut trial = account("trial-1", PlanType::Trial, 0.0);
            trial.balances.admin_usd = 500.0; // demo credit
            trial
        }];
        let h = harness(&accounts).await;

        let signal = Signal::new("BTC-USD", SignalAction::Buy);
        let result = h.engine.process_signal_for_all_users(&signal).await;

        assert_eq!(result.executed_trades, 1);
        assert_eq!(h.live.open_order_count("trial-1"), 0);
        assert_eq!(h.testnet.open_order_count("trial-1"), 1);
    }

    #[tokio::test]
    async fn test_sizing_respects_plan_bound() {
        let accounts = vec![account("user-1", PlanType::Flex, 1000.0)];
        let h = harness(&accounts).await;

        let signal = Signal::new("BTC-USD", SignalAction::Buy);
        let result = h.engine.process_signal_for_all_users(&signal).await;

        match &result.executions[0].outcome {
            UserOutcome::Executed { notional_usd, .. } => {
                // 1000 * 0.10 fraction * 10x flex leverage
                assert!(*notional_usd <= 1000.0 * 0.10 * 10.0 + 1e-9);
            }
            other => panic!("expected execution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_signal_within_cooldown_denied() {
        let accounts = vec![account("user-1", PlanType::Pro, 1000.0)];
        let h = harness(&accounts).await;

        let signal = Signal::new("BTC-USD", SignalAction::Buy);
        let first = h.engine.process_signal_for_all_users(&signal).await;
        assert_eq!(first.executed_trades, 1);

        let second = h.engine.process_signal_for_all_users(&signal).await;
        assert_eq!(second.executed_trades, 0);
        assert_eq!(second.denied, 1);
        assert_eq!(h.engine.tracker().open_count_for("user-1"), 1);
    }

    #[tokio::test]
    async fn test_transient_venue_failure_is_retried() {
        let accounts = vec![account("user-1", PlanType::Pro, 1000.0)];
        let h = harness(&accounts).await;

        // Two failures, then success: within the 3-attempt budget. The
        // price fetch consumes the failures, the order succeeds.
        h.live.fail_next_requests(2);

        let signal = Signal::new("BTC-USD", SignalAction::Buy);
        let result = h.engine.process_signal_for_all_users(&signal).await;
        assert_eq!(result.executed_trades, 1, "{}", result.message);
    }

    #[tokio::test]
    async fn test_close_operation_settles_once() {
        let accounts = vec![account("user-1", PlanType::Flex, 1000.0)];
        let h = harness(&accounts).await;

        let signal = Signal::new("BTC-USD", SignalAction::Buy);
        let result = h.engine.process_signal_for_all_users(&signal).await;
        let operation_id = match &result.executions[0].outcome {
            UserOutcome::Executed { operation_id, .. } => operation_id.clone(),
            other => panic!("expected execution, got {:?}", other),
        };

        h.live.set_price("BTC-USD", 51000.0);
        let changed = h.engine.close_operation(&operation_id, "manual").await.unwrap();
        assert!(changed);

        // Second close converges with no error and no second settlement.
        let again = h.engine.close_operation(&operation_id, "manual").await.unwrap();
        assert!(!again);

        let row = h.ledger.get(&operation_id).await.unwrap().unwrap();
        assert_eq!(row.status, "closed");
        // notional 1000: 0.02 BTC at 50000; exit 51000 → pnl 20, flex
        // commission 4, user nets 16 on top of 1000.
        let user = h.users.get("user-1").await.unwrap().unwrap();
        assert!((user.balances.real_usd - 1016.0).abs() < 1e-6);
        assert!((user.balances.commission_usd - 4.0).abs() < 1e-6);
    }
}
