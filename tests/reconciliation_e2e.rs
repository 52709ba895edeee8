//! End-to-end tests for exchange/ledger reconciliation
//!
//! Covers the three discrepancy kinds, sweep idempotence, unsettled-close
//! retries, and the actor's message surface, all over paper venues and an
//! in-memory ledger.

use std::collections::HashMap;
use std::sync::Arc;

use tradecast::application::actors::reconciliation_actor::{
    ReconciliationActor, ReconciliationMessage,
};
use tradecast::application::services::trading_engine::{BalanceTradingEngine, UserOutcome};
use tradecast::config::{EngineConfig, ReconciliationConfig};
use tradecast::domain::entities::exchange::Exchange;
use tradecast::domain::entities::position::PositionSide;
use tradecast::domain::entities::signal::{Signal, SignalAction};
use tradecast::domain::entities::user::{
    AccountBalances, PlanType, RiskLevel, SubscriptionStatus, UserAccount,
};
use tradecast::domain::repositories::exchange_adapter::ExchangeAdapter;
use tradecast::domain::services::decision::PriceDriftThresholds;
use tradecast::domain::services::position_tracker::PositionTracker;
use tradecast::domain::services::reconciliation::DiscrepancyKind;
use tradecast::infrastructure::paper_exchange::PaperExchange;
use tradecast::persistence::init_database;
use tradecast::persistence::models::CreateLedgerEntry;
use tradecast::persistence::repository::{LedgerRepository, UserRepository};

struct Harness {
    engine: Arc<BalanceTradingEngine>,
    actor: ReconciliationActor,
    live: Arc<PaperExchange>,
    tracker: Arc<PositionTracker>,
    users: Arc<UserRepository>,
    ledger: Arc<LedgerRepository>,
}

fn account(id: &str, plan: PlanType, real_usd: f64) -> UserAccount {
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

async fn harness(accounts: &[UserAccount]) -> Harness {
    let pool = init_database("sqlite::memory:").await.unwrap();
    let users = Arc::new(UserRepository::new(pool.clone()));
    let ledger = Arc::new(LedgerRepository::new(pool));
    for user in accounts {
        users.upsert(user).await.unwrap();
    }

    let live = Arc::new(PaperExchange::new(Exchange::Binance));
    live.set_price("BTC-USD", 50000.0);
    live.set_price("ETH-USD", 3000.0);
    let testnet = Arc::new(PaperExchange::new(Exchange::Testnet));
    testnet.set_price("BTC-USD", 50000.0);

    let mut adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>> = HashMap::new();
    adapters.insert(Exchange::Binance, live.clone());
    adapters.insert(Exchange::Testnet, testnet);

    let tracker = Arc::new(PositionTracker::new());
    let engine = Arc::new(BalanceTradingEngine::new(
        EngineConfig::default(),
        adapters.clone(),
        tracker.clone(),
        users.clone(),
        ledger.clone(),
        Arc::new(PriceDriftThresholds::default()),
    ));

    let actor = ReconciliationActor::new(
        engine.clone(),
        adapters,
        tracker.clone(),
        users.clone(),
        ledger.clone(),
        ReconciliationConfig {
            enabled: false, // tests drive reconciliation explicitly
            ..ReconciliationConfig::default()
        },
    );

    Harness {
        engine,
        actor,
        live,
        tracker,
        users,
        ledger,
    }
}

async fn execute_one(h: &Harness, user_id: &str) -> String {
    let signal = Signal::new("BTC-USD", SignalAction::Buy);
    let result = h.engine.process_signal_for_all_users(&signal).await;
    let execution = result
        .executions
        .iter()
        .find(|execution| execution.user_id == user_id)
        .expect("user in batch");
    match &execution.outcome {
        UserOutcome::Executed { operation_id, .. } => operation_id.clone(),
        other => panic!("expected execution for {}, got {:?}", user_id, other),
    }
}

#[tokio::test]
async fn orphan_on_exchange_is_adopted_as_open() {
    let h = harness(&[account("user-1", PlanType::Pro, 1000.0)]).await;

    // The venue holds a position this engine never placed.
    h.live.inject_order("user-1", "venue-7", "ETH-USD", PositionSide::Long, 2.0, 2900.0);

    let discrepancies = h.actor.reconcile_user("user-1").await.unwrap();
    assert_eq!(discrepancies.len(), 1);
    assert_eq!(discrepancies[0].kind, DiscrepancyKind::OrphanOnExchange);

    // Adopted into the tracker and the ledger as OPEN.
    let adopted = h.tracker.get("venue-7").expect("tracked after adoption");
    assert_eq!(adopted.symbol, "ETH-USD");
    assert_eq!(adopted.entry_price.value(), 2900.0);

    let row = h.ledger.get("venue-7").await.unwrap().unwrap();
    assert_eq!(row.status, "open");

    // Idempotence: nothing changed on the venue, second pass is clean.
    let second = h.actor.reconcile_user("user-1").await.unwrap();
    assert!(second.is_empty(), "second pass found {:?}", second);
}

#[tokio::test]
async fn orphan_locally_is_closed_at_last_known_price_and_settled() {
    let h = harness(&[account("flex-1", PlanType::Flex, 1000.0)]).await;
    let operation_id = execute_one(&h, "flex-1").await;

    // The venue closed the position while nobody was listening.
    assert!(h.live.vanish_order(&operation_id));
    h.live.set_price("BTC-USD", 55000.0);

    let discrepancies = h.actor.reconcile_user("flex-1").await.unwrap();
    assert_eq!(discrepancies.len(), 1);
    assert_eq!(discrepancies[0].kind, DiscrepancyKind::OrphanLocally);

    // Closed locally at the last known price and settled through the
    // normal path: 0.02 BTC x +5000 = +100, FLEX keeps 80.
    assert_eq!(h.tracker.open_count_for("flex-1"), 0);
    let row = h.ledger.get(&operation_id).await.unwrap().unwrap();
    assert_eq!(row.status, "closed");
    assert_eq!(row.profit_loss_usd, Some(100.0));

    let user = h.users.get("flex-1").await.unwrap().unwrap();
    assert!((user.balances.real_usd - 1080.0).abs() < 1e-6);
    assert!((user.balances.commission_usd - 20.0).abs() < 1e-6);

    let second = h.actor.reconcile_user("flex-1").await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn field_mismatch_is_overwritten_from_exchange_values() {
    let h = harness(&[account("user-1", PlanType::Pro, 1000.0)]).await;
    let operation_id = execute_one(&h, "user-1").await;
    let original = h.tracker.get(&operation_id).unwrap();

    // The venue reports a different size for the same position (partial
    // close on the venue side).
    let half = original.size.value() / 2.0;
    assert!(h.live.vanish_order(&operation_id));
    h.live.inject_order(
        "user-1",
        &operation_id,
        "BTC-USD",
        PositionSide::Long,
        half,
        original.entry_price.value(),
    );

    let discrepancies = h.actor.reconcile_user("user-1").await.unwrap();
    assert_eq!(discrepancies.len(), 1);
    assert_eq!(discrepancies[0].kind, DiscrepancyKind::FieldMismatch);

    // Exchange values win, locally and in the ledger.
    let updated = h.tracker.get(&operation_id).unwrap();
    assert!((updated.size.value() - half).abs() < 1e-12);
    let row = h.ledger.get(&operation_id).await.unwrap().unwrap();
    assert!((row.quantity - half).abs() < 1e-12);

    let second = h.actor.reconcile_user("user-1").await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn unsettled_closes_are_retried_by_the_sweep() {
    let h = harness(&[account("flex-1", PlanType::Flex, 1000.0)]).await;

    // A close whose settlement write failed: the row sits CLOSED-UNSETTLED
    // with its realized PnL recorded.
    let entry = CreateLedgerEntry {
        operation_id: "op-unsettled".to_string(),
        user_id: "flex-1".to_string(),
        symbol: "ETH-USD".to_string(),
        side: PositionSide::Long,
        entry_price: 3000.0,
        quantity: 1.0,
        leverage: 2.0,
        entry_time: chrono::Utc::now(),
        exchange: Exchange::Binance,
    };
    h.ledger.insert_open(&entry).await.unwrap();
    h.ledger
        .mark_unsettled("op-unsettled", 3100.0, 100.0)
        .await
        .unwrap();

    let settled = h.engine.retry_unsettled().await;
    assert_eq!(settled, 1);

    let row = h.ledger.get("op-unsettled").await.unwrap().unwrap();
    assert_eq!(row.status, "closed");

    // FLEX split applied on retry: 20 commission, 80 to the user.
    let user = h.users.get("flex-1").await.unwrap().unwrap();
    assert!((user.balances.real_usd - 1080.0).abs() < 1e-6);
    assert!((user.balances.commission_usd - 20.0).abs() < 1e-6);

    // Nothing left to retry.
    assert_eq!(h.engine.retry_unsettled().await, 0);
}

#[tokio::test]
async fn reconciliation_failure_for_one_user_never_kills_the_sweep() {
    let h = harness(&[
        account("user-1", PlanType::Pro, 1000.0),
        account("user-2", PlanType::Pro, 1000.0),
    ])
    .await;

    // One user's venue data is there; then the venue goes down, so the
    // sweep sees per-user failures but still returns.
    h.live.inject_order("user-2", "venue-9", "ETH-USD", PositionSide::Short, 1.0, 3000.0);
    h.live.fail_next_requests(1);

    // First user hits the injected failures and errors out; the call
    // surface reports it without panicking.
    let first = h.actor.reconcile_user("user-1").await;
    assert!(first.is_err());

    // The next user reconciles fine.
    let second = h.actor.reconcile_user("user-2").await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].kind, DiscrepancyKind::OrphanOnExchange);
}

#[tokio::test]
async fn actor_message_surface_reconciles_and_reports_stats() {
    let pool = init_database("sqlite::memory:").await.unwrap();
    let users = Arc::new(UserRepository::new(pool.clone()));
    let ledger = Arc::new(LedgerRepository::new(pool));
    users.upsert(&account("user-1", PlanType::Pro, 1000.0)).await.unwrap();

    let live = Arc::new(PaperExchange::new(Exchange::Binance));
    live.set_price("BTC-USD", 50000.0);
    let mut adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>> = HashMap::new();
    adapters.insert(Exchange::Binance, live.clone());

    let tracker = Arc::new(PositionTracker::new());
    let engine = Arc::new(BalanceTradingEngine::new(
        EngineConfig::default(),
        adapters.clone(),
        tracker.clone(),
        users.clone(),
        ledger.clone(),
        Arc::new(PriceDriftThresholds::default()),
    ));

    let sender = ReconciliationActor::spawn(
        engine,
        adapters,
        tracker,
        users,
        ledger,
        ReconciliationConfig {
            enabled: false,
            ..ReconciliationConfig::default()
        },
    );

    live.inject_order("user-1", "venue-1", "BTC-USD", PositionSide::Long, 0.5, 49000.0);

    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel(1);
    sender
        .send(ReconciliationMessage::ReconcileUser {
            user_id: "user-1".to_string(),
            reply: reply_tx,
        })
        .await
        .unwrap();
    let discrepancies = reply_rx.recv().await.unwrap().unwrap();
    assert_eq!(discrepancies.len(), 1);

    let (stats_tx, mut stats_rx) = tokio::sync::mpsc::channel(1);
    sender
        .send(ReconciliationMessage::GetStats { reply: stats_tx })
        .await
        .unwrap();
    let stats = stats_rx.recv().await.unwrap();
    assert_eq!(stats.adopted_from_exchange, 1);
    assert_eq!(stats.total_sweeps, 1);

    sender.send(ReconciliationMessage::Shutdown).await.unwrap();
}
