mod application;
mod config;
mod domain;
mod infrastructure;
mod persistence;
mod rate_limit;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::application::actors::reconciliation_actor::{
    trigger_reconcile_user, ReconciliationActor, ReconciliationMessage,
};
use crate::application::services::position_service::{
    PositionManagementService, PositionViewError,
};
use crate::application::services::trading_engine::BalanceTradingEngine;
use crate::config::EngineConfig;
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::signal::Signal;
use crate::domain::repositories::exchange_adapter::ExchangeAdapter;
use crate::domain::services::decision::PriceDriftThresholds;
use crate::domain::services::position_tracker::PositionTracker;
use crate::infrastructure::credentials::ApiCredentials;
use crate::infrastructure::paper_exchange::PaperExchange;
use crate::infrastructure::rest_exchange::{RestExchange, RestExchangeConfig};
use crate::persistence::repository::{LedgerRepository, UserRepository};
use crate::rate_limit::{create_rate_limiter, rate_limit_middleware, RateLimiterConfig};

#[derive(Clone)]
struct AppState {
    engine: Arc<BalanceTradingEngine>,
    positions: Arc<PositionManagementService>,
    reconciliation: mpsc::Sender<ReconciliationMessage>,
    users: Arc<UserRepository>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradecast=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine_config = EngineConfig::from_env();
    info!(
        "Signal executor starting (live venue: {}, fan-out concurrency: {})",
        engine_config.default_exchange, engine_config.max_concurrent_executions
    );

    let db_config = crate::persistence::DatabaseConfig::from_env();
    let pool = crate::persistence::init_database(&db_config.url).await?;
    let users = Arc::new(UserRepository::new(pool.clone()));
    let ledger = Arc::new(LedgerRepository::new(pool));

    let adapters = build_adapters(&engine_config);
    info!(
        "venues configured: {}",
        adapters
            .keys()
            .map(|venue| venue.name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let tracker = Arc::new(PositionTracker::new());
    let engine = Arc::new(BalanceTradingEngine::new(
        engine_config.clone(),
        adapters.clone(),
        tracker.clone(),
        users.clone(),
        ledger.clone(),
        Arc::new(PriceDriftThresholds::default()),
    ));
    BalanceTradingEngine::spawn_settlement_listener(&engine);

    let positions = Arc::new(PositionManagementService::new(
        adapters.clone(),
        ledger.clone(),
    ));

    let reconciliation = ReconciliationActor::spawn(
        engine.clone(),
        adapters,
        tracker,
        users.clone(),
        ledger,
        engine_config.reconciliation.clone(),
    );

    let state = AppState {
        engine,
        positions,
        reconciliation,
        users,
    };

    let limiter = create_rate_limiter(RateLimiterConfig::default());
    let signal_routes = Router::new()
        .route("/signals", post(ingest_signal))
        .route_layer(axum::middleware::from_fn(move |request, next| {
            let limiter = limiter.clone();
            async move { rate_limit_middleware(limiter, request, next).await }
        }));

    let app = Router::new()
        .route("/", get(|| async { "tradecast signal executor is running" }))
        .route("/health", get(health))
        .merge(signal_routes)
        .route("/positions/:user_id", get(current_positions))
        .route("/positions/:user_id/history", get(trade_history))
        .route("/positions/:user_id/analytics", get(analytics))
        .route("/users/:user_id/limits", get(plan_limits))
        .route("/reconcile/:user_id", post(reconcile_user))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(3005);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Wire the venue adapters: the paper testnet always exists; the live venue
/// is a signed gateway client when credentials are configured, otherwise a
/// paper stand-in so development runs end to end.
fn build_adapters(config: &EngineConfig) -> HashMap<Exchange, Arc<dyn ExchangeAdapter>> {
    let mut adapters: HashMap<Exchange, Arc<dyn ExchangeAdapter>> = HashMap::new();
    adapters.insert(Exchange::Testnet, Arc::new(PaperExchange::testnet()));

    match ApiCredentials::from_env("TRADECAST") {
        Ok(credentials) => {
            let gateway = RestExchangeConfig {
                base_url: std::env::var("GATEWAY_URL")
                    .unwrap_or_else(|_| RestExchangeConfig::default().base_url),
                ..RestExchangeConfig::default()
            };
            match RestExchange::new(config.default_exchange, gateway, credentials) {
                Ok(adapter) => {
                    let adapter = Arc::new(adapter);
                    RestExchange::spawn_fill_poller(&adapter);
                    adapters.insert(config.default_exchange, adapter);
                }
                Err(e) => {
                    error!("failed to build gateway client: {}", e);
                }
            }
        }
        Err(e) => {
            warn!(
                "no gateway credentials ({}), routing {} to a paper venue",
                e, config.default_exchange
            );
            let paper = PaperExchange::new(config.default_exchange);
            paper.set_price("BTC-USD", 50000.0);
            paper.set_price("ETH-USD", 3000.0);
            paper.set_price("SOL-USD", 100.0);
            adapters.insert(config.default_exchange, Arc::new(paper));
        }
    }

    adapters
}

// ---- handlers ---------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ingest_signal(
    State(state): State<AppState>,
    Json(signal): Json<Signal>,
) -> Response {
    info!("signal received: {} {}", signal.action, signal.symbol);
    let result = state.engine.process_trade_lifecycle(&signal, true).await;
    if result.success {
        Json(result).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(result)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PositionsQuery {
    exchange: Option<String>,
}

async fn current_positions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<PositionsQuery>,
) -> Response {
    let exchange = match query.exchange.as_deref().map(Exchange::parse) {
        Some(None) => {
            return (StatusCode::BAD_REQUEST, "unknown exchange").into_response();
        }
        Some(Some(exchange)) => Some(exchange),
        None => None,
    };

    match state.positions.positions_for_display(&user_id, exchange).await {
        Ok(positions) => Json(positions).into_response(),
        Err(PositionViewError::ExchangeUnavailable(reason)) => {
            (StatusCode::SERVICE_UNAVAILABLE, reason).into_response()
        }
        Err(e) => {
            error!("position view failed for {}: {}", user_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn trade_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    match state.positions.historical_trades(&user_id, 100).await {
        Ok(history) => Json(history).into_response(),
        Err(e) => {
            error!("history read failed for {}: {}", user_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn analytics(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    match state.positions.analytics_summary(&user_id).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            error!("analytics read failed for {}: {}", user_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn plan_limits(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    match state.users.get(&user_id).await {
        Ok(Some(user)) => {
            let (mode, limits) = state.engine.validator().limits_for(&user);
            Json(limits.view(mode)).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, "unknown user").into_response(),
        Err(e) => {
            error!("user read failed for {}: {}", user_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn reconcile_user(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    match trigger_reconcile_user(&state.reconciliation, &user_id).await {
        Ok(discrepancies) => Json(discrepancies).into_response(),
        Err(e) => {
            warn!("manual reconciliation failed for {}: {}", user_id, e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    let tracker_stats = state.engine.tracker().stats();
    let (stats_tx, mut stats_rx) = mpsc::channel(1);
    let reconciliation = state
        .reconciliation
        .send(ReconciliationMessage::GetStats { reply: stats_tx })
        .await;

    let reconciliation_stats = match reconciliation {
        Ok(()) => stats_rx.recv().await,
        Err(_) => None,
    };

    Json(serde_json::json!({
        "positions": tracker_stats,
        "reconciliation": reconciliation_stats,
        "pending_settlements": state.engine.pending_settlement_count().await,
    }))
    .into_response()
}
