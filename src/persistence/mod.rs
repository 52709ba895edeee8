//! Persistence Layer
//!
//! SQLite-backed persisted ledger: the audit trail of every operation this
//! engine executed, plus the tenant account table the billing subsystem
//! owns. The exchange stays authoritative for live state; this layer is
//! authoritative for history and analytics.
//!
//! # Schema
//!
//! ## users
//! Owned by billing/auth. The engine reads accounts and writes only balance
//! deltas on settlement.
//!
//! ## ledger
//! One row per operation: OPEN on placement, CLOSED (or CLOSED_UNSETTLED
//! when the settlement write failed) on exit, with realized PnL and
//! commission.

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

/// Initialize the connection pool and run migrations.
///
/// `database_url` is a SQLite URL, e.g. `sqlite://data/tradecast.db` or
/// `sqlite::memory:` for tests.
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // An in-memory database exists per connection; more than one pooled
    // connection would each see their own empty schema.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database ready");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            plan TEXT NOT NULL CHECK(plan IN ('TRIAL', 'PRO', 'FLEX')),
            subscription_status TEXT NOT NULL DEFAULT 'none',
            subscription_expires_at DATETIME,
            trading_enabled BOOLEAN NOT NULL DEFAULT 1,
            risk_level TEXT NOT NULL DEFAULT 'moderate',
            real_balance_usd REAL NOT NULL DEFAULT 0.0,
            admin_balance_usd REAL NOT NULL DEFAULT 0.0,
            commission_balance_usd REAL NOT NULL DEFAULT 0.0,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create users table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ledger (
            operation_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('LONG', 'SHORT')),
            entry_price REAL NOT NULL,
            exit_price REAL,
            quantity REAL NOT NULL,
            leverage REAL NOT NULL DEFAULT 1.0,
            profit_loss_usd REAL,
            commission_usd REAL NOT NULL DEFAULT 0.0,
            status TEXT NOT NULL CHECK(status IN ('open', 'closed', 'closed_unsettled')),
            entry_time DATETIME NOT NULL,
            exit_time DATETIME,
            exchange TEXT NOT NULL,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (user_id) REFERENCES users(id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create ledger table: {}", e)))?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_ledger_user_status ON ledger(user_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_ledger_status ON ledger(status)",
        "CREATE INDEX IF NOT EXISTS idx_ledger_symbol ON ledger(symbol)",
        "CREATE INDEX IF NOT EXISTS idx_users_enabled ON users(trading_enabled)",
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradecast.db".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://data/tradecast.db".to_string());

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Self {
            url,
            max_connections,
        }
    }
}
