//! Database Repositories
//!
//! Data access for tenant accounts and the operation ledger. Settlement is
//! the one multi-table write: the ledger close and the balance deltas go
//! through a single transaction whose `status != 'closed'` guard makes a
//! second settlement of the same operation a no-op.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, error};

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::position::PositionSide;
use crate::domain::entities::user::UserAccount;

/// Tenant account repository. Billing owns the table; the engine reads
/// accounts and applies settlement deltas.
pub struct UserRepository {
    pool: DbPool,
}

impl UserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<UserAccount>, DatabaseError> {
        let record = sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get user {}: {}", user_id, e);
                DatabaseError::QueryError(format!("Failed to get user: {}", e))
            })?;

        record.map(UserAccount::try_from).transpose()
    }

    /// All accounts with trading enabled — the fan-out candidate set.
    pub async fn eligible(&self) -> Result<Vec<UserAccount>, DatabaseError> {
        let records = sqlx::query_as::<_, UserRecord>(
            "SELECT * FROM users WHERE trading_enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list eligible users: {}", e);
            DatabaseError::QueryError(format!("Failed to list eligible users: {}", e))
        })?;

        records
            .into_iter()
            .map(UserAccount::try_from)
            .collect::<Result<Vec<_>, _>>()
    }

    /// Insert or replace an account. The billing subsystem is the writer in
    /// production; the engine uses this for seeding and tests.
    pub async fn upsert(&self, user: &UserAccount) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO users (
                id, plan, subscription_status, subscription_expires_at,
                trading_enabled, risk_level, real_balance_usd,
                admin_balance_usd, commission_balance_usd, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT(id) DO UPDATE SET
                plan = excluded.plan,
                subscription_status = excluded.subscription_status,
                subscription_expires_at = excluded.subscription_expires_at,
                trading_enabled = excluded.trading_enabled,
                risk_level = excluded.risk_level,
                real_balance_usd = excluded.real_balance_usd,
                admin_balance_usd = excluded.admin_balance_usd,
                commission_balance_usd = excluded.commission_balance_usd,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&user.id)
        .bind(user.plan.name())
        .bind(user.subscription_status.name())
        .bind(user.subscription_expires_at)
        .bind(user.trading_enabled)
        .bind(user.risk_level.name())
        .bind(user.balances.real_usd)
        .bind(user.balances.admin_usd)
        .bind(user.balances.commission_usd)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to upsert user {}: {}", user.id, e);
            DatabaseError::QueryError(format!("Failed to upsert user: {}", e))
        })?;

        Ok(())
    }
}

/// Outcome of a settlement write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Row transitioned to closed and balances moved.
    Settled,
    /// The operation was already settled; nothing changed.
    AlreadySettled,
}

/// Operation ledger repository — the audit trail.
pub struct LedgerRepository {
    pool: DbPool,
}

impl LedgerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append an OPEN row for a freshly placed operation.
    pub async fn insert_open(&self, entry: &CreateLedgerEntry) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO ledger (
                operation_id, user_id, symbol, side, entry_price, quantity,
                leverage, status, entry_time, exchange, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8, ?9, ?10, ?10)
            "#,
        )
        .bind(&entry.operation_id)
        .bind(&entry.user_id)
        .bind(&entry.symbol)
        .bind(entry.side.name())
        .bind(entry.entry_price)
        .bind(entry.quantity)
        .bind(entry.leverage)
        .bind(entry.entry_time)
        .bind(entry.exchange.name())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert ledger row {}: {}", entry.operation_id, e);
            DatabaseError::QueryError(format!("Failed to insert ledger row: {}", e))
        })?;

        debug!(
            "Ledger OPEN {} for {} ({})",
            entry.operation_id, entry.user_id, entry.symbol
        );
        Ok(())
    }

    /// Idempotent insert for reconciliation adoption: a second adoption of
    /// the same operation is a no-op.
    pub async fn adopt_open(&self, entry: &CreateLedgerEntry) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO ledger (
                operation_id, user_id, symbol, side, entry_price, quantity,
                leverage, status, entry_time, exchange, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8, ?9, ?10, ?10)
            ON CONFLICT(operation_id) DO NOTHING
            "#,
        )
        .bind(&entry.operation_id)
        .bind(&entry.user_id)
        .bind(&entry.symbol)
        .bind(entry.side.name())
        .bind(entry.entry_price)
        .bind(entry.quantity)
        .bind(entry.leverage)
        .bind(entry.entry_time)
        .bind(entry.exchange.name())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DatabaseError::QueryError(format!("Failed to adopt ledger row: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Close an operation and apply balance deltas in one transaction.
    ///
    /// The `status != 'closed'` guard makes duplicate settlement impossible:
    /// the second caller sees zero affected rows and nothing moves.
    #[allow(clippy::too_many_arguments)]
    pub async fn settle_close(
        &self,
        operation_id: &str,
        user_id: &str,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        profit_loss_usd: f64,
        commission_usd: f64,
        user_delta_usd: f64,
        distribute: bool,
    ) -> Result<SettleOutcome, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            DatabaseError::QueryError(format!("Failed to begin settlement tx: {}", e))
        })?;

        let now = Utc::now();
        let rows_affected = sqlx::query(
            r#"
            UPDATE ledger
            SET status = 'closed', exit_price = ?1, exit_time = ?2,
                profit_loss_usd = ?3, commission_usd = ?4, updated_at = ?5
            WHERE operation_id = ?6 AND status != 'closed'
            "#,
        )
        .bind(exit_price)
        .bind(exit_time)
        .bind(profit_loss_usd)
        .bind(commission_usd)
        .bind(now)
        .bind(operation_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to close ledger row {}: {}", operation_id, e);
            DatabaseError::QueryError(format!("Failed to close ledger row: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            tx.rollback().await.ok();
            return Ok(SettleOutcome::AlreadySettled);
        }

        if distribute {
            sqlx::query(
                r#"
                UPDATE users
                SET real_balance_usd = real_balance_usd + ?1,
                    commission_balance_usd = commission_balance_usd + ?2,
                    updated_at = ?3
                WHERE id = ?4
                "#,
            )
            .bind(user_delta_usd)
            .bind(commission_usd)
            .bind(now)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to apply balance deltas for {}: {}", user_id, e);
                DatabaseError::QueryError(format!("Failed to apply balance deltas: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            DatabaseError::QueryError(format!("Failed to commit settlement: {}", e))
        })?;

        debug!(
            "Ledger CLOSED {} pnl={:.2} commission={:.2}",
            operation_id, profit_loss_usd, commission_usd
        );
        Ok(SettleOutcome::Settled)
    }

    /// Record that the venue closed the position but settlement could not be
    /// written; reconciliation retries these rows.
    pub async fn mark_unsettled(
        &self,
        operation_id: &str,
        exit_price: f64,
        profit_loss_usd: f64,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE ledger
            SET status = 'closed_unsettled', exit_price = ?1, exit_time = ?2,
                profit_loss_usd = ?3, updated_at = ?2
            WHERE operation_id = ?4 AND status = 'open'
            "#,
        )
        .bind(exit_price)
        .bind(now)
        .bind(profit_loss_usd)
        .bind(operation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DatabaseError::QueryError(format!("Failed to mark unsettled: {}", e))
        })?;

        Ok(())
    }

    /// Overwrite quantity/side from exchange values (FIELD_MISMATCH).
    pub async fn update_fields(
        &self,
        operation_id: &str,
        quantity: f64,
        side: PositionSide,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE ledger SET quantity = ?1, side = ?2, updated_at = ?3 WHERE operation_id = ?4",
        )
        .bind(quantity)
        .bind(side.name())
        .bind(Utc::now())
        .bind(operation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to update fields: {}", e)))?;

        Ok(())
    }

    pub async fn get(&self, operation_id: &str) -> Result<Option<LedgerRecord>, DatabaseError> {
        sqlx::query_as::<_, LedgerRecord>("SELECT * FROM ledger WHERE operation_id = ?1")
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to get ledger row: {}", e)))
    }

    /// Persisted-open set for one user, part of reconciliation's local set.
    pub async fn open_for_user(&self, user_id: &str) -> Result<Vec<LedgerRecord>, DatabaseError> {
        sqlx::query_as::<_, LedgerRecord>(
            "SELECT * FROM ledger WHERE user_id = ?1 AND status = 'open' ORDER BY entry_time DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to get open rows: {}", e)))
    }

    /// Rows whose settlement still needs a retry.
    pub async fn unsettled(&self) -> Result<Vec<LedgerRecord>, DatabaseError> {
        sqlx::query_as::<_, LedgerRecord>(
            "SELECT * FROM ledger WHERE status = 'closed_unsettled' ORDER BY exit_time",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to get unsettled rows: {}", e)))
    }

    /// Closed-trade history, newest first. Ledger only, never the exchange.
    pub async fn history_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<LedgerRecord>, DatabaseError> {
        sqlx::query_as::<_, LedgerRecord>(
            r#"
            SELECT * FROM ledger
            WHERE user_id = ?1 AND status != 'open'
            ORDER BY exit_time DESC
            LIMIT ?2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to get history: {}", e)))
    }

    /// Ledger-derived analytics. Ledger only, never the exchange.
    pub async fn analytics_for_user(
        &self,
        user_id: &str,
    ) -> Result<AnalyticsSummary, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_trades,
                COALESCE(SUM(CASE WHEN status = 'open' THEN 1 ELSE 0 END), 0) AS open_trades,
                COALESCE(SUM(CASE WHEN status != 'open' THEN 1 ELSE 0 END), 0) AS closed_trades,
                COALESCE(SUM(CASE WHEN status != 'open' AND profit_loss_usd >= 0 THEN 1 ELSE 0 END), 0) AS wins,
                COALESCE(SUM(CASE WHEN status != 'open' AND profit_loss_usd < 0 THEN 1 ELSE 0 END), 0) AS losses,
                COALESCE(SUM(CASE WHEN status != 'open' THEN profit_loss_usd ELSE 0 END), 0.0) AS realized_pnl_usd,
                COALESCE(SUM(commission_usd), 0.0) AS commission_paid_usd
            FROM ledger
            WHERE user_id = ?1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to get analytics: {}", e)))?;

        let closed_trades: i64 = row.get("closed_trades");
        let wins: i64 = row.get("wins");

        Ok(AnalyticsSummary {
            total_trades: row.get("total_trades"),
            open_trades: row.get("open_trades"),
            closed_trades,
            wins,
            losses: row.get("losses"),
            win_rate: if closed_trades == 0 {
                0.0
            } else {
                wins as f64 / closed_trades as f64
            },
            realized_pnl_usd: row.get("realized_pnl_usd"),
            commission_paid_usd: row.get("commission_paid_usd"),
        })
    }
}
