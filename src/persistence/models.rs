//! Database Models
//!
//! Row shapes for the users and ledger tables, plus conversions back into
//! domain types. Enum-typed columns are stored as their canonical text and
//! re-parsed on read; the CHECK constraints keep the text honest, but a
//! corrupt row still surfaces as an error instead of a default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::DatabaseError;
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::position::{Position, PositionSide, PositionStatus};
use crate::domain::entities::user::{
    AccountBalances, PlanType, RiskLevel, SubscriptionStatus, UserAccount,
};
use crate::domain::value_objects::{price::Price, quantity::Quantity};

/// Tenant account row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRecord {
    pub id: String,
    pub plan: String,
    pub subscription_status: String,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub trading_enabled: bool,
    pub risk_level: String,
    pub real_balance_usd: f64,
    pub admin_balance_usd: f64,
    pub commission_balance_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<UserRecord> for UserAccount {
    type Error = DatabaseError;

    fn try_from(record: UserRecord) -> Result<Self, Self::Error> {
        let plan = PlanType::parse(&record.plan)
            .ok_or_else(|| DatabaseError::CorruptRecord(format!("unknown plan {}", record.plan)))?;
        let subscription_status =
            SubscriptionStatus::parse(&record.subscription_status).ok_or_else(|| {
                DatabaseError::CorruptRecord(format!(
                    "unknown subscription status {}",
                    record.subscription_status
                ))
            })?;
        let risk_level = RiskLevel::parse(&record.risk_level).ok_or_else(|| {
            DatabaseError::CorruptRecord(format!("unknown risk level {}", record.risk_level))
        })?;

        Ok(UserAccount {
            id: record.id,
            plan,
            subscription_status,
            subscription_expires_at: record.subscription_expires_at,
            trading_enabled: record.trading_enabled,
            risk_level,
            balances: AccountBalances {
                real_usd: record.real_balance_usd,
                admin_usd: record.admin_balance_usd,
                commission_usd: record.commission_balance_usd,
            },
        })
    }
}

/// Ledger row: one operation's audit record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerRecord {
    pub operation_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub quantity: f64,
    pub leverage: f64,
    pub profit_loss_usd: Option<f64>,
    pub commission_usd: f64,
    pub status: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exchange: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerRecord {
    /// Rebuild the domain position from a persisted row. Used when the
    /// tracker lost a position (restart) and reconciliation works from the
    /// ledger's open set.
    pub fn to_position(&self) -> Result<Position, DatabaseError> {
        let side = PositionSide::parse(&self.side)
            .ok_or_else(|| DatabaseError::CorruptRecord(format!("unknown side {}", self.side)))?;
        let status = PositionStatus::parse(&self.status).ok_or_else(|| {
            DatabaseError::CorruptRecord(format!("unknown status {}", self.status))
        })?;
        let exchange = Exchange::parse(&self.exchange).ok_or_else(|| {
            DatabaseError::CorruptRecord(format!("unknown exchange {}", self.exchange))
        })?;
        let entry_price = Price::new(self.entry_price)
            .map_err(|e| DatabaseError::CorruptRecord(format!("entry price: {}", e)))?;
        let size = Quantity::new(self.quantity)
            .map_err(|e| DatabaseError::CorruptRecord(format!("quantity: {}", e)))?;

        Ok(Position {
            operation_id: self.operation_id.clone(),
            user_id: self.user_id.clone(),
            symbol: self.symbol.clone(),
            side,
            entry_price,
            size,
            leverage: self.leverage,
            stop_loss: None,
            take_profit: None,
            status,
            exchange,
            entry_time: self.entry_time,
            exit_time: self.exit_time,
            profit_loss_usd: self.profit_loss_usd,
        })
    }
}

/// Input for a new OPEN ledger row.
#[derive(Debug, Clone)]
pub struct CreateLedgerEntry {
    pub operation_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub entry_time: DateTime<Utc>,
    pub exchange: Exchange,
}

impl CreateLedgerEntry {
    pub fn from_position(position: &Position) -> Self {
        Self {
            operation_id: position.operation_id.clone(),
            user_id: position.user_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price.value(),
            quantity: position.size.value(),
            leverage: position.leverage,
            entry_time: position.entry_time,
            exchange: position.exchange,
        }
    }
}

/// Ledger-derived analytics for one user. Never touches the exchange.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AnalyticsSummary {
    pub total_trades: i64,
    pub open_trades: i64,
    pub closed_trades: i64,
    pub wins: i64,
    pub losses: i64,
    pub win_rate: f64,
    pub realized_pnl_usd: f64,
    pub commission_paid_usd: f64,
}
