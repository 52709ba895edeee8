//! Error taxonomy for the signal executor
//!
//! Split by layer: `ValidationError` for value-object construction,
//! `ExecutionError` for the fan-out/settlement path. A plan denial is a
//! normal decision outcome, not a fault; it is carried as data in batch
//! results and must never be logged at error level.

use thiserror::Error;

use crate::domain::entities::exchange::Exchange;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Value must be non-negative")]
    MustBeNonNegative,

    #[error("Value must be positive")]
    MustBePositive,

    #[error("Value must be finite")]
    MustBeFinite,

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),
}

impl From<ValidationError> for String {
    fn from(error: ValidationError) -> Self {
        error.to_string()
    }
}

/// Failures on the execute/settle path.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// Plan gating said no. A decision, not a fault.
    #[error("Plan denied: {reason}")]
    PlanDenied { reason: String },

    /// The (user, exchange, symbol) key already has an OPEN position.
    #[error("Duplicate position for {user_id} on {exchange}/{symbol}")]
    DuplicatePosition {
        user_id: String,
        exchange: Exchange,
        symbol: String,
    },

    /// The venue did not answer usefully; transient, retried with backoff.
    #[error("Exchange {exchange} unavailable: {reason}")]
    ExchangeUnavailable { exchange: Exchange, reason: String },

    /// The ledger write failed; the position becomes CLOSED-UNSETTLED and is
    /// retried by reconciliation.
    #[error("Ledger write failed for {operation_id}: {reason}")]
    LedgerWrite {
        operation_id: String,
        reason: String,
    },

    /// A reconciliation resolution could not be applied. Logged per
    /// discrepancy, never fatal to the sweep.
    #[error("Reconciliation conflict for {user_id}: {detail}")]
    ReconciliationConflict { user_id: String, detail: String },

    /// The venue answered and refused the order. Not retryable.
    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("Invalid signal: {reason}")]
    InvalidSignal { reason: String },

    #[error("No adapter configured for {exchange}")]
    AdapterMissing { exchange: Exchange },

    #[error("Unknown user: {user_id}")]
    UnknownUser { user_id: String },

    #[error("Position sizing failed: {reason}")]
    Sizing { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Minor,
    Moderate,
    Critical,
}

impl ExecutionError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ExecutionError::PlanDenied { .. } => ErrorSeverity::Minor,
            ExecutionError::InvalidSignal { .. } => ErrorSeverity::Minor,
            ExecutionError::DuplicatePosition { .. } => ErrorSeverity::Moderate,
            ExecutionError::OrderRejected { .. } => ErrorSeverity::Moderate,
            ExecutionError::Sizing { .. } => ErrorSeverity::Moderate,
            ExecutionError::ExchangeUnavailable { .. } => ErrorSeverity::Moderate,
            ExecutionError::ReconciliationConflict { .. } => ErrorSeverity::Moderate,
            ExecutionError::UnknownUser { .. } => ErrorSeverity::Moderate,
            ExecutionError::LedgerWrite { .. } => ErrorSeverity::Critical,
            ExecutionError::AdapterMissing { .. } => ErrorSeverity::Critical,
        }
    }

    /// True when another attempt may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::ExchangeUnavailable { .. } | ExecutionError::LedgerWrite { .. }
        )
    }
}
