//! PositionTracker - authoritative registry of open positions
//!
//! The one shared mutable store of this engine instance. It is explicitly
//! owned and lock-guarded, passed by `Arc` to the engine (writer), the
//! reconciliation sweep (reader+writer), and read-only display queries.
//! Guards are never held across await points.
//!
//! The (user, exchange, symbol) open-index enforces the at-most-one-open
//! invariant; `close` is idempotent because races between manual and
//! exchange-driven closes are expected, not exceptional.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::errors::ExecutionError;
use crate::domain::services::plan_validator::AccountActivity;
use crate::domain::value_objects::{price::Price, quantity::Quantity};

/// Open-index key: one OPEN position at most per triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PositionKey {
    user_id: String,
    exchange: Exchange,
    symbol: String,
}

impl PositionKey {
    fn of(position: &Position) -> Self {
        Self {
            user_id: position.user_id.clone(),
            exchange: position.exchange,
            symbol: position.symbol.clone(),
        }
    }
}

/// Outcome of a close call. `changed == false` means the id was unknown or
/// already closed; callers treat that as success with nothing to do.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub changed: bool,
    pub position: Option<Position>,
}

/// Aggregate statistics over this tracker's lifetime.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TrackerStats {
    pub open_positions: usize,
    pub total_exposure_usd: f64,
    pub closed_wins: u64,
    pub closed_losses: u64,
    pub realized_pnl_usd: f64,
    pub win_rate: f64,
}

#[derive(Debug, Default)]
struct TrackerInner {
    by_operation: HashMap<String, Position>,
    open_index: HashMap<PositionKey, String>,
    last_operation: HashMap<String, DateTime<Utc>>,
    closed_wins: u64,
    closed_losses: u64,
    realized_pnl_usd: f64,
}

/// In-memory registry of positions created by this engine instance.
#[derive(Debug, Default)]
pub struct PositionTracker {
    inner: RwLock<TrackerInner>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly opened position.
    ///
    /// Fails with `DuplicatePosition` if the (user, exchange, symbol) key
    /// already has an OPEN entry; the existing position wins.
    pub fn open(&self, position: Position) -> Result<(), ExecutionError> {
        let mut inner = self.write();
        let key = PositionKey::of(&position);

        if inner.open_index.contains_key(&key) {
            return Err(ExecutionError::DuplicatePosition {
                user_id: key.user_id,
                exchange: key.exchange,
                symbol: key.symbol,
            });
        }

        inner
            .last_operation
            .insert(position.user_id.clone(), position.entry_time);
        inner
            .open_index
            .insert(key, position.operation_id.clone());
        inner
            .by_operation
            .insert(position.operation_id.clone(), position);
        Ok(())
    }

    /// Close a position at `exit_price`.
    ///
    /// Idempotent: closing an unknown or already-closed operation returns
    /// `changed: false` and never errors, because a manual close racing an
    /// exchange-driven close must converge on "closed" with exactly one
    /// settlement.
    pub fn close(&self, operation_id: &str, exit_price: Price) -> CloseOutcome {
        let mut inner = self.write();

        let mut position = match inner.by_operation.remove(operation_id) {
            Some(position) => position,
            None => {
                return CloseOutcome {
                    changed: false,
                    position: None,
                }
            }
        };

        inner.open_index.remove(&PositionKey::of(&position));
        let realized = position.mark_closed(exit_price, Utc::now());
        if realized >= 0.0 {
            inner.closed_wins += 1;
        } else {
            inner.closed_losses += 1;
        }
        inner.realized_pnl_usd += realized;

        CloseOutcome {
            changed: true,
            position: Some(position),
        }
    }

    /// Overwrite size/side from exchange-reported values. Used by
    /// reconciliation for FIELD_MISMATCH resolutions.
    pub fn apply_exchange_fields(
        &self,
        operation_id: &str,
        size: Quantity,
        side: PositionSide,
    ) -> bool {
        let mut inner = self.write();
        match inner.by_operation.get_mut(operation_id) {
            Some(position) => {
                position.size = size;
                position.side = side;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, operation_id: &str) -> Option<Position> {
        self.read().by_operation.get(operation_id).cloned()
    }

    pub fn active_positions(&self) -> Vec<Position> {
        self.read()
            .by_operation
            .values()
            .filter(|position| position.is_open())
            .cloned()
            .collect()
    }

    pub fn active_for_user(&self, user_id: &str) -> Vec<Position> {
        self.read()
            .by_operation
            .values()
            .filter(|position| position.is_open() && position.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn open_count_for(&self, user_id: &str) -> u32 {
        self.read()
            .by_operation
            .values()
            .filter(|position| position.is_open() && position.user_id == user_id)
            .count() as u32
    }

    /// Whether the open-index already holds this triple.
    pub fn has_open(&self, user_id: &str, exchange: Exchange, symbol: &str) -> bool {
        self.read().open_index.contains_key(&PositionKey {
            user_id: user_id.to_string(),
            exchange,
            symbol: symbol.to_string(),
        })
    }

    /// Activity snapshot feeding the validator's concurrency and cooldown
    /// checks.
    pub fn activity_for(&self, user_id: &str) -> AccountActivity {
        let inner = self.read();
        let open_operations = inner
            .by_operation
            .values()
            .filter(|position| position.is_open() && position.user_id == user_id)
            .count() as u32;
        AccountActivity {
            open_operations,
            last_operation_at: inner.last_operation.get(user_id).copied(),
        }
    }

    pub fn stats(&self) -> TrackerStats {
        let inner = self.read();
        let open: Vec<&Position> = inner
            .by_operation
            .values()
            .filter(|position| position.is_open())
            .collect();
        let total_exposure_usd = open.iter().map(|position| position.notional_usd()).sum();
        let closed = inner.closed_wins + inner.closed_losses;
        TrackerStats {
            open_positions: open.len(),
            total_exposure_usd,
            closed_wins: inner.closed_wins,
            closed_losses: inner.closed_losses,
            realized_pnl_usd: inner.realized_pnl_usd,
            win_rate: if closed == 0 {
                0.0
            } else {
                inner.closed_wins as f64 / closed as f64
            },
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrackerInner> {
        // A poisoned tracker means a panic mid-mutation; the registry is the
        // source of truth for open positions, so continuing with the data we
        // have beats going dark.
        self.inner.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TrackerInner> {
        self.inner
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
