use crate::domain::entities::exchange::Exchange;
use crate::domain::value_objects::{price::Price, quantity::Quantity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn name(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(name: &str) -> Option<PositionSide> {
        match name.to_ascii_uppercase().as_str() {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short; the sign applied to price moves.
    pub fn direction(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
    /// Closed on the exchange but the ledger/balance write failed; kept
    /// visible until reconciliation settles it.
    ClosedUnsettled,
}

impl PositionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::ClosedUnsettled => "closed_unsettled",
        }
    }

    pub fn parse(name: &str) -> Option<PositionStatus> {
        match name {
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            "closed_unsettled" => Some(PositionStatus::ClosedUnsettled),
            _ => None,
        }
    }
}

/// A position created by this engine for one tenant.
///
/// Created by the trading engine on successful order placement, mutated only
/// by the tracker's close path or reconciliation corrections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub operation_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Price,
    pub size: Quantity,
    pub leverage: f64,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub status: PositionStatus,
    pub exchange: Exchange,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub profit_loss_usd: Option<f64>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        operation_id: String,
        user_id: String,
        symbol: String,
        side: PositionSide,
        entry_price: Price,
        size: Quantity,
        leverage: f64,
        exchange: Exchange,
    ) -> Self {
        Position {
            operation_id,
            user_id,
            symbol,
            side,
            entry_price,
            size,
            leverage,
            stop_loss: None,
            take_profit: None,
            status: PositionStatus::Open,
            exchange,
            entry_time: Utc::now(),
            exit_time: None,
            profit_loss_usd: None,
        }
    }

    /// Position value at entry, before leverage.
    pub fn notional_usd(&self) -> f64 {
        self.entry_price.value() * self.size.value()
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Mark-to-market PnL against `current`.
    pub fn unrealized_pnl(&self, current: Price) -> f64 {
        (current.value() - self.entry_price.value()) * self.size.value() * self.side.direction()
    }

    /// Transition to CLOSED at `exit_price`, recording realized PnL.
    /// Returns the realized PnL in USD.
    pub fn mark_closed(&mut self, exit_price: Price, exit_time: DateTime<Utc>) -> f64 {
        let realized = self.unrealized_pnl(exit_price);
        self.status = PositionStatus::Closed;
        self.exit_time = Some(exit_time);
        self.profit_loss_usd = Some(realized);
        realized
    }
}
