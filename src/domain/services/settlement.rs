//! PnL and commission settlement
//!
//! Runs when a position transitions to CLOSED. The split depends on the
//! plan: PRO pays a flat monthly fee, so realized PnL goes to the user in
//! full; FLEX pays a commission on profits only; TRIAL trades paper money,
//! so nothing moves — the trade is recorded for analytics.

use crate::domain::entities::position::PositionSide;
use crate::domain::entities::user::PlanType;

/// Realized PnL in USD: `(exit − entry) × size`, sign-flipped for shorts.
pub fn realized_pnl(entry_price: f64, exit_price: f64, size: f64, side: PositionSide) -> f64 {
    (exit_price - entry_price) * size * side.direction()
}

/// How a realized PnL is distributed between user and platform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementSplit {
    /// Delta applied to the user's real balance (negative on a loss).
    pub user_delta_usd: f64,
    /// Commission credited to the platform's commission balance.
    pub commission_usd: f64,
    /// TRIAL: nothing moves, the trade is only recorded.
    pub recorded_only: bool,
}

/// Split `pnl_usd` for a plan. `commission_rate` is the plan's rate (taken
/// from the derived limits so FLEX config changes apply uniformly).
pub fn split_for_plan(plan: PlanType, pnl_usd: f64, commission_rate: f64) -> SettlementSplit {
    match plan {
        // Flat monthly fee already charged at subscription time.
        PlanType::Pro => SettlementSplit {
            user_delta_usd: pnl_usd,
            commission_usd: 0.0,
            recorded_only: false,
        },
        // Commission on profits only; losses are never commissioned.
        PlanType::Flex => {
            let commission_usd = if pnl_usd > 0.0 {
                pnl_usd * commission_rate
            } else {
                0.0
            };
            SettlementSplit {
                user_delta_usd: pnl_usd - commission_usd,
                commission_usd,
                recorded_only: false,
            }
        }
        // Testnet only: no real-money settlement.
        PlanType::Trial => SettlementSplit {
            user_delta_usd: 0.0,
            commission_usd: 0.0,
            recorded_only: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realized_pnl_long() {
        assert_eq!(realized_pnl(50000.0, 51000.0, 0.5, PositionSide::Long), 500.0);
        assert_eq!(
            realized_pnl(50000.0, 49000.0, 0.5, PositionSide::Long),
            -500.0
        );
    }

    #[test]
    fn test_realized_pnl_short() {
        assert_eq!(
            realized_pnl(50000.0, 49000.0, 0.5, PositionSide::Short),
            500.0
        );
        assert_eq!(
            realized_pnl(50000.0, 51000.0, 0.5, PositionSide::Short),
            -500.0
        );
    }

    #[test]
    fn test_flex_profit_commissioned_at_rate() {
        let split = split_for_plan(PlanType::Flex, 100.0, 0.20);
        assert_eq!(split.commission_usd, 20.0);
        assert_eq!(split.user_delta_usd, 80.0);
        assert!(!split.recorded_only);
    }

    #[test]
    fn test_flex_loss_not_commissioned() {
        let split = split_for_plan(PlanType::Flex, -50.0, 0.20);
        assert_eq!(split.commission_usd, 0.0);
        assert_eq!(split.user_delta_usd, -50.0);
    }

    #[test]
    fn test_flex_breakeven_not_commissioned() {
        let split = split_for_plan(PlanType::Flex, 0.0, 0.20);
        assert_eq!(split.commission_usd, 0.0);
        assert_eq!(split.user_delta_usd, 0.0);
    }

    #[test]
    fn test_pro_keeps_full_pnl() {
        let split = split_for_plan(PlanType::Pro, 100.0, 0.0);
        assert_eq!(split.user_delta_usd, 100.0);
        assert_eq!(split.commission_usd, 0.0);

        let loss = split_for_plan(PlanType::Pro, -75.0, 0.0);
        assert_eq!(loss.user_delta_usd, -75.0);
    }

    #[test]
    fn test_trial_is_recorded_only() {
        let split = split_for_plan(PlanType::Trial, 100.0, 0.0);
        assert!(split.recorded_only);
        assert_eq!(split.user_delta_usd, 0.0);
        assert_eq!(split.commission_usd, 0.0);
    }
}
