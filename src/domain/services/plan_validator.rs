//! PlanValidator - per-tenant gating for trading operations
//!
//! Pure decision component: given the user record, the requested operation,
//! and the user's current activity, it returns an allow/deny verdict with
//! every failing check reported (no short-circuit hiding of secondary
//! failures) plus the plan-derived limits view.
//!
//! The plan table is an exhaustive enum match: an unknown plan cannot exist,
//! so there is no silent default path.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::user::{PlanType, SubscriptionStatus, UserAccount};

/// Derived gate combining plan and live account state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingMode {
    TestnetOnly,
    SubscriptionRequired,
    UnlimitedTrading,
    AssetRequired,
    InsufficientAssets,
}

impl TradingMode {
    /// True when this mode permits placing orders at all (on some venue).
    pub fn permits_trading(&self) -> bool {
        matches!(
            self,
            TradingMode::TestnetOnly | TradingMode::UnlimitedTrading | TradingMode::AssetRequired
        )
    }
}

/// Per-plan economics. Static configuration, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct PlanPolicy {
    pub max_leverage: f64,
    pub max_positions: u32,
    pub max_daily_loss: f64,
    pub minimum_balance: f64,
    pub commission_rate: f64,
    pub monthly_fee: f64,
    pub max_position_value: f64,
}

/// Plan-derived limits, computed per request from plan + live balance.
/// A view, not stored truth.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlanLimits {
    pub max_leverage: f64,
    pub max_positions: u32,
    pub max_daily_loss: f64,
    pub minimum_balance: f64,
    pub commission_rate: f64,
    pub monthly_fee: f64,
    pub max_position_value: f64,
    pub position_size_fraction: f64,
}

impl PlanLimits {
    /// The shape routing layers consume: mode, limits, fees.
    pub fn view(&self, trading_mode: TradingMode) -> serde_json::Value {
        serde_json::json!({
            "tradingMode": trading_mode,
            "limits": {
                "maxLeverage": self.max_leverage,
                "maxPositions": self.max_positions,
                "maxDailyLoss": self.max_daily_loss,
                "minimumBalance": self.minimum_balance,
            },
            "fees": {
                "monthlyFee": self.monthly_fee,
                "commissionRate": self.commission_rate,
            },
        })
    }
}

/// One failed check. Display produces the user-facing reason string.
#[derive(Debug, Clone, PartialEq)]
pub enum DenialReason {
    TradingDisabled,
    LiveVenueForbidden {
        exchange: Exchange,
    },
    SubscriptionRequired {
        status: SubscriptionStatus,
    },
    InsufficientAssets {
        minimum: f64,
        available: f64,
    },
    TooManyOpenOperations {
        current: u32,
        max: u32,
    },
    CooldownActive {
        remaining_secs: i64,
    },
    InsufficientBalance {
        required: f64,
        available: f64,
    },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::TradingDisabled => {
                write!(f, "trading is disabled for this account")
            }
            DenialReason::LiveVenueForbidden { exchange } => {
                write!(
                    f,
                    "TRIAL plan is testnet-only, live trading on {} is not permitted",
                    exchange
                )
            }
            DenialReason::SubscriptionRequired { status } => {
                write!(
                    f,
                    "PRO plan requires an active subscription (status: {})",
                    status.name()
                )
            }
            DenialReason::InsufficientAssets { minimum, available } => {
                write!(
                    f,
                    "FLEX plan requires ${:.0} minimum assets, available ${:.2}",
                    minimum, available
                )
            }
            DenialReason::TooManyOpenOperations { current, max } => {
                write!(
                    f,
                    "too many open operations: {} of {} allowed",
                    current, max
                )
            }
            DenialReason::CooldownActive { remaining_secs } => {
                write!(f, "cooldown active, retry in {}s", remaining_secs)
            }
            DenialReason::InsufficientBalance {
                required,
                available,
            } => {
                write!(
                    f,
                    "insufficient balance: required ${:.2}, available ${:.2}",
                    required, available
                )
            }
        }
    }
}

/// The operation being requested, as the validator sees it.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub exchange: Exchange,
    pub symbol: String,
    /// Margin the engine intends to commit, in USD.
    pub amount_usd: f64,
}

/// The user's current activity, supplied by the position tracker.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountActivity {
    pub open_operations: u32,
    pub last_operation_at: Option<DateTime<Utc>>,
}

/// Validator output: verdict, mode, all failing checks, derived limits.
#[derive(Debug, Clone)]
pub struct PlanVerdict {
    pub allowed: bool,
    pub trading_mode: TradingMode,
    pub reasons: Vec<DenialReason>,
    pub limits: PlanLimits,
}

impl PlanVerdict {
    /// Joined reason string for batch results and user-facing messages.
    pub fn reason_summary(&self) -> String {
        self.reasons
            .iter()
            .map(|reason| reason.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validator configuration: plan-independent check parameters plus the
/// per-plan economics table.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Maximum pending/open operations per user in the trailing window.
    pub max_open_operations: u32,
    /// Minimum seconds between operations for one user.
    pub cooldown_seconds: i64,
    pub trial: PlanPolicy,
    pub pro: PlanPolicy,
    pub flex: PlanPolicy,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_open_operations: 2,
            cooldown_seconds: 120,
            trial: PlanPolicy {
                max_leverage: 5.0,
                max_positions: 1,
                max_daily_loss: 1000.0,
                minimum_balance: 0.0,
                commission_rate: 0.0,
                monthly_fee: 0.0,
                max_position_value: 1000.0,
            },
            pro: PlanPolicy {
                max_leverage: 20.0,
                max_positions: 10,
                max_daily_loss: 500.0,
                minimum_balance: 0.0,
                commission_rate: 0.0,
                monthly_fee: 49.99,
                max_position_value: 50000.0,
            },
            flex: PlanPolicy {
                max_leverage: 10.0,
                max_positions: 5,
                max_daily_loss: 300.0,
                minimum_balance: 150.0,
                commission_rate: 0.20,
                monthly_fee: 0.0,
                max_position_value: 10000.0,
            },
        }
    }
}

impl ValidatorConfig {
    pub fn policy_for(&self, plan: PlanType) -> &PlanPolicy {
        match plan {
            PlanType::Trial => &self.trial,
            PlanType::Pro => &self.pro,
            PlanType::Flex => &self.flex,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanValidator {
    config: ValidatorConfig,
}

impl PlanValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Derive the limits view for a user without validating an operation.
    pub fn limits_for(&self, user: &UserAccount) -> (TradingMode, PlanLimits) {
        let mode = self.trading_mode_for(user, Utc::now());
        (mode, self.derive_limits(user))
    }

    pub fn validate(
        &self,
        user: &UserAccount,
        request: &OperationRequest,
        activity: &AccountActivity,
    ) -> PlanVerdict {
        self.validate_at(user, request, activity, Utc::now())
    }

    /// Validation with an explicit clock, for deterministic tests.
    pub fn validate_at(
        &self,
        user: &UserAccount,
        request: &OperationRequest,
        activity: &AccountActivity,
        now: DateTime<Utc>,
    ) -> PlanVerdict {
        let mut reasons = Vec::new();
        let trading_mode = self.trading_mode_for(user, now);

        // Plan gate. Exhaustive: adding a plan forces a decision here.
        match user.plan {
            PlanType::Trial => {
                // Absolute rule: a TRIAL account never touches a live venue,
                // whatever the signal or balance says.
                if request.exchange.is_live() {
                    reasons.push(DenialReason::LiveVenueForbidden {
                        exchange: request.exchange,
                    });
                }
            }
            PlanType::Pro => {
                if !user.subscription_active(now) {
                    reasons.push(DenialReason::SubscriptionRequired {
                        status: user.subscription_status,
                    });
                }
            }
            PlanType::Flex => {
                let available = user.balances.operational_usd();
                let minimum = self.config.flex.minimum_balance;
                if available < minimum {
                    reasons.push(DenialReason::InsufficientAssets { minimum, available });
                }
            }
        }

        // Plan-independent checks. All of them run; the verdict carries the
        // union of failures.
        if !user.trading_enabled {
            reasons.push(DenialReason::TradingDisabled);
        }

        if activity.open_operations >= self.config.max_open_operations {
            reasons.push(DenialReason::TooManyOpenOperations {
                current: activity.open_operations,
                max: self.config.max_open_operations,
            });
        }

        if let Some(last) = activity.last_operation_at {
            let elapsed = now.signed_duration_since(last);
            let cooldown = Duration::seconds(self.config.cooldown_seconds);
            if elapsed < cooldown {
                reasons.push(DenialReason::CooldownActive {
                    remaining_secs: (cooldown - elapsed).num_seconds().max(1),
                });
            }
        }

        let available = user.balances.operational_usd();
        if request.amount_usd > available {
            reasons.push(DenialReason::InsufficientBalance {
                required: request.amount_usd,
                available,
            });
        }

        PlanVerdict {
            allowed: reasons.is_empty(),
            trading_mode,
            reasons,
            limits: self.derive_limits(user),
        }
    }

    fn trading_mode_for(&self, user: &UserAccount, now: DateTime<Utc>) -> TradingMode {
        match user.plan {
            PlanType::Trial => TradingMode::TestnetOnly,
            PlanType::Pro => {
                if user.subscription_active(now) {
                    TradingMode::UnlimitedTrading
                } else {
                    TradingMode::SubscriptionRequired
                }
            }
            PlanType::Flex => {
                if user.balances.operational_usd() >= self.config.flex.minimum_balance {
                    TradingMode::AssetRequired
                } else {
                    TradingMode::InsufficientAssets
                }
            }
        }
    }

    fn derive_limits(&self, user: &UserAccount) -> PlanLimits {
        let policy = self.config.policy_for(user.plan);
        PlanLimits {
            max_leverage: policy.max_leverage,
            max_positions: policy.max_positions,
            max_daily_loss: policy.max_daily_loss,
            minimum_balance: policy.minimum_balance,
            commission_rate: policy.commission_rate,
            monthly_fee: policy.monthly_fee,
            max_position_value: policy.max_position_value,
            position_size_fraction: user.risk_level.position_size_fraction(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::user::{AccountBalances, RiskLevel};

    fn user(plan: PlanType, real_usd: f64) -> UserAccount {
        UserAccount {
            id: "user-1".to_string(),
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

    fn request(exchange: Exchange, amount_usd: f64) -> OperationRequest {
        OperationRequest {
            exchange,
            symbol: "BTC-USD".to_string(),
            amount_usd,
        }
    }

    fn validator() -> PlanValidator {
        PlanValidator::new(ValidatorConfig::default())
    }

    #[test]
    fn test_trial_denied_on_live_venue_regardless_of_balance() {
        let verdict = validator().validate(
            &user(PlanType::Trial, 1_000_000.0),
            &request(Exchange::Binance, 10.0),
            &AccountActivity::default(),
        );
        assert!(!verdict.allowed);
        assert_eq!(verdict.trading_mode, TradingMode::TestnetOnly);
        assert!(verdict
            .reasons
            .iter()
            .any(|r| matches!(r, DenialReason::LiveVenueForbidden { .. })));
    }

    #[test]
    fn test_trial_allowed_on_testnet() {
        let verdict = validator().validate(
            &user(PlanType::Trial, 500.0),
            &request(Exchange::Testnet, 10.0),
            &AccountActivity::default(),
        );
        assert!(verdict.allowed, "reasons: {}", verdict.reason_summary());
        assert_eq!(verdict.trading_mode, TradingMode::TestnetOnly);
    }

    #[test]
    fn test_pro_active_subscription_unlimited() {
        let verdict = validator().validate(
            &user(PlanType::Pro, 500.0),
            &request(Exchange::Binance, 50.0),
            &AccountActivity::default(),
        );
        assert!(verdict.allowed);
        assert_eq!(verdict.trading_mode, TradingMode::UnlimitedTrading);
        assert_eq!(verdict.limits.commission_rate, 0.0);
    }

    #[test]
    fn test_pro_expired_subscription_denied() {
        let mut account = user(PlanType::Pro, 500.0);
        account.subscription_status = SubscriptionStatus::Canceled;
        let verdict = validator().validate(
            &account,
            &request(Exchange::Binance, 50.0),
            &AccountActivity::default(),
        );
        assert!(!verdict.allowed);
        assert_eq!(verdict.trading_mode, TradingMode::SubscriptionRequired);
    }

    #[test]
    fn test_flex_below_minimum_assets_denied_with_reason_string() {
        let verdict = validator().validate(
            &user(PlanType::Flex, 100.0),
            &request(Exchange::Binance, 10.0),
            &AccountActivity::default(),
        );
        assert!(!verdict.allowed);
        assert_eq!(verdict.trading_mode, TradingMode::InsufficientAssets);
        let summary = verdict.reason_summary();
        assert!(summary.contains("FLEX plan requires $150 minimum assets"), "{}", summary);
    }

    #[test]
    fn test_flex_above_minimum_allowed_with_commission() {
        let verdict = validator().validate(
            &user(PlanType::Flex, 400.0),
            &request(Exchange::Binance, 40.0),
            &AccountActivity::default(),
        );
        assert!(verdict.allowed);
        assert_eq!(verdict.trading_mode, TradingMode::AssetRequired);
        assert_eq!(verdict.limits.commission_rate, 0.20);
    }

    #[test]
    fn test_concurrency_limit() {
        let activity = AccountActivity {
            open_operations: 2,
            last_operation_at: None,
        };
        let verdict = validator().validate(
            &user(PlanType::Pro, 500.0),
            &request(Exchange::Binance, 50.0),
            &activity,
        );
        assert!(!verdict.allowed);
        assert!(verdict
            .reasons
            .iter()
            .any(|r| matches!(r, DenialReason::TooManyOpenOperations { current: 2, max: 2 })));
    }

    #[test]
    fn test_cooldown_window() {
        let now = Utc::now();
        let activity = AccountActivity {
            open_operations: 0,
            last_operation_at: Some(now - Duration::seconds(30)),
        };
        let verdict = validator().validate_at(
            &user(PlanType::Pro, 500.0),
            &request(Exchange::Binance, 50.0),
            &activity,
            now,
        );
        assert!(!verdict.allowed);
        assert!(verdict
            .reasons
            .iter()
            .any(|r| matches!(r, DenialReason::CooldownActive { .. })));
    }

    #[test]
    fn test_cooldown_elapsed_allows() {
        let now = Utc::now();
        let activity = AccountActivity {
            open_operations: 0,
            last_operation_at: Some(now - Duration::seconds(121)),
        };
        let verdict = validator().validate_at(
            &user(PlanType::Pro, 500.0),
            &request(Exchange::Binance, 50.0),
            &activity,
            now,
        );
        assert!(verdict.allowed);
    }

    #[test]
    fn test_all_failing_checks_reported_together() {
        // FLEX below minimum, over concurrency, inside cooldown, and short
        // on balance for the requested amount: four reasons, not one.
        let now = Utc::now();
        let activity = AccountActivity {
            open_operations: 3,
            last_operation_at: Some(now - Duration::seconds(10)),
        };
        let verdict = validator().validate_at(
            &user(PlanType::Flex, 100.0),
            &request(Exchange::Binance, 5000.0),
            &activity,
            now,
        );
        assert!(!verdict.allowed);
        assert_eq!(verdict.reasons.len(), 4, "{}", verdict.reason_summary());
    }

    #[test]
    fn test_limits_view_shape() {
        let account = user(PlanType::Flex, 400.0);
        let (mode, limits) = validator().limits_for(&account);
        let view = limits.view(mode);
        assert_eq!(view["tradingMode"], "ASSET_REQUIRED");
        assert_eq!(view["limits"]["maxLeverage"], 10.0);
        assert_eq!(view["fees"]["commissionRate"], 0.20);
    }

    #[test]
    fn test_position_size_fraction_follows_risk_level() {
        let mut account = user(PlanType::Pro, 500.0);
        account.risk_level = RiskLevel::Aggressive;
        let (_, limits) = validator().limits_for(&account);
        assert_eq!(limits.position_size_fraction, 0.20);
    }
}
