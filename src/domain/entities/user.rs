//! Tenant account entity
//!
//! `UserAccount` is owned by the billing/auth subsystem; this engine reads it
//! and writes only balance deltas on settlement. The plan is an exhaustive
//! enum so every gating decision is a compile-time-checked match, never a
//! string lookup with a silent default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription tier determining trading mode and fee structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanType {
    Trial,
    Pro,
    Flex,
}

impl PlanType {
    pub fn name(&self) -> &'static str {
        match self {
            PlanType::Trial => "TRIAL",
            PlanType::Pro => "PRO",
            PlanType::Flex => "FLEX",
        }
    }

    pub fn parse(name: &str) -> Option<PlanType> {
        match name.to_ascii_uppercase().as_str() {
            "TRIAL" => Some(PlanType::Trial),
            "PRO" => Some(PlanType::Pro),
            "FLEX" => Some(PlanType::Flex),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    None,
}

impl SubscriptionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::None => "none",
        }
    }

    pub fn parse(name: &str) -> Option<SubscriptionStatus> {
        match name.to_ascii_lowercase().as_str() {
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "none" => Some(SubscriptionStatus::None),
            _ => None,
        }
    }
}

/// Risk appetite chosen by the user; drives the position-size fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskLevel {
    pub fn name(&self) -> &'static str {
        match self {
            RiskLevel::Conservative => "conservative",
            RiskLevel::Moderate => "moderate",
            RiskLevel::Aggressive => "aggressive",
        }
    }

    pub fn parse(name: &str) -> Option<RiskLevel> {
        match name.to_ascii_lowercase().as_str() {
            "conservative" => Some(RiskLevel::Conservative),
            "moderate" => Some(RiskLevel::Moderate),
            "aggressive" => Some(RiskLevel::Aggressive),
            _ => None,
        }
    }

    /// Fraction of the operational balance committed per position.
    pub fn position_size_fraction(&self) -> f64 {
        match self {
            RiskLevel::Conservative => 0.05,
            RiskLevel::Moderate => 0.10,
            RiskLevel::Aggressive => 0.20,
        }
    }
}

/// USD-denominated account balances.
///
/// `real` is the user's own funds, `admin` is platform-granted credit, and
/// `commission` accumulates the platform's cut of FLEX profits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AccountBalances {
    pub real_usd: f64,
    pub admin_usd: f64,
    pub commission_usd: f64,
}

impl AccountBalances {
    /// Balance available for sizing and minimum-asset checks.
    pub fn operational_usd(&self) -> f64 {
        self.real_usd + self.admin_usd
    }
}

/// Tenant account as read from the billing subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub plan: PlanType,
    pub subscription_status: SubscriptionStatus,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub trading_enabled: bool,
    pub risk_level: RiskLevel,
    pub balances: AccountBalances,
}

impl UserAccount {
    /// True while a PRO subscription is actually usable.
    pub fn subscription_active(&self, now: DateTime<Utc>) -> bool {
        self.subscription_status == SubscriptionStatus::Active
            && self
                .subscription_expires_at
                .map(|expires| expires > now)
                .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn account(plan: PlanType) -> UserAccount {
        UserAccount {
            id: "user-1".to_string(),
            plan,
            subscription_status: SubscriptionStatus::Active,
            subscription_expires_at: None,
            trading_enabled: true,
            risk_level: RiskLevel::Moderate,
            balances: AccountBalances {
                real_usd: 1000.0,
                admin_usd: 50.0,
                commission_usd: 0.0,
            },
        }
    }

    #[test]
    fn test_operational_balance_sums_real_and_admin() {
        let account = account(PlanType::Flex);
        assert_eq!(account.balances.operational_usd(), 1050.0);
    }

    #[test]
    fn test_subscription_active_without_expiry() {
        let account = account(PlanType::Pro);
        assert!(account.subscription_active(Utc::now()));
    }

    #[test]
    fn test_subscription_expired() {
        let mut account = account(PlanType::Pro);
        account.subscription_expires_at = Some(Utc::now() - Duration::days(1));
        assert!(!account.subscription_active(Utc::now()));
    }

    #[test]
    fn test_subscription_inactive_status() {
        let mut account = account(PlanType::Pro);
        account.subscription_status = SubscriptionStatus::PastDue;
        assert!(!account.subscription_active(Utc::now()));
    }

    #[test]
    fn test_plan_parse_is_case_insensitive() {
        assert_eq!(PlanType::parse("flex"), Some(PlanType::Flex));
        assert_eq!(PlanType::parse("PRO"), Some(PlanType::Pro));
        assert_eq!(PlanType::parse("platinum"), None);
    }

    #[test]
    fn test_risk_fractions_are_ordered() {
        assert!(
            RiskLevel::Conservative.position_size_fraction()
                < RiskLevel::Moderate.position_size_fraction()
        );
        assert!(
            RiskLevel::Moderate.position_size_fraction()
                < RiskLevel::Aggressive.position_size_fraction()
        );
    }
}
