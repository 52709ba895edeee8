use crate::domain::entities::exchange::Exchange;
use crate::domain::services::plan_validator::ValidatorConfig;

/// Reconciliation sweep configuration
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_seconds: u64,      // how often the periodic sweep runs
    pub sweep_concurrency: usize,   // users reconciled in parallel per sweep
    pub max_consecutive_failures: u32, // sweep failures tolerated before giving up loudly
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300, // every 5 minutes
            sweep_concurrency: 4,
            max_consecutive_failures: 10,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Live venue signals execute on (TRIAL accounts go to testnet instead).
    pub default_exchange: Exchange,
    /// Bound on in-flight per-user executions during fan-out.
    pub max_concurrent_executions: usize,
    pub exchange_retry_attempts: u32,
    pub exchange_retry_initial_delay_ms: u64,
    pub min_order_notional_usd: f64,
    pub price_cache_ttl_ms: u64,
    pub price_cache_capacity: usize,
    pub validator: ValidatorConfig,
    pub reconciliation: ReconciliationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_exchange: Exchange::Binance,
            max_concurrent_executions: 8,
            exchange_retry_attempts: 3,
            exchange_retry_initial_delay_ms: 250,
            min_order_notional_usd: 10.0,
            price_cache_ttl_ms: 2000,
            price_cache_capacity: 64,
            validator: ValidatorConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, keeping defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> EngineConfig {
        let mut config = EngineConfig::default();

        if let Ok(venue) = std::env::var("DEFAULT_EXCHANGE") {
            match Exchange::parse(&venue) {
                Some(exchange) if exchange.is_live() => config.default_exchange = exchange,
                Some(exchange) => {
                    tracing::warn!(
                        "DEFAULT_EXCHANGE {} is not a live venue, using default: {}",
                        exchange,
                        config.default_exchange
                    );
                }
                None => {
                    tracing::warn!(
                        "Unknown DEFAULT_EXCHANGE '{}', using default: {}",
                        venue,
                        config.default_exchange
                    );
                }
            }
        }

        if let Ok(value) = std::env::var("MAX_CONCURRENT_EXECUTIONS") {
            match value.parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.max_concurrent_executions = parsed,
                _ => tracing::warn!(
                    "Invalid MAX_CONCURRENT_EXECUTIONS '{}', using default: {}",
                    value,
                    config.max_concurrent_executions
                ),
            }
        }

        if let Ok(value) = std::env::var("EXCHANGE_RETRY_ATTEMPTS") {
            if let Ok(parsed) = value.parse::<u32>() {
                if parsed > 0 {
                    config.exchange_retry_attempts = parsed;
                }
            }
        }

        if let Ok(value) = std::env::var("MIN_ORDER_NOTIONAL_USD") {
            if let Ok(parsed) = value.parse::<f64>() {
                if parsed >= 0.0 {
                    config.min_order_notional_usd = parsed;
                }
            }
        }

        if let Ok(value) = std::env::var("MAX_OPEN_OPERATIONS") {
            match value.parse::<u32>() {
                Ok(parsed) if parsed > 0 => config.validator.max_open_operations = parsed,
                _ => tracing::warn!(
                    "Invalid MAX_OPEN_OPERATIONS '{}', using default: {}",
                    value,
                    config.validator.max_open_operations
                ),
            }
        }

        if let Ok(value) = std::env::var("OPERATION_COOLDOWN_SECONDS") {
            match value.parse::<i64>() {
                Ok(parsed) if parsed >= 0 => config.validator.cooldown_seconds = parsed,
                _ => tracing::warn!(
                    "Invalid OPERATION_COOLDOWN_SECONDS '{}', using default: {}",
                    value,
                    config.validator.cooldown_seconds
                ),
            }
        }

        if let Ok(value) = std::env::var("FLEX_MINIMUM_BALANCE") {
            if let Ok(parsed) = value.parse::<f64>() {
                if parsed >= 0.0 {
                    config.validator.flex.minimum_balance = parsed;
                }
            }
        }

        if let Ok(value) = std::env::var("FLEX_COMMISSION_RATE") {
            match value.parse::<f64>() {
                Ok(parsed) if (0.0..=1.0).contains(&parsed) => {
                    config.validator.flex.commission_rate = parsed;
                }
                _ => tracing::warn!(
                    "Invalid FLEX_COMMISSION_RATE '{}' (must be 0.0-1.0), using default: {}",
                    value,
                    config.validator.flex.commission_rate
                ),
            }
        }

        if let Ok(value) = std::env::var("RECONCILIATION_ENABLED") {
            config.reconciliation.enabled = value.to_lowercase() == "true" || value == "1";
        }

        if let Ok(value) = std::env::var("RECONCILIATION_INTERVAL_SECONDS") {
            match value.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.reconciliation.interval_seconds = parsed,
                _ => tracing::warn!(
                    "Invalid RECONCILIATION_INTERVAL_SECONDS '{}', using default: {}",
                    value,
                    config.reconciliation.interval_seconds
                ),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.default_exchange, Exchange::Binance);
        assert_eq!(config.max_concurrent_executions, 8);
        assert_eq!(config.validator.max_open_operations, 2);
        assert_eq!(config.validator.cooldown_seconds, 120);
        assert!(config.reconciliation.enabled);
    }

    #[test]
    fn test_flex_defaults_match_plan_economics() {
        let config = EngineConfig::default();
        assert_eq!(config.validator.flex.minimum_balance, 150.0);
        assert_eq!(config.validator.flex.commission_rate, 0.20);
        assert_eq!(config.validator.pro.commission_rate, 0.0);
    }
}
