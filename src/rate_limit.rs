use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter configuration for signal intake
pub struct RateLimiterConfig {
    /// Maximum signals accepted per minute
    pub signals_per_minute: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            signals_per_minute: 120,
        }
    }
}

/// Global rate limiter shared by the intake routes
pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn create_rate_limiter(config: RateLimiterConfig) -> GlobalRateLimiter {
    let quota = Quota::per_minute(
        NonZeroU32::new(config.signals_per_minute).expect("Signals per minute must be non-zero"),
    );
    Arc::new(RateLimiter::direct(quota))
}

/// Middleware guarding the webhook route: a runaway strategy must not turn
/// into a runaway fan-out.
pub async fn rate_limit_middleware(
    limiter: GlobalRateLimiter,
    request: Request,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(_) => next.run(request).await,
        Err(_) => {
            tracing::warn!("signal intake rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Signal rate limit exceeded. Please try again later.",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_first_request() {
        let limiter = create_rate_limiter(RateLimiterConfig {
            signals_per_minute: 50,
        });
        assert!(limiter.check().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.signals_per_minute, 120);
    }
}
