//! Built-in rules for the API clients that share this limiter.

use super::rules::RateLimitConfig;

pub const POLYGON_FREE_TIER: &str = "polygon_free_tier";
pub const POLYGON_BASIC_TIER: &str = "polygon_basic_tier";
pub const YODLEE_AUTH: &str = "yodlee_auth";
pub const YODLEE_DATA: &str = "yodlee_data";
pub const YODLEE_REFRESH: &str = "yodlee_refresh";
pub const INTERNAL_USER_ACTIONS: &str = "internal_user_actions";
pub const INTERNAL_PORTFOLIO_REFRESH: &str = "internal_portfolio_refresh";

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Market data, free plan: 5 calls per minute.
pub fn polygon_free_tier() -> RateLimitConfig {
    RateLimitConfig::new(POLYGON_FREE_TIER, 5, MINUTE_MS)
        .with_queue_size(50)
        .with_priority(1)
}

/// Market data, paid plan.
pub fn polygon_basic_tier() -> RateLimitConfig {
    RateLimitConfig::new(POLYGON_BASIC_TIER, 100, MINUTE_MS)
        .with_burst_limit(120)
        .with_queue_size(200)
        .with_priority(1)
}

/// Bank aggregation token exchange.
pub fn yodlee_auth() -> RateLimitConfig {
    RateLimitConfig::new(YODLEE_AUTH, 10, MINUTE_MS).with_priority(3)
}

/// Bank aggregation account and transaction reads.
pub fn yodlee_data() -> RateLimitConfig {
    RateLimitConfig::new(YODLEE_DATA, 100, MINUTE_MS)
        .with_queue_size(100)
        .with_priority(2)
}

/// Bank aggregation refresh requests are expensive upstream.
pub fn yodlee_refresh() -> RateLimitConfig {
    RateLimitConfig::new(YODLEE_REFRESH, 5, HOUR_MS)
        .with_queue_size(10)
        .with_priority(0)
}

/// User driven API calls.
pub fn internal_user_actions() -> RateLimitConfig {
    RateLimitConfig::new(INTERNAL_USER_ACTIONS, 60, MINUTE_MS)
        .with_burst_limit(100)
        .with_priority(5)
}

/// Background portfolio price refresh.
pub fn internal_portfolio_refresh() -> RateLimitConfig {
    RateLimitConfig::new(INTERNAL_PORTFOLIO_REFRESH, 10, 5 * MINUTE_MS)
        .with_queue_size(20)
        .with_priority(0)
}

/// Every built-in rule.
pub fn all() -> Vec<RateLimitConfig> {
    vec![
        polygon_free_tier(),
        polygon_basic_tier(),
        yodlee_auth(),
        yodlee_data(),
        yodlee_refresh(),
        internal_user_actions(),
        internal_portfolio_refresh(),
    ]
}

/// Look up a built-in rule by identifier.
pub fn find(identifier: &str) -> Option<RateLimitConfig> {
    all().into_iter().find(|c| c.identifier == identifier)
}
