//! Rate limiting logic and state management.

mod backend;
mod circuit;
mod clock;
mod counter;
mod distributed;
mod limiter;
mod metrics;
pub mod presets;
mod queue;
mod retry;
mod rules;

pub use backend::{
    build_store, FallbackWindowStore, StoreError, WindowDecision, WindowSnapshot, WindowStore,
};
pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitSnapshot, CircuitState,
    DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD,
};
pub use clock::Clock;
pub use counter::{LocalWindowStore, SlidingWindow};
pub use distributed::RedisWindowStore;
pub use limiter::{
    BatchResults, DenyReason, RateLimitResult, RateLimitStatus, RateLimiter, RateLimiterBuilder,
    DEFAULT_BATCH_SIZE,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use retry::{RetryPolicy, DEFAULT_MAX_RETRIES};
pub use rules::RateLimitConfig;
