//! Rate limiting logic and state management.

mod breaker;
mod fallback;
mod limiter;
mod rules;
mod store;
mod window;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use fallback::{InMemoryLimiter, DEFAULT_MAX_ENTRIES};
pub use limiter::{
    AdmissionVerdict, Decision, Denial, DenialBody, RateLimiter, RateLimiterBuilder,
    CONSTANT_TIME_FLOOR, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
    STATUS_TOO_MANY_REQUESTS,
};
pub use rules::{Category, CategoryLimits, RateLimitRule};
pub use store::{CounterKey, CounterStore, MemoryStore, RateLimitOutcome, RedisStore};
pub use window::{parse_window, try_parse_window, WindowUnit, DEFAULT_WINDOW_SECS};
