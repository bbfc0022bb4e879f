//! Rate limiter facade.
//!
//! Resolves the client, looks up the category rule, runs the atomic store
//! check through the circuit breaker with the in-memory limiter as fallback,
//! and turns the outcome into response headers or a 429.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::breaker::{BreakerConfig, CircuitBreaker};
use super::fallback::{InMemoryLimiter, DEFAULT_MAX_ENTRIES};
use super::rules::{Category, CategoryLimits};
use super::store::{CounterKey, CounterStore, RateLimitOutcome, RedisStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{Environment, WardenConfig};
use crate::error::Result;
use crate::identity::{ClientIdentityResolver, HeaderLookup};

/// Configured request count for the category.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Requests left in the current window.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Epoch milliseconds at which the window resets.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Seconds until the client may retry.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// HTTP status for a denied request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Minimum duration of [`RateLimiter::check_constant_time`].
pub const CONSTANT_TIME_FLOOR: Duration = Duration::from_millis(50);

const DEFAULT_KEY_PREFIX: &str = "ratelimit";
const DENIAL_MESSAGE: &str = "Too many requests. Please try again later.";

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    /// Human-readable message
    pub error: String,
    /// Seconds until the client may retry
    pub retry_after: u64,
    /// Configured limit for the category
    pub limit: u64,
}

/// A denied request, ready to be sent as a 429.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Always [`STATUS_TOO_MANY_REQUESTS`]
    pub status: u16,
    /// Rate limit headers plus `Retry-After` and `Content-Type`
    pub headers: BTreeMap<String, String>,
    /// Seconds until the window resets
    pub retry_after_secs: u64,
    /// Response body
    pub body: DenialBody,
}

impl Denial {
    /// Serialize the body as JSON.
    pub fn body_json(&self) -> String {
        serde_json::json!({
            "error": self.body.error,
            "retryAfter": self.body.retry_after,
            "limit": self.body.limit,
        })
        .to_string()
    }
}

/// The result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Proceed, attaching these headers to the response
    Admitted {
        /// Rate limit headers; empty when limiting is disabled
        headers: BTreeMap<String, String>,
    },
    /// Reply with a 429
    Denied(Denial),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }

    /// Headers to attach to the response.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        match self {
            Decision::Admitted { headers } => headers,
            Decision::Denied(denial) => &denial.headers,
        }
    }
}

/// Outcome of [`RateLimiter::check_constant_time`], identical in shape either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionVerdict {
    /// Whether the attempt may proceed
    pub allowed: bool,
    /// Seconds until retry; zero when allowed
    pub retry_after_secs: u64,
}

/// The rate limiter, constructed once and shared by all request handlers.
pub struct RateLimiter {
    limits: CategoryLimits,
    resolver: ClientIdentityResolver,
    store: Option<Arc<dyn CounterStore>>,
    breaker: CircuitBreaker,
    fallback: InMemoryLimiter,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Start building a rate limiter with built-in defaults.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Build a rate limiter from loaded configuration.
    ///
    /// No store is contacted here; a Redis URL is only validated.
    pub fn from_config(config: &WardenConfig) -> Result<Self> {
        let mut builder = RateLimiterBuilder::from_config(config)?;
        if let Some(url) = &config.store.url {
            builder = builder.store(Arc::new(RedisStore::open(url)?));
        }

        Ok(builder.build())
    }

    /// Whether a counter store is configured.
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Rate limit a request by its proxy headers.
    pub async fn rate_limit<H: HeaderLookup + ?Sized>(
        &self,
        headers: &H,
        category: Category,
    ) -> Decision {
        if self.store.is_none() {
            trace!(category = %category, "Rate limiting disabled, admitting");
            return Decision::Admitted {
                headers: BTreeMap::new(),
            };
        }

        let identifier = self.resolver.resolve(headers);
        self.check(&identifier, category).await
    }

    /// Rate limit an already-resolved identifier.
    pub async fn check(&self, identifier: &str, category: Category) -> Decision {
        let Some(store) = &self.store else {
            return Decision::Admitted {
                headers: BTreeMap::new(),
            };
        };

        let rule = self.limits.rule(category);
        let limit = rule.requests;
        let window_ms = rule.window_secs().saturating_mul(1000);
        let key = CounterKey::new(&self.key_prefix, category, identifier).to_store_key();

        trace!(key = %key, limit, window_ms, "Checking rate limit");

        let outcome = self
            .breaker
            .execute(
                || store.increment_and_check(&key, limit, window_ms),
                || self.fallback.check(&key, limit, window_ms),
            )
            .await;

        self.decide(&key, limit, outcome)
    }

    /// Check an authentication attempt, padding the call to
    /// [`CONSTANT_TIME_FLOOR`] so allowed and denied attempts take the same
    /// time.
    pub async fn check_constant_time<H: HeaderLookup + ?Sized>(
        &self,
        headers: &H,
        category: Category,
    ) -> AdmissionVerdict {
        let started = tokio::time::Instant::now();
        let decision = self.rate_limit(headers, category).await;
        tokio::time::sleep_until(started + CONSTANT_TIME_FLOOR).await;

        match decision {
            Decision::Admitted { .. } => AdmissionVerdict {
                allowed: true,
                retry_after_secs: 0,
            },
            Decision::Denied(denial) => AdmissionVerdict {
                allowed: false,
                retry_after_secs: denial.retry_after_secs,
            },
        }
    }

    #[cfg(test)]
    fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn decide(&self, key: &str, limit: u64, outcome: RateLimitOutcome) -> Decision {
        let mut headers = BTreeMap::from([
            (HEADER_LIMIT.to_string(), limit.to_string()),
            (
                HEADER_REMAINING.to_string(),
                limit.saturating_sub(outcome.count).to_string(),
            ),
            (HEADER_RESET.to_string(), outcome.reset_at_ms.to_string()),
        ]);

        if outcome.success {
            return Decision::Admitted { headers };
        }

        let now = self.clock.now_millis();
        let retry_after_secs = outcome.reset_at_ms.saturating_sub(now).div_ceil(1000);

        debug!(
            key = %key,
            count = outcome.count,
            limit,
            retry_after_secs,
            "Rate limit exceeded"
        );

        headers.insert(HEADER_RETRY_AFTER.to_string(), retry_after_secs.to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        Decision::Denied(Denial {
            status: STATUS_TOO_MANY_REQUESTS,
            headers,
            retry_after_secs,
            body: DenialBody {
                error: DENIAL_MESSAGE.to_string(),
                retry_after: retry_after_secs,
                limit,
            },
        })
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    limits: CategoryLimits,
    resolver: ClientIdentityResolver,
    store: Option<Arc<dyn CounterStore>>,
    breaker: BreakerConfig,
    fallback_capacity: usize,
    key_prefix: String,
    environment: Environment,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            limits: CategoryLimits::default(),
            resolver: ClientIdentityResolver::default(),
            store: None,
            breaker: BreakerConfig::default(),
            fallback_capacity: DEFAULT_MAX_ENTRIES,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            environment: Environment::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl RateLimiterBuilder {
    /// Start from loaded configuration, without a store.
    pub fn from_config(config: &WardenConfig) -> Result<Self> {
        let limits = match &config.limits_path {
            Some(path) => CategoryLimits::from_file(path)?,
            None => CategoryLimits::default(),
        };

        Ok(RateLimiter::builder()
            .limits(limits)
            .resolver(ClientIdentityResolver::new(&config.identity))
            .breaker(config.breaker.clone())
            .fallback_capacity(config.fallback.max_entries)
            .key_prefix(config.store.key_prefix.clone())
            .environment(config.environment))
    }

    /// Category rules.
    pub fn limits(mut self, limits: CategoryLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Client identity resolver.
    pub fn resolver(mut self, resolver: ClientIdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Distributed counter store. Without one, every request is admitted.
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Circuit breaker tuning.
    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Maximum identifiers held by the fallback limiter.
    pub fn fallback_capacity(mut self, max_entries: usize) -> Self {
        self.fallback_capacity = max_entries;
        self
    }

    /// Namespace for store keys.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Deployment environment.
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Clock shared by the breaker, the fallback and reset calculations.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the rate limiter.
    pub fn build(self) -> RateLimiter {
        if self.store.is_none() {
            match self.environment {
                Environment::Development => {
                    debug!("No counter store configured, rate limiting disabled")
                }
                Environment::Production => {
                    warn!("Rate limiting disabled: no counter store configured")
                }
            }
        }

        RateLimiter {
            limits: self.limits,
            resolver: self.resolver,
            store: self.store,
            breaker: CircuitBreaker::with_clock(self.breaker, self.clock.clone()),
            fallback: InMemoryLimiter::with_clock(self.fallback_capacity, self.clock.clone()),
            key_prefix: self.key_prefix,
            clock: self.clock,
        }
    }
}
