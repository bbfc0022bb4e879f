//! Atomic counter stores.
//!
//! The store exposes a single operation, atomic increment-and-check with
//! expiry. Concurrent stateless invocations are serialized by the store, not
//! by anything in this process, so two callers can never both observe
//! `limit - 1` and both be admitted.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, trace};

use super::rules::Category;
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Uniform result of a counter check, from either the store or the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    /// Whether the request is admitted
    pub success: bool,
    /// Observed count in the current window after this check
    pub count: u64,
    /// Epoch milliseconds at which the window resets
    pub reset_at_ms: u64,
}

/// Key identifying one (category, client) counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Namespace shared with unrelated data in the store
    pub prefix: String,
    /// Endpoint category
    pub category: Category,
    /// Resolved client identifier
    pub identifier: String,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(prefix: &str, category: Category, identifier: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            category,
            identifier: identifier.to_string(),
        }
    }

    /// Format: `"{prefix}:{category}:{identifier}"`
    pub fn to_store_key(&self) -> String {
        format!("{}:{}:{}", self.prefix, self.category, self.identifier)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

/// A store that can atomically increment a windowed counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` unless it already reached `limit`.
    ///
    /// The first increment of a window arms an expiry of `window_ms`.
    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
    ) -> Result<RateLimitOutcome, StoreError>;
}

/// Read, check, increment and arm the expiry in one server-side step.
///
/// Replies `{allowed, count, ttl_ms}`. A key without an expiry is re-armed so
/// a lost `PEXPIRE` cannot lock a client out forever.
const INCREMENT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])

if current and current >= limit then
  local ttl = redis.call('PTTL', KEYS[1])
  if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], window_ms)
    ttl = window_ms
  end
  return {0, current, ttl}
end

local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], window_ms)
end
return {1, count, window_ms}
"#;

/// Redis-backed counter store.
///
/// The connection is established on first use, so an unreachable server at
/// startup surfaces as a store failure on the request path (where the
/// circuit breaker handles it) instead of aborting the process.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    script: redis::Script,
}

impl RedisStore {
    /// Create a store for the given `redis://` URL without connecting.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: redis::Script::new(INCREMENT_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to Redis for rate limiting");
                Ok::<_, redis::RedisError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
    ) -> Result<RateLimitOutcome, StoreError> {
        let mut conn = self.connection().await?;

        let reply: (i64, i64, i64) = self
            .script
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, ?reply, "Redis counter checked");
        outcome_from_reply(reply, window_ms, SystemClock.now_millis())
    }
}

/// Convert an `{allowed, count, ttl_ms}` script reply into an outcome.
///
/// A negative TTL (no key or no expiry) is read as a full window.
fn outcome_from_reply(
    (allowed, count, ttl_ms): (i64, i64, i64),
    window_ms: u64,
    now_ms: u64,
) -> Result<RateLimitOutcome, StoreError> {
    let success = match allowed {
        1 => true,
        0 => false,
        other => return Err(StoreError::InvalidReply(format!("allowed flag {}", other))),
    };
    let count = u64::try_from(count)
        .map_err(|_| StoreError::InvalidReply(format!("negative count {}", count)))?;
    let ttl_ms = u64::try_from(ttl_ms).unwrap_or(window_ms);

    Ok(RateLimitOutcome {
        success,
        count,
        reset_at_ms: now_ms.saturating_add(ttl_ms),
    })
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    expires_at_ms: u64,
}

/// Process-local counter store.
///
/// Each key is updated under its shard's entry lock, which gives the same
/// increment-and-check atomicity as the Redis script for callers sharing this
/// process. Counts are not shared across processes.
pub struct MemoryStore {
    counters: DashMap<String, WindowCounter>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store using the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
    ) -> Result<RateLimitOutcome, StoreError> {
        let now = self.clock.now_millis();
        let fresh = WindowCounter {
            count: 0,
            expires_at_ms: now.saturating_add(window_ms),
        };

        let mut counter = self.counters.entry(key.to_string()).or_insert(fresh);
        if now >= counter.expires_at_ms {
            *counter = fresh;
        }

        if counter.count >= limit {
            return Ok(RateLimitOutcome {
                success: false,
                count: counter.count,
                reset_at_ms: counter.expires_at_ms,
            });
        }

        counter.count += 1;
        Ok(RateLimitOutcome {
            success: true,
            count: counter.count,
            reset_at_ms: counter.expires_at_ms,
        })
    }
}
