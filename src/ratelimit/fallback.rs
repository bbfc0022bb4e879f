//! Bounded in-memory fallback limiter.
//!
//! Used only while the distributed store is unavailable. Counts are
//! process-local: several instances each admit up to the limit, so the
//! global count during an outage is an approximation. Availability wins over
//! precision here.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::store::RateLimitOutcome;
use crate::clock::Clock;

/// Default maximum number of tracked identifiers.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Count for one identifier in the current fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FallbackRecord {
    count: u64,
    reset_at_ms: u64,
}

impl FallbackRecord {
    fn is_expired(&self, now: u64) -> bool {
        now >= self.reset_at_ms
    }
}

/// Fixed-window limiter over a self-evicting map.
pub struct InMemoryLimiter {
    records: Mutex<HashMap<String, FallbackRecord>>,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl InMemoryLimiter {
    /// Create a limiter holding at most `max_entries` identifiers.
    pub fn with_clock(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            clock,
        }
    }

    /// Check and count a request for `identifier`.
    pub fn check(&self, identifier: &str, limit: u64, window_ms: u64) -> RateLimitOutcome {
        let now = self.clock.now_millis();
        let mut records = self.records.lock();

        self.evict(&mut records, now);

        match records.get_mut(identifier) {
            Some(record) if !record.is_expired(now) => {
                if record.count >= limit {
                    return RateLimitOutcome {
                        success: false,
                        count: record.count,
                        reset_at_ms: record.reset_at_ms,
                    };
                }
                record.count += 1;
                RateLimitOutcome {
                    success: true,
                    count: record.count,
                    reset_at_ms: record.reset_at_ms,
                }
            }
            _ => {
                let record = FallbackRecord {
                    count: 1,
                    reset_at_ms: now.saturating_add(window_ms),
                };
                records.insert(identifier.to_string(), record);
                RateLimitOutcome {
                    success: true,
                    count: 1,
                    reset_at_ms: record.reset_at_ms,
                }
            }
        }
    }

    /// Make room before an insert once the map is full.
    ///
    /// Expired records go first. If that is not enough, roughly a tenth of
    /// the map is dropped in iteration order, which is arbitrary; this is a
    /// degraded mode and strict LRU is not worth the bookkeeping.
    fn evict(&self, records: &mut HashMap<String, FallbackRecord>, now: u64) {
        if records.len() < self.max_entries {
            return;
        }

        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        let expired = before - records.len();

        let mut dropped = 0;
        if records.len() >= self.max_entries {
            let batch = (self.max_entries / 10).max(1);
            let victims: Vec<String> = records.keys().take(batch).cloned().collect();
            for key in &victims {
                records.remove(key);
            }
            dropped = victims.len();
        }

        debug!(
            expired,
            dropped,
            remaining = records.len(),
            "Evicted fallback rate limit records"
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[cfg(test)]
    fn record(&self, identifier: &str) -> Option<FallbackRecord> {
        self.records.lock().get(identifier).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_entries: usize) -> (InMemoryLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (InMemoryLimiter::with_clock(max_entries, clock.clone()), clock)
    }

    #[test]
    fn test_admits_up_to_limit_then_denies() {
        let (limiter, _) = limiter(100);

        for expected in 1..=5 {
            let outcome = limiter.check("client", 5, 60_000);
            assert!(outcome.success);
            assert_eq!(outcome.count, expected);
        }

        let denied = limiter.check("client", 5, 60_000);
        assert!(!denied.success);
        assert_eq!(denied.count, 5);
        assert_eq!(denied.reset_at_ms, 1_060_000);

        // Denials do not mutate the record
        limiter.check("client", 5, 60_000);
        assert_eq!(limiter.record("client").unwrap().count, 5);
    }

    #[test]
    fn test_expired_record_restarts_at_one() {
        let (limiter, clock) = limiter(100);

        limiter.check("client", 1, 1_000);
        assert!(!limiter.check("client", 1, 1_000).success);

        clock.advance(1_000);
        let outcome = limiter.check("client", 1, 1_000);
        assert!(outcome.success);
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.reset_at_ms, 1_002_000);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let (limiter, _) = limiter(50);

        for i in 0..500 {
            limiter.check(&format!("client-{}", i), 10, 60_000);
            assert!(limiter.len() <= 50);
        }
    }

    #[test]
    fn test_expired_entries_purged_before_live_ones() {
        let (limiter, clock) = limiter(10);

        for i in 0..5 {
            limiter.check(&format!("old-{}", i), 10, 1_000);
        }
        clock.advance(500);
        for i in 0..5 {
            limiter.check(&format!("young-{}", i), 10, 60_000);
        }
        assert_eq!(limiter.len(), 10);

        // Old records have now expired; the young ones have not
        clock.advance(600);
        limiter.check("newcomer", 10, 60_000);

        assert_eq!(limiter.len(), 6);
        for i in 0..5 {
            assert!(limiter.record(&format!("old-{}", i)).is_none());
            assert!(limiter.record(&format!("young-{}", i)).is_some());
        }
        assert!(limiter.record("newcomer").is_some());
    }

    #[test]
    fn test_full_of_live_entries_drops_a_tenth() {
        let (limiter, _) = limiter(20);

        for i in 0..20 {
            limiter.check(&format!("client-{}", i), 10, 60_000);
        }
        assert_eq!(limiter.len(), 20);

        limiter.check("one-more", 10, 60_000);
        assert_eq!(limiter.len(), 19);
        assert!(limiter.record("one-more").is_some());
    }
}
