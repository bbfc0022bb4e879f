//! Ratewarden - Resilient Request Rate Limiting
//!
//! This crate decides whether a request to a cost-sensitive endpoint may
//! proceed. Counts live in a shared store (Redis) updated by a single atomic
//! script; when the store fails or stalls, a circuit breaker routes checks
//! to a bounded in-memory limiter so requests are always decided.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod ratelimit;
