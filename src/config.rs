//! Configuration management for Ratewarden.
//!
//! Settings are layered: built-in defaults, then an optional file, then
//! environment variables prefixed with `RATEWARDEN` using `__` between
//! sections, e.g. `RATEWARDEN__STORE__URL=redis://cache:6379` or
//! `RATEWARDEN__IDENTITY__TRUSTED_PROXY_COUNT=3`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::identity::IdentityConfig;
use crate::ratelimit::{BreakerConfig, DEFAULT_MAX_ENTRIES};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Fallback limiter configuration
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Client identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Path to a YAML file of per-category rules
    #[serde(default)]
    pub limits_path: Option<String>,
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development; a missing store is expected
    Development,
    /// Anything deployed; a missing store is worth a warning
    #[default]
    Production,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; rate limiting is disabled when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Namespace for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

/// Fallback limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Maximum identifiers tracked during a store outage
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

impl WardenConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        let config: WardenConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}
