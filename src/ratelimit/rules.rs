//! Per-category rate limit rules.
//!
//! Every rate-limited endpoint belongs to a [`Category`]. Each category maps
//! to a [`RateLimitRule`] of `requests` per `window`. The built-in table can
//! be overridden from a YAML file:
//!
//! ```yaml
//! identify:
//!   requests: 10
//!   window: "1 h"
//! random:
//!   requests: 200
//!   window: "1 m"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use super::window::parse_window;
use crate::error::{Result, WardenError};

/// Endpoint category a rate limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Image identification backed by a paid external API
    Identify,
    /// Species data lookups
    Species,
    /// Image fetching
    Images,
    /// Random record selection
    Random,
    /// Anything without a dedicated rule
    Default,
    /// Admin authentication attempts
    Admin,
}

impl Category {
    /// All categories, in table order.
    pub const ALL: [Category; 6] = [
        Category::Identify,
        Category::Species,
        Category::Images,
        Category::Random,
        Category::Default,
        Category::Admin,
    ];

    /// Name used in store keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Identify => "identify",
            Category::Species => "species",
            Category::Images => "images",
            Category::Random => "random",
            Category::Default => "default",
            Category::Admin => "admin",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| WardenError::Config(format!("Unknown rate limit category: {}", s)))
    }
}

/// A rate limit rule: `requests` allowed per `window`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Number of requests allowed per window
    pub requests: u64,
    /// Window length, e.g. `"1 m"`
    pub window: String,
    /// Optional description for this limit
    #[serde(default)]
    pub description: Option<String>,
}

impl RateLimitRule {
    /// Create a rule without a description.
    pub fn new(requests: u64, window: impl Into<String>) -> Self {
        Self {
            requests,
            window: window.into(),
            description: None,
        }
    }

    fn described(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Window length in seconds; malformed windows degrade to the default.
    pub fn window_secs(&self) -> u64 {
        parse_window(&self.window)
    }
}

/// The category → rule table, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryLimits {
    /// Rule for `default` and for any category without its own entry
    default: RateLimitRule,
    rules: HashMap<Category, RateLimitRule>,
}

impl Default for CategoryLimits {
    fn default() -> Self {
        let rules = HashMap::from([
            (
                Category::Identify,
                RateLimitRule::new(10, "1 h")
                    .described("AI image identification (uses external paid API)"),
            ),
            (
                Category::Species,
                RateLimitRule::new(60, "1 m").described("Species biodiversity data fetching"),
            ),
            (
                Category::Images,
                RateLimitRule::new(30, "1 m").described("Image fetching"),
            ),
            (
                Category::Random,
                RateLimitRule::new(100, "1 m").described("Random tree selection"),
            ),
            (
                Category::Admin,
                RateLimitRule::new(5, "15 m")
                    .described("Admin authentication attempts (anti-brute-force)"),
            ),
        ]);
        Self {
            default: RateLimitRule::new(100, "1 m").described("General API endpoints"),
            rules,
        }
    }
}

impl CategoryLimits {
    /// Build a table from explicit rules, keeping built-in rules for the rest.
    pub fn with_rules(rules: impl IntoIterator<Item = (Category, RateLimitRule)>) -> Result<Self> {
        let mut limits = Self::default();
        for (category, rule) in rules {
            if category == Category::Default {
                limits.default = rule;
            } else {
                limits.rules.insert(category, rule);
            }
        }
        limits.validate()?;
        Ok(limits)
    }

    /// Load overrides from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load overrides from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let overrides: HashMap<Category, RateLimitRule> = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        Self::with_rules(overrides)
    }

    /// Get the rule for a category, falling back to the `default` rule.
    pub fn rule(&self, category: Category) -> &RateLimitRule {
        if category == Category::Default {
            return &self.default;
        }
        match self.rules.get(&category) {
            Some(rule) => rule,
            None => {
                debug!(category = %category, "No rule for category, using default");
                &self.default
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let all = std::iter::once((&Category::Default, &self.default)).chain(self.rules.iter());
        for (category, rule) in all {
            if rule.requests == 0 {
                return Err(WardenError::Config(format!(
                    "Rule for category '{}' must allow at least one request",
                    category
                )));
            }
        }
        Ok(())
    }
}
