//! Configuration for request orchestration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Call [`OrchestratorConfig::validate`] (or use
//! [`OrchestratorConfig::load`], which does it for you) before wiring the
//! values into an orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Upstream call and retry settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Per-conversation rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Response cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Prompt token budgeting.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Disallowed-content rules.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Canned text used when the upstream is unavailable.
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Streaming broker.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Per-section templates, keyed by section id.
    #[serde(default)]
    pub sections: HashMap<String, SectionConfig>,
}

/// Upstream timeout and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Per-attempt timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after the first attempt (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds (default: 500).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds, jitter included (default: 8000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random jitter as a fraction of each delay, in `[0, 1]` (default: 0.2).
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl UpstreamConfig {
    /// Per-attempt timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base backoff delay as a Duration.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff cap as a Duration.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Fixed-window rate limiting, per conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Window length in seconds (default: 60).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Requests allowed per window (default: 20).
    #[serde(default = "default_quota")]
    pub quota: u32,

    /// Block applied after a violation, 0 to disable (default: 0).
    #[serde(default)]
    pub block_secs: u64,

    /// Windows idle longer than this are dropped (default: 3600).
    #[serde(default = "default_idle_evict_secs")]
    pub idle_evict_secs: u64,

    /// How often idle windows are evicted (default: 300).
    #[serde(default = "default_evict_interval_secs")]
    pub evict_interval_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

fn default_quota() -> u32 {
    20
}

fn default_idle_evict_secs() -> u64 {
    3600 // 1 hour
}

fn default_evict_interval_secs() -> u64 {
    300 // 5 minutes
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            quota: default_quota(),
            block_secs: 0,
            idle_evict_secs: default_idle_evict_secs(),
            evict_interval_secs: default_evict_interval_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Window length as a Duration.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Post-violation block as a Duration.
    #[must_use]
    pub fn block(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }

    /// Idle threshold as a Duration.
    #[must_use]
    pub fn idle_evict(&self) -> Duration {
        Duration::from_secs(self.idle_evict_secs)
    }

    /// Eviction interval as a Duration.
    #[must_use]
    pub fn evict_interval(&self) -> Duration {
        Duration::from_secs(self.evict_interval_secs)
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether responses are cached at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Time-to-live of a cached response in seconds (default: 3600).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// How often expired entries are swept in seconds (default: 300).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Prompt characters that take part in the cache key (default: 500).
    #[serde(default = "default_key_prefix_chars")]
    pub key_prefix_chars: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_sweep_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_key_prefix_chars() -> usize {
    500
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            key_prefix_chars: default_key_prefix_chars(),
        }
    }
}

impl CacheConfig {
    /// Entry TTL as a Duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep interval as a Duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Prompt token budgeting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetConfig {
    /// Prompt budget for sections without their own (default: 3000).
    #[serde(default = "default_prompt_tokens")]
    pub default_prompt_tokens: u32,

    /// Fraction of the budget truncation aims for (default: 0.8).
    #[serde(default = "default_headroom_ratio")]
    pub headroom_ratio: f64,

    /// Tokens per word for unknown models (default: 1.3).
    #[serde(default = "default_multiplier")]
    pub default_multiplier: f64,

    /// Tokens per word by model-name prefix; the longest matching prefix wins.
    #[serde(default)]
    pub model_multipliers: BTreeMap<String, f64>,
}

fn default_prompt_tokens() -> u32 {
    3000
}

fn default_headroom_ratio() -> f64 {
    0.8
}

fn default_multiplier() -> f64 {
    1.3
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_prompt_tokens: default_prompt_tokens(),
            headroom_ratio: default_headroom_ratio(),
            default_multiplier: default_multiplier(),
            model_multipliers: BTreeMap::new(),
        }
    }
}

/// A named disallowed-content pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterRule {
    /// Name reported when the rule matches.
    pub name: String,
    /// Case-insensitive regular expression.
    pub pattern: String,
}

impl FilterRule {
    /// Creates a rule.
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self { name: name.into(), pattern: pattern.into() }
    }
}

/// Disallowed-content rules applied to every input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterConfig {
    /// Rules, checked in order.
    #[serde(default = "default_rules")]
    pub rules: Vec<FilterRule>,
}

fn default_rules() -> Vec<FilterRule> {
    vec![
        FilterRule::new("instruction_override", r"\b(ignore|disregard)\s+(all\s+)?(previous|prior|above)\s+instructions\b"),
        FilterRule::new("system_prompt_probe", r"\b(reveal|print|show)\s+(your|the)\s+system\s+prompt\b"),
    ]
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { rules: default_rules() }
    }
}

/// Canned text returned when the upstream stays unavailable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackConfig {
    /// Text used for sections without their own fallback.
    #[serde(default = "default_fallback_text")]
    pub default_text: String,
}

fn default_fallback_text() -> String {
    "The writing assistant is temporarily unavailable. Your progress has been saved; \
     please continue with this section and try again in a few minutes."
        .to_string()
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { default_text: default_fallback_text() }
    }
}

/// Streaming broker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Events queued per connection before it is evicted as lagging (default: 256).
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,
}

fn default_connection_buffer() -> usize {
    256
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { connection_buffer: default_connection_buffer() }
    }
}

/// A user/assistant pair shown to the model before the real prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FewShotExample {
    pub user: String,
    pub assistant: String,
}

/// Template for one document section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionConfig {
    /// System prompt framing the section.
    #[serde(default)]
    pub system_prompt: String,

    #[serde(default)]
    pub examples: Vec<FewShotExample>,

    /// Section-specific fallback text.
    #[serde(default)]
    pub fallback: Option<String>,

    /// Section-specific prompt budget in tokens.
    #[serde(default)]
    pub token_budget: Option<u32>,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid TOML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A numeric setting is outside its allowed range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Dotted path of the offending field.
        field: String,
        /// What the value must satisfy.
        reason: String,
    },

    /// A filter rule does not compile.
    #[error("Invalid filter rule '{name}': {reason}")]
    InvalidRule {
        /// Rule name.
        name: String,
        /// Regex compiler message.
        reason: String,
    },

    /// The builder was not given an upstream client.
    #[error("No upstream client configured")]
    MissingClient,
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn invalid(field: impl Into<String>, reason: &str) -> ConfigError {
    ConfigError::InvalidValue { field: field.into(), reason: reason.to_string() }
}

impl OrchestratorConfig {
    /// Parses a TOML document without validating it.
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` if the document does not match the schema.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file is unreadable, malformed or invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Filter patterns are compiled here too, so a config that validates
    /// always builds a working content filter.
    ///
    /// # Errors
    /// Returns the first `ConfigError` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let upstream = &self.upstream;
        if upstream.timeout_secs == 0 {
            return Err(invalid("upstream.timeout_secs", "must be greater than 0"));
        }
        if upstream.base_delay_ms == 0 {
            return Err(invalid("upstream.base_delay_ms", "must be greater than 0"));
        }
        if upstream.max_delay_ms < upstream.base_delay_ms {
            return Err(invalid("upstream.max_delay_ms", "must be at least base_delay_ms"));
        }
        if !(0.0..=1.0).contains(&upstream.jitter_ratio) {
            return Err(invalid("upstream.jitter_ratio", "must be between 0 and 1"));
        }

        let rate_limit = &self.rate_limit;
        if rate_limit.window_secs == 0 {
            return Err(invalid("rate_limit.window_secs", "must be greater than 0"));
        }
        if rate_limit.quota == 0 {
            return Err(invalid("rate_limit.quota", "must be greater than 0"));
        }
        if rate_limit.idle_evict_secs < rate_limit.window_secs {
            return Err(invalid("rate_limit.idle_evict_secs", "must be at least window_secs"));
        }
        if rate_limit.evict_interval_secs == 0 {
            return Err(invalid("rate_limit.evict_interval_secs", "must be greater than 0"));
        }

        let cache = &self.cache;
        if cache.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs", "must be greater than 0"));
        }
        if cache.sweep_interval_secs == 0 {
            return Err(invalid("cache.sweep_interval_secs", "must be greater than 0"));
        }
        if cache.key_prefix_chars == 0 {
            return Err(invalid("cache.key_prefix_chars", "must be greater than 0"));
        }

        let budget = &self.budget;
        if budget.default_prompt_tokens == 0 {
            return Err(invalid("budget.default_prompt_tokens", "must be greater than 0"));
        }
        if !is_positive(budget.headroom_ratio) || budget.headroom_ratio > 1.0 {
            return Err(invalid("budget.headroom_ratio", "must be in (0, 1]"));
        }
        if !is_positive(budget.default_multiplier) {
            return Err(invalid("budget.default_multiplier", "must be greater than 0"));
        }
        for (prefix, multiplier) in &budget.model_multipliers {
            if !is_positive(*multiplier) {
                return Err(invalid(format!("budget.model_multipliers.{prefix}"), "must be greater than 0"));
            }
        }

        if self.broker.connection_buffer == 0 {
            return Err(invalid("broker.connection_buffer", "must be greater than 0"));
        }

        for (id, section) in &self.sections {
            if section.token_budget == Some(0) {
                return Err(invalid(format!("sections.{id}.token_budget"), "must be greater than 0"));
            }
        }

        crate::filter::ContentFilter::new(&self.filter.rules)?;

        Ok(())
    }

    /// Prompt budget for a section.
    #[must_use]
    pub fn section_budget(&self, section_id: &str) -> u32 {
        self.sections
            .get(section_id)
            .and_then(|s| s.token_budget)
            .unwrap_or(self.budget.default_prompt_tokens)
    }

    /// Fallback text for a section.
    #[must_use]
    pub fn fallback_text(&self, section_id: &str) -> &str {
        self.sections
            .get(section_id)
            .and_then(|s| s.fallback.as_deref())
            .unwrap_or(&self.fallback.default_text)
    }
}
