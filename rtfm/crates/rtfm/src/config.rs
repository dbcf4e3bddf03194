//! Configuration Module - Runtime Tuning Parameters
//!
//! Manages all configuration parameters for the transactional runtime.
//! Configuration can come from defaults, environment variables or a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// What to do when a transaction aborts by language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InternalAbortAction {
    /// Treat the language abort as fatal
    Crash,
    /// Abort the transaction and report `AbortedByLanguage`
    Abort,
}

/// Debug retry mode
///
/// A retried transaction runs once, is deliberately aborted (undo plus abort
/// tasks), then runs again and commits. Useful to shake out code whose abort
/// path was never exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryTransactions {
    NoRetry,
    RetryNonNested,
    RetryNestedToo,
}

impl RetryTransactions {
    /// Whether a transaction at the given nesting level gets a debug retry
    pub fn applies_to(self, nested: bool) -> bool {
        match self {
            RetryTransactions::NoRetry => false,
            RetryTransactions::RetryNonNested => !nested,
            RetryTransactions::RetryNestedToo => true,
        }
    }
}

/// Main configuration for the runtime
///
/// # Examples
///
/// ```rust
/// use rtfm::{RetryTransactions, RuntimeConfig};
///
/// let config = RuntimeConfig {
///     retry: RetryTransactions::RetryNonNested,
///     page_size: 16 * 1024,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run transactions at all
    ///
    /// When false, `transact` runs work as open code and reports `Committed`.
    /// Default: true
    pub enabled: bool,

    /// Reaction to `AbortedByLanguage`
    ///
    /// Default: `Abort`
    pub internal_abort_action: InternalAbortAction,

    /// Log an error for every language abort
    ///
    /// Default: false
    pub ensure_on_internal_abort: bool,

    /// Debug retry mode
    ///
    /// Default: `NoRetry`
    pub retry: RetryTransactions,

    /// Page size of the undo-copy allocator in bytes
    ///
    /// Copies larger than a page get a dedicated page.
    /// Must be a power of two between 256 bytes and 1MB.
    /// Default: 4KB
    pub page_size: usize,

    /// Upper bound on lock-conflict retries of one outer transaction
    ///
    /// None retries until the lock hook succeeds.
    /// Default: None
    pub max_lock_retries: Option<u32>,

    /// Maintain per-context statistics
    ///
    /// Default: true
    pub stats_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            internal_abort_action: InternalAbortAction::Abort,
            ensure_on_internal_abort: false,
            retry: RetryTransactions::NoRetry,
            page_size: 4 * KB,
            max_lock_retries: None,
            stats_enabled: true,
        }
    }
}

impl RuntimeConfig {
    /// Validate configuration
    ///
    /// ```rust
    /// use rtfm::RuntimeConfig;
    ///
    /// let config = RuntimeConfig {
    ///     page_size: 1000, // not a power of two
    ///     ..Default::default()
    /// };
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::InvalidPageSize(format!(
                "page_size ({}) must be a power of two",
                self.page_size
            )));
        }

        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidPageSize(format!(
                "page_size ({}) must be between {} and {}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with:
    /// - RTFM_ENABLED
    /// - RTFM_INTERNAL_ABORT_ACTION (`crash` or `abort`)
    /// - RTFM_ENSURE_ON_INTERNAL_ABORT
    /// - RTFM_RETRY (`no-retry`, `retry-non-nested`, `retry-nested-too`)
    /// - RTFM_PAGE_SIZE
    /// - RTFM_MAX_LOCK_RETRIES
    /// - RTFM_STATS
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RTFM_ENABLED") {
            config.enabled = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("RTFM_INTERNAL_ABORT_ACTION") {
            match val.to_ascii_lowercase().as_str() {
                "crash" => config.internal_abort_action = InternalAbortAction::Crash,
                "abort" => config.internal_abort_action = InternalAbortAction::Abort,
                other => log::warn!("ignoring RTFM_INTERNAL_ABORT_ACTION={}", other),
            }
        }

        if let Ok(val) = std::env::var("RTFM_ENSURE_ON_INTERNAL_ABORT") {
            config.ensure_on_internal_abort = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("RTFM_RETRY") {
            match val.to_ascii_lowercase().as_str() {
                "no-retry" | "none" | "0" => config.retry = RetryTransactions::NoRetry,
                "retry-non-nested" | "1" => config.retry = RetryTransactions::RetryNonNested,
                "retry-nested-too" | "2" => config.retry = RetryTransactions::RetryNestedToo,
                other => log::warn!("ignoring RTFM_RETRY={}", other),
            }
        }

        if let Ok(val) = std::env::var("RTFM_PAGE_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.page_size = size;
            }
        }

        if let Ok(val) = std::env::var("RTFM_MAX_LOCK_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                config.max_lock_retries = Some(retries);
            }
        }

        if let Ok(val) = std::env::var("RTFM_STATS") {
            config.stats_enabled = parse_flag(&val);
        }

        config
    }

    /// Parse configuration from TOML text
    ///
    /// Missing keys keep their defaults. The result is validated.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_path(path: &Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&text)?)
    }

    /// Serialize configuration back to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid page size: {0}")]
    InvalidPageSize(String),

    #[error("Invalid config source: {0}")]
    Parse(String),
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

const MIN_PAGE_SIZE: usize = 256;
const MAX_PAGE_SIZE: usize = MB;

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true") || val.eq_ignore_ascii_case("on")
}
