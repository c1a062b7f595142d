//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.
//! Every field has a default, so `{}` is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mcp::capabilities::DEFAULT_PROTOCOL_VERSIONS;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Protocol settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Rate limiting settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Session lifecycle settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.supported_versions.is_empty() {
            return Err(invalid("protocol.supported_versions must not be empty"));
        }

        let rl = &self.rate_limit;
        for (name, value) in [
            ("requests_per_window", u64::from(rl.requests_per_window)),
            ("burst_limit", u64::from(rl.burst_limit)),
            ("window_secs", rl.window_secs),
            ("max_violations", u64::from(rl.max_violations)),
            ("cleanup_interval_secs", rl.cleanup_interval_secs),
        ] {
            if value == 0 {
                return Err(invalid(format!("rate_limit.{name} must be greater than 0")));
            }
        }

        if self.session.cleanup_interval_secs == 0 {
            return Err(invalid("session.cleanup_interval_secs must be greater than 0"));
        }

        if self.auth.methods.is_empty() {
            return Err(invalid("auth.methods must list at least one method"));
        }
        if self.auth.enabled
            && self.auth.methods.iter().any(|m| m == "api_key")
            && self.auth.api_keys.is_empty()
        {
            return Err(invalid("auth.api_keys must not be empty when api_key is enabled"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

/// Protocol configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    /// Supported protocol versions, most preferred first.
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<String>,

    /// Include panic details in internal error messages.
    /// Default: false
    #[serde(default)]
    pub expose_internal_errors: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            supported_versions: default_supported_versions(),
            expose_internal_errors: false,
        }
    }
}

fn default_supported_versions() -> Vec<String> {
    DEFAULT_PROTOCOL_VERSIONS
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enforced.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per sliding window.
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    /// Token bucket capacity.
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    /// Sliding window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How long a client stays blocked, in seconds.
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,

    /// Violations before a client is blocked.
    #[serde(default = "default_max_violations")]
    pub max_violations: u32,

    /// Interval between inactive-client sweeps, in seconds.
    #[serde(default = "default_rate_cleanup_secs")]
    pub cleanup_interval_secs: u64,

    /// Idle time after which a client's state is dropped, in seconds.
    #[serde(default = "default_inactive_client_secs")]
    pub inactive_client_secs: u64,
}

impl RateLimitConfig {
    /// Sliding window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Block duration.
    #[must_use]
    pub const fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }

    /// Sweep interval.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Inactivity threshold for the sweep.
    #[must_use]
    pub const fn inactive_threshold(&self) -> Duration {
        Duration::from_secs(self.inactive_client_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: default_requests_per_window(),
            burst_limit: default_burst_limit(),
            window_secs: default_window_secs(),
            block_secs: default_block_secs(),
            max_violations: default_max_violations(),
            cleanup_interval_secs: default_rate_cleanup_secs(),
            inactive_client_secs: default_inactive_client_secs(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_requests_per_window() -> u32 {
    60
}

const fn default_burst_limit() -> u32 {
    10
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_block_secs() -> u64 {
    300
}

const fn default_max_violations() -> u32 {
    5
}

const fn default_rate_cleanup_secs() -> u64 {
    600
}

const fn default_inactive_client_secs() -> u64 {
    3600
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Idle time after which a session is evicted, in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Interval between idle-session sweeps, in seconds.
    #[serde(default = "default_session_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

impl SessionConfig {
    /// Idle timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            cleanup_interval_secs: default_session_cleanup_secs(),
        }
    }
}

const fn default_idle_timeout_secs() -> u64 {
    1800
}

const fn default_session_cleanup_secs() -> u64 {
    300
}

/// Authentication configuration.
///
/// API keys are never logged or echoed in errors.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Whether authentication is performed at all.
    /// Default: false (every session is authenticated with method "none")
    #[serde(default)]
    pub enabled: bool,

    /// Reject requests from unauthenticated sessions.
    #[serde(default)]
    pub required: bool,

    /// Whitelisted methods ("none", "api_key").
    #[serde(default = "default_auth_methods")]
    pub methods: Vec<String>,

    /// Accepted API keys.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("enabled", &self.enabled)
            .field("required", &self.required)
            .field("methods", &self.methods)
            .field("api_keys", &format_args!("[{} redacted]", self.api_keys.len()))
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            methods: default_auth_methods(),
            api_keys: Vec::new(),
        }
    }
}

fn default_auth_methods() -> Vec<String> {
    vec!["none".to_string()]
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
