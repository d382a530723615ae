use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings for the hosted backend (auth endpoints, table reads,
/// edge functions all live under one base URL).
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Publishable API key sent with every request. Not a secret.
    #[serde(default)]
    pub api_key: String,
    /// Timeout for individual backend requests in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Where the verification email should send the user back to
    pub email_redirect_to: Option<String>,
    /// Where the password-reset email should send the user back to
    pub password_reset_redirect: Option<String>,
    /// Callback URL for OAuth redirect sign-in
    pub oauth_redirect_to: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout(),
            email_redirect_to: None,
            password_reset_redirect: None,
            oauth_redirect_to: None,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:54321".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

/// Tuning for the profile-fetch retry loop. Only transient errors are
/// retried; the delay before retry N is `N * base_delay_ms`.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff unit in milliseconds (default: 1000)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms * u64::from(retry))
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

/// Cadence and thresholds for the session health monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Interval between session health probes in seconds (default: 300)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Consecutive probe failures before warning the user (default: 2)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

fn default_probe_interval() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
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
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

/// Install the global tracing subscriber. Called once by the embedding
/// application; `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
