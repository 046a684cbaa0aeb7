//! Application settings and configuration

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use feed_common::error::ConfigurationError;
use feed_common::RetryPolicy;

use crate::schema::{DataKind, Interval, LifecycleStatus, Market};

/// Main application settings
///
/// Built once at process start and passed down by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Database configuration
    pub database: DatabaseSettings,
    /// Remote data provider
    #[serde(default)]
    pub provider: ProviderSettings,
    /// Sync engine behaviour
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Retry settings for one class of I/O
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound on a single delay in milliseconds
    pub max_delay_ms: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Pool acquire timeout in seconds
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Schema holding the series tables; empty for the search path
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Reference table listing futures instruments and their lifecycle
    #[serde(default = "default_instruments_table")]
    pub instruments_table: String,
    /// Spot exchange pairs, same shape as `instruments_table`
    #[serde(default = "default_spot_instruments_table")]
    pub spot_instruments_table: String,
    /// Index family instruments, same shape as `instruments_table`
    #[serde(default = "default_index_instruments_table")]
    pub index_instruments_table: String,
    /// Retry on dropped connections
    #[serde(default = "default_database_retry")]
    pub retry: RetrySettings,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_schema() -> String {
    "market".to_string()
}

fn default_instruments_table() -> String {
    "futures_instruments".to_string()
}

fn default_spot_instruments_table() -> String {
    "spot_instruments".to_string()
}

fn default_index_instruments_table() -> String {
    "index_instruments".to_string()
}

fn default_database_retry() -> RetrySettings {
    // First attempt plus two reconnects
    RetrySettings {
        max_attempts: 3,
        initial_delay_ms: 250,
        max_delay_ms: 5_000,
    }
}

impl DatabaseSettings {
    pub fn schema_name(&self) -> Option<&str> {
        Some(self.schema.as_str()).filter(|s| !s.is_empty())
    }

    /// Catalog table listing the instruments of `kind`'s market
    pub fn instruments_table_for(&self, kind: DataKind) -> &str {
        match kind.market() {
            Market::Futures => &self.instruments_table,
            Market::Spot => &self.spot_instruments_table,
            Market::Index => &self.index_instruments_table,
        }
    }
}

/// Remote data provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key sent as `Authorization: Apikey <key>`
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Minimum spacing between calls, shared by all syncers
    #[serde(default = "default_call_delay_ms")]
    pub call_delay_ms: u64,
    /// Retry on 429/5xx, timeouts and connection errors
    #[serde(default = "default_provider_retry")]
    pub retry: RetrySettings,
}

fn default_base_url() -> String {
    "https://data-api.coindesk.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_call_delay_ms() -> u64 {
    100
}

fn default_provider_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 5,
        initial_delay_ms: 2_000,
        max_delay_ms: 30_000,
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            call_delay_ms: default_call_delay_ms(),
            retry: default_provider_retry(),
        }
    }
}

impl ProviderSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }
}

/// Per-call page size limit for one kind at one interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageLimitOverride {
    pub kind: DataKind,
    pub interval: Interval,
    pub limit: u32,
}

/// Provider page size limits, per interval with optional per-kind overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageLimits {
    #[serde(default = "default_day_limit")]
    pub day: u32,
    #[serde(default = "default_intraday_limit")]
    pub hour: u32,
    #[serde(default = "default_intraday_limit")]
    pub minute: u32,
    #[serde(default)]
    pub overrides: Vec<PageLimitOverride>,
}

fn default_day_limit() -> u32 {
    5000
}

fn default_intraday_limit() -> u32 {
    2000
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            day: default_day_limit(),
            hour: default_intraday_limit(),
            minute: default_intraday_limit(),
            overrides: Vec::new(),
        }
    }
}

impl PageLimits {
    pub fn limit_for(&self, kind: DataKind, interval: Interval) -> u32 {
        self.overrides
            .iter()
            .find(|o| o.kind == kind && o.interval == interval)
            .map(|o| o.limit)
            .unwrap_or(match interval {
                Interval::Day => self.day,
                Interval::Hour => self.hour,
                Interval::Minute => self.minute,
            })
    }
}

/// Sync engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Targets synced concurrently
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    /// Consecutive failed targets before scheduling stops
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Keep scheduling after a target fails
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    /// Lifecycle statuses synced when no filter is given
    #[serde(default = "default_statuses")]
    pub statuses: Vec<LifecycleStatus>,
    /// Cold-start horizon in periods; defaults to the page limit
    #[serde(default)]
    pub max_backfill_periods: Option<u32>,
    /// Provider page size limits
    #[serde(default)]
    pub page_limits: PageLimits,
}

fn default_parallel_workers() -> usize {
    4
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_statuses() -> Vec<LifecycleStatus> {
    vec![LifecycleStatus::Active, LifecycleStatus::Expired]
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            parallel_workers: default_parallel_workers(),
            max_consecutive_failures: default_max_consecutive_failures(),
            continue_on_error: true,
            statuses: default_statuses(),
            max_backfill_periods: None,
            page_limits: PageLimits::default(),
        }
    }
}

impl Settings {
    /// Load settings from configuration files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("FEED_SYNC")
    }

    /// Load settings with a custom environment variable prefix
    pub fn load_with_prefix(env_prefix: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config_dir = Self::config_dir();

        let s = Config::builder()
            // Defaults so a bare environment still deserializes
            .set_default("database.url", default_database_url())?
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            // Local overrides (not checked into git)
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            // Environment variables (e.g., FEED_SYNC__DATABASE__URL)
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Get the configuration directory path
    fn config_dir() -> String {
        std::env::var("FEED_SYNC_CONFIG_DIR").unwrap_or_else(|_| "config".into())
    }

    /// Create default settings (useful for testing)
    pub fn default_settings() -> Self {
        Settings {
            database: DatabaseSettings {
                url: default_database_url(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                acquire_timeout_secs: default_acquire_timeout_secs(),
                schema: default_schema(),
                instruments_table: default_instruments_table(),
                spot_instruments_table: default_spot_instruments_table(),
                index_instruments_table: default_index_instruments_table(),
                retry: default_database_retry(),
            },
            provider: ProviderSettings::default(),
            sync: SyncSettings::default(),
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigurationError::MissingField("database.url".into()));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(ConfigurationError::MissingField("provider.base_url".into()));
        }
        if self.sync.parallel_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "sync.parallel_workers",
                "must be at least 1",
            ));
        }
        if self.database.max_connections < self.database.min_connections {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "must not be below database.min_connections",
            ));
        }

        let limits = &self.sync.page_limits;
        let zero_limit = [limits.day, limits.hour, limits.minute]
            .into_iter()
            .chain(limits.overrides.iter().map(|o| o.limit))
            .any(|l| l == 0);
        if zero_limit {
            return Err(ConfigurationError::invalid_value(
                "sync.page_limits",
                "limits must be at least 1",
            ));
        }
        if self.sync.max_backfill_periods == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "sync.max_backfill_periods",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}

fn default_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgresql://localhost/market_data".into())
}

impl Default for Settings {
    fn default() -> Self {
        Self::default_settings()
    }
}
