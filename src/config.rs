//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `LIVESYNC_*` environment overrides.
//! Durations are plain millisecond or second fields in the file and are
//! converted into the runtime configs of each component.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::BusConfig;
use crate::dedup::DedupConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::monitor::{BackoffPolicy, MonitorConfig};
use crate::provider::{BreakerConfig, ChannelConfig, HttpBootstrapConfig};
use crate::service::RealtimeConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub dedup: DedupSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub bootstrap: BootstrapSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Event bus settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub max_listeners: usize,
    pub high_fan_out_max_listeners: usize,
    pub dedup_window_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_listeners: 10,
            high_fan_out_max_listeners: 100,
            dedup_window_ms: 1000,
        }
    }
}

/// Change deduplication settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub retention_ms: u64,
    pub prune_threshold: usize,
    pub capacity: usize,
    pub id_field: String,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            retention_ms: 10_000,
            prune_threshold: 100,
            capacity: 500,
            id_field: "id".to_string(),
        }
    }
}

/// Connection monitor settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_factor: f64,
    pub backoff_jitter: f64,
    pub health_check_interval_secs: u64,
    pub stalled_threshold_secs: u64,
    pub stall_confirm_delay_secs: u64,
    pub all_down_timeout_secs: u64,
    pub close_grace_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
            backoff_factor: 1.5,
            backoff_jitter: 0.2,
            health_check_interval_secs: 60,
            stalled_threshold_secs: 300,
            stall_confirm_delay_secs: 30,
            all_down_timeout_secs: 120,
            close_grace_ms: 0,
        }
    }
}

/// Heartbeat settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 35,
            check_interval_secs: 5,
        }
    }
}

/// Bootstrap circuit breaker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_secs: 60,
        }
    }
}

/// Bootstrap RPC settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    pub enabled: bool,
    pub base_url: String,
    pub rpc_path: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        let http = HttpBootstrapConfig::default();
        Self {
            enabled: false,
            base_url: http.base_url,
            rpc_path: http.rpc_path,
            api_key: None,
            request_timeout_ms: http.request_timeout_ms,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("livesync").join("config.toml")),
            Some(PathBuf::from("/etc/livesync/config.toml")),
            Some(PathBuf::from("./livesync.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Runtime configs for every component
    pub fn realtime(&self) -> RealtimeConfig {
        RealtimeConfig {
            bus: BusConfig {
                max_listeners: self.bus.max_listeners,
                high_fan_out_max_listeners: self.bus.high_fan_out_max_listeners,
                dedup_window: Duration::from_millis(self.bus.dedup_window_ms),
            },
            dedup: DedupConfig {
                retention: Duration::from_millis(self.dedup.retention_ms),
                prune_threshold: self.dedup.prune_threshold,
                capacity: self.dedup.capacity,
                id_field: self.dedup.id_field.clone(),
            },
            monitor: MonitorConfig {
                max_reconnect_attempts: self.monitor.max_reconnect_attempts,
                backoff: BackoffPolicy {
                    base: Duration::from_millis(self.monitor.backoff_base_ms),
                    cap: Duration::from_millis(self.monitor.backoff_cap_ms),
                    factor: self.monitor.backoff_factor,
                    jitter: self.monitor.backoff_jitter,
                },
                health_check_interval: Duration::from_secs(self.monitor.health_check_interval_secs),
                stalled_threshold: Duration::from_secs(self.monitor.stalled_threshold_secs),
                stall_confirm_delay: Duration::from_secs(self.monitor.stall_confirm_delay_secs),
                all_down_timeout: Duration::from_secs(self.monitor.all_down_timeout_secs),
                close_grace: Duration::from_millis(self.monitor.close_grace_ms),
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(self.heartbeat.interval_secs),
                timeout: Duration::from_secs(self.heartbeat.timeout_secs),
                check_interval: Duration::from_secs(self.heartbeat.check_interval_secs),
            },
            breaker: BreakerConfig {
                failure_threshold: self.breaker.failure_threshold,
                reset_timeout: Duration::from_secs(self.breaker.reset_timeout_secs),
            },
            channel: ChannelConfig::default(),
        }
    }

    /// HTTP bootstrap client config, if the bootstrap call is enabled
    pub fn bootstrap_client(&self) -> Option<HttpBootstrapConfig> {
        if !self.bootstrap.enabled {
            return None;
        }
        Some(HttpBootstrapConfig {
            base_url: self.bootstrap.base_url.clone(),
            rpc_path: self.bootstrap.rpc_path.clone(),
            api_key: self.bootstrap.api_key.clone(),
            request_timeout_ms: self.bootstrap.request_timeout_ms,
        })
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Monitor overrides
        if let Some(attempts) = var("LIVESYNC_MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.monitor.max_reconnect_attempts = attempts;
        }
        if let Some(base) = var("LIVESYNC_BACKOFF_BASE_MS").and_then(|v| v.parse().ok()) {
            self.monitor.backoff_base_ms = base;
        }
        if let Some(cap) = var("LIVESYNC_BACKOFF_CAP_MS").and_then(|v| v.parse().ok()) {
            self.monitor.backoff_cap_ms = cap;
        }

        // Heartbeat overrides
        if let Some(interval) = var("LIVESYNC_HEARTBEAT_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.heartbeat.interval_secs = interval;
        }
        if let Some(timeout) = var("LIVESYNC_HEARTBEAT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.heartbeat.timeout_secs = timeout;
        }

        // Bootstrap overrides
        if let Some(url) = var("LIVESYNC_BOOTSTRAP_URL") {
            self.bootstrap.base_url = url;
            self.bootstrap.enabled = true;
        }
        if let Some(key) = var("LIVESYNC_API_KEY") {
            self.bootstrap.api_key = Some(key);
        }

        // Logging overrides
        if let Some(level) = var("LIVESYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("LIVESYNC_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Livesync Configuration
#
# Environment variables override these settings:
# - LIVESYNC_MAX_RECONNECT_ATTEMPTS
# - LIVESYNC_BACKOFF_BASE_MS
# - LIVESYNC_BACKOFF_CAP_MS
# - LIVESYNC_HEARTBEAT_INTERVAL_SECS
# - LIVESYNC_HEARTBEAT_TIMEOUT_SECS
# - LIVESYNC_BOOTSTRAP_URL (also enables the bootstrap call)
# - LIVESYNC_API_KEY
# - LIVESYNC_LOG_LEVEL
# - LIVESYNC_LOG_FORMAT

[bus]
# Listener count per event that logs a leak warning
max_listeners = 10

# Same, for events many surfaces listen to
high_fan_out_max_listeners = 100

# Unchanged status events repeated within this window are dropped (ms)
dedup_window_ms = 1000

[dedup]
# How long a change fingerprint suppresses redeliveries (ms)
retention_ms = 10000

# Ring size above which old fingerprints are pruned on insert
prune_threshold = 100

# Hard cap on retained fingerprints
capacity = 500

# Row field holding the entity id
id_field = "id"

[monitor]
# Consecutive failures before a channel gives up
max_reconnect_attempts = 5

# Reconnect backoff: min(base * factor^n, cap) +/- jitter
backoff_base_ms = 1000
backoff_cap_ms = 30000
backoff_factor = 1.5
backoff_jitter = 0.2

# How often channel health is checked (seconds)
health_check_interval_secs = 60

# Open channel with no events for this long is suspected stalled (seconds)
stalled_threshold_secs = 300

# Second look before a stalled channel is reconnected (seconds)
stall_confirm_delay_secs = 30

# No channel open for this long triggers a full reconnect (seconds)
all_down_timeout_secs = 120

# Keep an unused channel open this long before closing it (ms)
close_grace_ms = 0

[heartbeat]
interval_secs = 30
timeout_secs = 35
check_interval_secs = 5

[breaker]
# Consecutive bootstrap failures before the breaker opens
failure_threshold = 3

# How long bootstrap calls are skipped once open (seconds)
reset_timeout_secs = 60

[bootstrap]
# Call the "enable realtime" RPC before opening a resource's first channel
enabled = false
base_url = "http://localhost:54321"
rpc_path = "/rest/v1/rpc/enable_realtime"
# api_key = ""
request_timeout_ms = 5000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
