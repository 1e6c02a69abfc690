// Configuration management with layered configuration (defaults, files, env)

use crate::cache_scheduler::SchedulerOptions;
use chrono::NaiveTime;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use config::ConfigError;

/// Upper bound for every configured interval: one week
pub const MAX_INTERVAL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub update_on_startup: bool,
    /// Local time of the daily refresh, `HH:MM:SS`
    pub daily_update_time: NaiveTime,
    pub lock_dir: PathBuf,
    pub update_timeout_seconds: u64,
    pub supervisor_poll_seconds: u64,
    pub retry_backoff_seconds: u64,
    pub monitor_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_port: Option<u16>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Not committed to git
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        let cache = &self.cache;
        if cache.update_timeout_seconds == 0 {
            return Err("Cache update_timeout_seconds must be greater than 0".to_string());
        }
        if cache.update_timeout_seconds > MAX_INTERVAL_SECONDS {
            return Err(format!(
                "Cache update_timeout_seconds cannot exceed {}",
                MAX_INTERVAL_SECONDS
            ));
        }
        if cache.supervisor_poll_seconds == 0 {
            return Err("Cache supervisor_poll_seconds must be greater than 0".to_string());
        }
        if cache.supervisor_poll_seconds > cache.update_timeout_seconds {
            return Err(
                "Cache supervisor_poll_seconds cannot exceed update_timeout_seconds".to_string(),
            );
        }
        if cache.monitor_interval_seconds == 0 {
            return Err("Cache monitor_interval_seconds must be greater than 0".to_string());
        }
        if cache.monitor_interval_seconds > MAX_INTERVAL_SECONDS {
            return Err(format!(
                "Cache monitor_interval_seconds cannot exceed {}",
                MAX_INTERVAL_SECONDS
            ));
        }
        if cache.retry_backoff_seconds > MAX_INTERVAL_SECONDS {
            return Err(format!(
                "Cache retry_backoff_seconds cannot exceed {}",
                MAX_INTERVAL_SECONDS
            ));
        }
        if cache.lock_dir.as_os_str().is_empty() {
            return Err("Cache lock_dir cannot be empty".to_string());
        }

        if self.store.path.as_os_str().is_empty() {
            return Err("Store path cannot be empty".to_string());
        }

        if self.observability.metrics_port == Some(0) {
            return Err("Metrics port must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl CacheSettings {
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            update_timeout: Duration::from_secs(self.update_timeout_seconds),
            supervisor_poll_interval: Duration::from_secs(self.supervisor_poll_seconds),
            retry_backoff: Duration::from_secs(self.retry_backoff_seconds),
            monitor_interval: Duration::from_secs(self.monitor_interval_seconds),
            ..SchedulerOptions::default()
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            update_on_startup: false,
            daily_update_time: NaiveTime::from_hms_opt(4, 0, 0).unwrap_or_default(),
            lock_dir: std::env::temp_dir(),
            update_timeout_seconds: 1800,
            supervisor_poll_seconds: 60,
            retry_backoff_seconds: 1800,
            monitor_interval_seconds: 300,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_port: None,
        }
    }
}
