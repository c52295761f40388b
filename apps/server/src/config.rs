//! Application configuration.

use ceremony_alerts::NotifierConfig;
use ceremony_engine::{MonitorConfig, RetryConfig, StatusClientConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the Telegram bot token.
pub const BOT_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite connection URL.
    pub database_url: String,
    /// Port of the health HTTP endpoint.
    pub health_port: u16,
    /// Logging level.
    pub log_level: String,
    pub service: ServiceSettings,
    pub monitor: MonitorSettings,
    pub retry: RetrySettings,
    pub notifier: NotifierSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ceremony.db".to_string(),
            health_port: 8080,
            log_level: "info".to_string(),
            service: ServiceSettings::default(),
            monitor: MonitorSettings::default(),
            retry: RetrySettings::default(),
            notifier: NotifierSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Ceremony service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        let defaults = StatusClientConfig::default();
        Self {
            base_url: defaults.base_url,
            request_timeout_secs: defaults.request_timeout.as_secs(),
        }
    }
}

impl From<&ServiceSettings> for StatusClientConfig {
    fn from(settings: &ServiceSettings) -> Self {
        StatusClientConfig {
            base_url: settings.base_url.clone(),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            ..Default::default()
        }
    }
}

/// Monitor scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Seconds between a user's polls.
    pub interval_secs: u64,
    pub supervisor_interval_secs: u64,
    pub health_max_age_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            supervisor_interval_secs: 60,
            health_max_age_secs: 180,
            stop_grace_secs: 5,
        }
    }
}

impl From<&MonitorSettings> for MonitorConfig {
    fn from(settings: &MonitorSettings) -> Self {
        MonitorConfig {
            tick_interval: Duration::from_secs(settings.interval_secs.max(1)),
            supervisor_interval: Duration::from_secs(settings.supervisor_interval_secs.max(1)),
            health_max_age: Duration::from_secs(settings.health_max_age_secs),
            stop_grace: Duration::from_secs(settings.stop_grace_secs),
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 5,
            max_delay_secs: 20,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
        }
    }
}

/// Alert delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    pub delivery_timeout_secs: u64,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            delivery_timeout_secs: 10,
        }
    }
}

impl From<&NotifierSettings> for NotifierConfig {
    fn from(settings: &NotifierSettings) -> Self {
        NotifierConfig {
            delivery_timeout: Duration::from_secs(settings.delivery_timeout_secs),
        }
    }
}

/// Read the bot token from the environment. Empty counts as unset.
pub fn bot_token_from_env() -> Option<String> {
    std::env::var(BOT_TOKEN_ENV)
        .ok()
        .filter(|token| !token.trim().is_empty())
}
