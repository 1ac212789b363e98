//! SalesRelay configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Environment variable that overrides `broker.uri`.
pub const BROKER_URI_ENV: &str = "RABBITMQ_URI";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SalesRelayConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

impl SalesRelayConfig {
    /// Load config from the default path (~/.salesrelay/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn with_env_overrides(mut self) -> Self {
        match std::env::var(BROKER_URI_ENV) {
            Ok(uri) if !uri.trim().is_empty() => self.broker.uri = uri,
            _ => {}
        }
        self
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the SalesRelay home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".salesrelay")
    }
}

/// Expand `~` in configured paths.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

fn default_store_path() -> String { "~/.salesrelay/records.db".into() }
fn default_query_timeout() -> u64 { 10 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Daily trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local time of day, `HH:MM` or `M H * * *`.
    #[serde(default = "default_fire_at")]
    pub fire_at: String,
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
    #[serde(default = "default_firing_timeout")]
    pub firing_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_fire_at() -> String { "12:00".into() }
fn default_window_hours() -> u32 { 24 }
fn default_firing_timeout() -> u64 { 300 }
fn default_shutdown_grace() -> u64 { 30 }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            fire_at: default_fire_at(),
            window_hours: default_window_hours(),
            firing_timeout_secs: default_firing_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ScheduleConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.window_hours))
    }

    pub fn firing_timeout(&self) -> Duration {
        Duration::from_secs(self.firing_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Broker connection configuration, shared by publisher and consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_uri")]
    pub uri: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u16,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

fn default_broker_uri() -> String { "amqp://127.0.0.1:5672/%2f".into() }
fn default_queue() -> String { "daily_sales_report".into() }
fn default_dead_letter_queue() -> String { "daily_sales_report.dead".into() }
fn default_heartbeat() -> u16 { 60 }
fn default_reconnect_interval() -> u64 { 5 }
fn default_max_reconnect_attempts() -> u32 { 5 }
fn default_operation_timeout() -> u64 { 10 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: default_broker_uri(),
            queue: default_queue(),
            dead_letter_queue: default_dead_letter_queue(),
            heartbeat_secs: default_heartbeat(),
            reconnect_interval_secs: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Consumer process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,
    /// `log` or `email`.
    #[serde(default = "default_handler")]
    pub handler: String,
}

fn default_prefetch() -> u16 { 1 }
fn default_max_attempts() -> u32 { 3 }
fn default_handler_timeout() -> u64 { 60 }
fn default_consumer_tag() -> String { "salesrelay-consumer".into() }
fn default_handler() -> String { "log".into() }

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: default_prefetch(),
            max_attempts: default_max_attempts(),
            handler_timeout_secs: default_handler_timeout(),
            consumer_tag: default_consumer_tag(),
            handler: default_handler(),
        }
    }
}

impl ConsumerConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

/// SMTP settings for the email handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
}

fn default_smtp_port() -> u16 { 587 }
fn default_subject() -> String { "Daily sales report".into() }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: String::new(),
            to: Vec::new(),
            subject: default_subject(),
        }
    }
}
