//! Application configuration.
//!
//! Loaded from an optional TOML file, then overridden by `VITALS__*`
//! environment variables (`VITALS__BROKER__URL`, `VITALS__RECONNECT__ENABLED`, ...).

use crate::error::{AppError, AppResult};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use vitals_broker::{ConnectOptions, ReconnectPolicy, DEFAULT_ENDPOINT};
use vitals_dashboard::DashboardConfig;
use vitals_feed::DEFAULT_WINDOW_CAPACITY;
use vitals_telemetry::LoggingConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const ENV_PREFIX: &str = "VITALS";

/// Broker endpoint and session options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Generated per run when unset.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Inbound queue between the connection and the dispatcher.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_url() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_clean_session() -> bool {
    true
}

fn default_inbound_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            client_id: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            clean_session: default_clean_session(),
            username: None,
            password: None,
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

impl From<&BrokerConfig> for ConnectOptions {
    fn from(cfg: &BrokerConfig) -> Self {
        let defaults = ConnectOptions::default();
        Self {
            client_id: cfg.client_id.clone().unwrap_or(defaults.client_id),
            keep_alive_secs: cfg.keep_alive_secs,
            connect_timeout_ms: cfg.connect_timeout_ms,
            clean_session: cfg.clean_session,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        }
    }
}

/// Automatic reconnection after an unexpected drop. Off unless enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Maximum attempts per outage (0 = unlimited).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        if cfg.enabled {
            ReconnectPolicy::exponential(cfg.max_attempts, cfg.base_delay_ms, cfg.max_delay_ms)
        } else {
            ReconnectPolicy::disabled()
        }
    }
}

/// One monitored vital sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub topic: String,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Dashboard label; the topic when unset.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_capacity() -> usize {
    DEFAULT_WINDOW_CAPACITY
}

impl ChannelConfig {
    pub fn new(topic: &str, label: &str) -> Self {
        Self {
            topic: topic.to_string(),
            capacity: default_capacity(),
            label: Some(label.to_string()),
        }
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.topic)
    }
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::new("sensores/ecg", "ECG"),
        ChannelConfig::new("sensores/oxigeno", "SpO2"),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            reconnect: ReconnectConfig::default(),
            channels: default_channels(),
            dashboard: DashboardConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `path` (missing file allowed) layered under `VITALS__*` env vars.
    pub fn load(path: &str) -> AppResult<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Self>()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text directly, without the environment layer.
    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.channels.is_empty() {
            return Err(AppError::Config("At least one channel is required".to_string()));
        }
        for channel in &self.channels {
            if channel.topic.is_empty() {
                return Err(AppError::Config("Channel topic must not be empty".to_string()));
            }
            if channel.capacity == 0 {
                return Err(AppError::Config(format!(
                    "Channel {} capacity must be at least 1",
                    channel.topic
                )));
            }
        }
        if self.broker.inbound_capacity == 0 {
            return Err(AppError::Config(
                "broker.inbound_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::from(&self.broker)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from(&self.reconnect)
    }
}
