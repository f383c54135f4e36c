//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(#[from] vitals_broker::ConnectionError),

    #[error("Feed error: {0}")]
    Feed(#[from] vitals_feed::FeedError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] vitals_telemetry::TelemetryError),

    #[error("Dashboard error: {0}")]
    Dashboard(#[from] vitals_dashboard::DashboardError),

    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
