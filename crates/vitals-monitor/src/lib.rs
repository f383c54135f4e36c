//! Vitals monitor.
//!
//! Main application that orchestrates all components:
//! - MQTT-over-WebSocket connection to the telemetry broker
//! - Topic registry and dispatcher
//! - One bounded stream window per monitored vital sign
//! - Live dashboard

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::{AppConfig, BrokerConfig, ChannelConfig, ReconnectConfig};
pub use error::{AppError, AppResult};
