//! vitals-dashboard - Live vital-sign dashboard for vitals-monitor.
//!
//! Serves the broker connection indicator and the contents of every
//! monitored stream window:
//!
//! - REST API for the current status and per-topic window snapshots
//! - WebSocket for periodic updates and connection state changes
//! - Prometheus metrics
//! - Static HTML dashboard UI
//!
//! # Routes
//!
//! ```text
//! GET /                       → Static HTML/JS
//! GET /api/status             → connection indicator + window fill levels
//! GET /api/windows/{*topic}   → samples of one window (404 if unknown)
//! GET /metrics                → Prometheus text format
//! GET /ws                     → WebSocket upgrade
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use vitals_dashboard::{run_server, DashboardConfig, DashboardState};
//!
//! let dashboard = DashboardState::new(connection.state_watch());
//! dashboard.add_channel("ECG", ecg_window.reader());
//!
//! tokio::spawn(async move {
//!     if let Err(e) = run_server(dashboard, DashboardConfig::default(), shutdown).await {
//!         tracing::error!(error = %e, "Dashboard server failed");
//!     }
//! });
//! ```

mod broadcast;
mod config;
mod error;
mod server;
mod state;
mod types;

pub use config::DashboardConfig;
pub use error::{DashboardError, DashboardResult};
pub use server::{create_router, run_server, AppState};
pub use state::DashboardState;
pub use types::{
    ChannelStatus, ConnectionIndicator, DashboardMessage, DashboardSnapshot, StatusSnapshot,
    WindowSnapshot,
};
