//! Dashboard API types.
//!
//! These types are used for JSON serialization in REST and WebSocket APIs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use vitals_broker::ConnectionState;
use vitals_feed::Sample;

/// Connected/disconnected indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionIndicator {
    /// Full lifecycle state ("connected", "reconnecting", ...).
    pub state: String,
    pub connected: bool,
}

impl From<ConnectionState> for ConnectionIndicator {
    fn from(state: ConnectionState) -> Self {
        Self {
            state: state.as_str().to_string(),
            connected: state.is_connected(),
        }
    }
}

/// Fill level and latest reading of one monitored channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub topic: String,
    pub label: String,
    pub len: usize,
    pub capacity: usize,
    /// Numeric reading of the newest sample, if it has one.
    pub latest_value: Option<f64>,
    pub last_received_at: Option<DateTime<Utc>>,
}

/// Connection indicator plus every channel's status.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Timestamp when snapshot was taken (Unix milliseconds).
    pub timestamp_ms: i64,
    pub connection: ConnectionIndicator,
    pub channels: Vec<ChannelStatus>,
}

/// Contents of one window, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub topic: String,
    pub label: String,
    pub capacity: usize,
    pub samples: Vec<Sample>,
}

/// Full dashboard state (sent on initial connection).
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub status: StatusSnapshot,
    pub windows: Vec<WindowSnapshot>,
}

/// WebSocket message types.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    /// Full snapshot (sent on connect).
    Snapshot(DashboardSnapshot),
    /// Periodic refresh.
    Update {
        status: StatusSnapshot,
        windows: Vec<WindowSnapshot>,
    },
    /// Connection state transition since the previous tick.
    ConnectionChanged {
        timestamp_ms: i64,
        connection: ConnectionIndicator,
    },
}
