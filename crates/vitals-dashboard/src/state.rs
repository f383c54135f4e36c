//! Dashboard state management.
//!
//! DashboardState aggregates the connection indicator and the monitored
//! windows. Cloning is cheap; every clone sees the same channels.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use vitals_broker::ConnectionState;
use vitals_feed::WindowReader;

use crate::types::{
    ChannelStatus, ConnectionIndicator, DashboardSnapshot, StatusSnapshot, WindowSnapshot,
};

#[derive(Clone)]
struct Channel {
    label: String,
    reader: WindowReader,
}

impl Channel {
    fn status(&self) -> ChannelStatus {
        let latest = self.reader.latest();
        ChannelStatus {
            topic: self.reader.topic().to_string(),
            label: self.label.clone(),
            len: self.reader.len(),
            capacity: self.reader.capacity(),
            latest_value: latest.as_ref().and_then(|s| s.as_f64()),
            last_received_at: latest.map(|s| s.received_at),
        }
    }

    fn window(&self) -> WindowSnapshot {
        WindowSnapshot {
            topic: self.reader.topic().to_string(),
            label: self.label.clone(),
            capacity: self.reader.capacity(),
            samples: self.reader.snapshot(),
        }
    }
}

#[derive(Clone)]
pub struct DashboardState {
    connection: watch::Receiver<ConnectionState>,
    channels: Arc<RwLock<Vec<Channel>>>,
}

impl DashboardState {
    pub fn new(connection: watch::Receiver<ConnectionState>) -> Self {
        Self {
            connection,
            channels: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Show a window on the dashboard. A second window on the same topic
    /// replaces the first.
    pub fn add_channel(&self, label: impl Into<String>, reader: WindowReader) {
        let channel = Channel {
            label: label.into(),
            reader,
        };
        let mut channels = self.channels.write();
        match channels
            .iter_mut()
            .find(|c| c.reader.topic() == channel.reader.topic())
        {
            Some(existing) => *existing = channel,
            None => channels.push(channel),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn collect_status(&self) -> StatusSnapshot {
        StatusSnapshot {
            timestamp_ms: Utc::now().timestamp_millis(),
            connection: ConnectionIndicator::from(self.connection_state()),
            channels: self.channels.read().iter().map(Channel::status).collect(),
        }
    }

    pub fn collect_windows(&self) -> Vec<WindowSnapshot> {
        self.channels.read().iter().map(Channel::window).collect()
    }

    /// Collect a full snapshot of the current state.
    pub fn collect_snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            status: self.collect_status(),
            windows: self.collect_windows(),
        }
    }

    pub fn window(&self, topic: &str) -> Option<WindowSnapshot> {
        self.channels
            .read()
            .iter()
            .find(|c| c.reader.topic() == topic)
            .map(Channel::window)
    }
}

impl std::fmt::Debug for DashboardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardState")
            .field("connection", &self.connection_state())
            .field("channel_count", &self.channel_count())
            .finish()
    }
}
