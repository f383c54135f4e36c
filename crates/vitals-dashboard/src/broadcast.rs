//! WebSocket broadcast functionality.
//!
//! The broadcaster collects state at a fixed interval and publishes it to all
//! connected WebSocket clients. Connection state transitions are announced
//! separately so the indicator can flip without waiting for a redraw.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::state::DashboardState;
use crate::types::DashboardMessage;

/// Run the broadcaster task until `shutdown` fires.
pub async fn run_broadcaster(
    state: DashboardState,
    tx: broadcast::Sender<String>,
    interval_ms: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut last_state = state.connection_state();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Dashboard broadcaster stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        let current = state.connection_state();
        if current != last_state {
            publish(
                &tx,
                &DashboardMessage::ConnectionChanged {
                    timestamp_ms: Utc::now().timestamp_millis(),
                    connection: current.into(),
                },
            );
            last_state = current;
        }

        let snapshot = state.collect_snapshot();
        publish(
            &tx,
            &DashboardMessage::Update {
                status: snapshot.status,
                windows: snapshot.windows,
            },
        );
    }
}

fn publish(tx: &broadcast::Sender<String>, msg: &DashboardMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => match tx.send(json) {
            Ok(n) => trace!(receivers = n, "Broadcast update sent"),
            // No receivers - normal when no clients are connected
            Err(_) => trace!("No WebSocket receivers connected"),
        },
        Err(e) => debug!(error = %e, "Failed to serialize dashboard update"),
    }
}
