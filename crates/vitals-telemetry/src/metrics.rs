//! Prometheus metrics for vitals-link.
//!
//! Covers:
//! - Broker connection state and reconnects
//! - Dispatch throughput, decode and listener failures
//! - Subscribed topics and window fill
//! - Dashboard clients
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a programming error that should crash at
//! startup. These panics only occur during static initialization.

use crate::error::TelemetryResult;
use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder, Gauge,
    GaugeVec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

/// Broker connection state (1 = connected, 0 = otherwise).
pub static BROKER_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "vitals_broker_connected",
        "Broker connection state (1=connected)"
    )
    .unwrap()
});

/// Labels: state (disconnected/connecting/connected/reconnecting/failed)
pub static BROKER_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "vitals_broker_state",
        "Broker connection state machine (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

pub static BROKER_RECONNECT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "vitals_broker_reconnect_total",
        "Successful broker reconnections"
    )
    .unwrap()
});

pub static SAMPLES_DISPATCHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vitals_samples_dispatched_total",
        "Decoded samples dispatched to listeners",
        &["topic"]
    )
    .unwrap()
});

pub static DECODE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vitals_decode_errors_total",
        "Inbound payloads dropped as undecodable",
        &["topic"]
    )
    .unwrap()
});

/// Labels: topic, kind (failed/panicked)
pub static LISTENER_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vitals_listener_errors_total",
        "Listener callbacks that failed during dispatch",
        &["topic", "kind"]
    )
    .unwrap()
});

/// Receive-to-dispatch latency in milliseconds.
pub static DISPATCH_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "vitals_dispatch_latency_ms",
        "Time from socket receive to dispatch completion in milliseconds",
        &["topic"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 500.0]
    )
    .unwrap()
});

pub static ACTIVE_TOPICS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "vitals_active_topics",
        "Topics with at least one registered listener"
    )
    .unwrap()
});

/// Labels: topic, window (process-unique window id)
pub static WINDOW_LEN: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "vitals_window_len",
        "Samples currently held per stream window",
        &["topic", "window"]
    )
    .unwrap()
});

pub static DASHBOARD_CLIENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "vitals_dashboard_clients",
        "Connected dashboard WebSocket clients"
    )
    .unwrap()
});

const STATES: [&str; 5] = [
    "disconnected",
    "connecting",
    "connected",
    "reconnecting",
    "failed",
];

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Only the active state is set to 1.
    pub fn broker_state_set(state: &str) {
        for s in STATES {
            BROKER_STATE.with_label_values(&[s]).set(0.0);
        }
        BROKER_STATE.with_label_values(&[state]).set(1.0);
        BROKER_CONNECTED.set(if state == "connected" { 1.0 } else { 0.0 });
    }

    pub fn broker_reconnected(count: u64) {
        BROKER_RECONNECT_TOTAL.inc_by(count);
    }

    pub fn sample_dispatched(topic: &str, latency_ms: f64) {
        SAMPLES_DISPATCHED_TOTAL.with_label_values(&[topic]).inc();
        DISPATCH_LATENCY_MS
            .with_label_values(&[topic])
            .observe(latency_ms);
    }

    pub fn decode_error(topic: &str) {
        DECODE_ERRORS_TOTAL.with_label_values(&[topic]).inc();
    }

    pub fn listener_error(topic: &str, kind: &str) {
        LISTENER_ERRORS_TOTAL
            .with_label_values(&[topic, kind])
            .inc();
    }

    pub fn active_topics_set(count: usize) {
        ACTIVE_TOPICS.set(count as i64);
    }

    pub fn window_len(topic: &str, window: u64, len: usize) {
        WINDOW_LEN
            .with_label_values(&[topic, &window.to_string()])
            .set(len as i64);
    }

    /// Drop the series of a window that no longer exists.
    pub fn window_removed(topic: &str, window: u64) {
        let _ = WINDOW_LEN.remove_label_values(&[topic, &window.to_string()]);
    }

    pub fn dashboard_client_connected() {
        DASHBOARD_CLIENTS.inc();
    }

    pub fn dashboard_client_disconnected() {
        DASHBOARD_CLIENTS.dec();
    }

    /// Prometheus text exposition of the default registry.
    pub fn gather_text() -> TelemetryResult<String> {
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::error::TelemetryError::Metrics(e.to_string()))
    }
}
