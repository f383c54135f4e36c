//! Integration tests for vitals-monitor.
//!
//! These tests drive the real broker connection, registry, dispatcher and
//! stream windows against an in-process MQTT-over-WebSocket broker.

pub mod common;
