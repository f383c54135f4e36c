//! MQTT-over-WebSocket client for the vital-sign telemetry broker.
//!
//! Provides:
//! - Explicit connect/disconnect lifecycle with a watchable connection state
//! - Broker-level subscriptions acknowledged by SUBACK
//! - Optional reconnect policy with subscription restoration
//! - Ordered, bounded delivery of inbound PUBLISH payloads
//!
//! MQTT framing, keep-alive and PUBACK handling come from `rumqttc`.

pub mod connection;
pub mod error;
pub mod link;
pub mod topics;

pub use connection::{
    generate_client_id, BrokerConnection, ConnectOptions, ConnectionState, InboundMessage,
    ReconnectPolicy, DEFAULT_ENDPOINT,
};
pub use error::{ConnectionError, ConnectionResult};
pub use link::{BrokerLink, SessionObserver};
pub use rumqttc::QoS;
pub use topics::{AckState, BrokerTopicInfo, SubscribeAck};
