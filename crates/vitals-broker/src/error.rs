//! Broker connection error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Subscription rejected by broker: {0}")]
    SubscriptionRejected(String),

    #[error("Connection closed: {0}")]
    Closed(String),
}

impl ConnectionError {
    /// Whether a later explicit `connect()` may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Closed(_) | Self::NotConnected)
    }

    /// Classify a failure while opening the transport or waiting for CONNACK.
    pub fn from_handshake(err: rumqttc::ConnectionError) -> Self {
        match err {
            rumqttc::ConnectionError::Io(e) => Self::Unreachable(e.to_string()),
            rumqttc::ConnectionError::NetworkTimeout => {
                Self::Unreachable("network timeout".to_string())
            }
            rumqttc::ConnectionError::ConnectionRefused(code) => {
                Self::Protocol(format!("connection refused: {code:?}"))
            }
            other => Self::Protocol(other.to_string()),
        }
    }

    /// Classify a failure of an established session.
    pub fn from_session(err: rumqttc::ConnectionError) -> Self {
        Self::Closed(err.to_string())
    }
}

impl From<rumqttc::ClientError> for ConnectionError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::Closed(format!("request not queued: {err}"))
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;
