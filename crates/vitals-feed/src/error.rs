//! Feed error types.

use thiserror::Error;
use vitals_broker::ConnectionError;

/// Inbound payload that could not be turned into a sample.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Payload on {topic} is not UTF-8: {reason}")]
    InvalidUtf8 { topic: String, reason: String },

    #[error("Payload on {topic} is not JSON: {reason}")]
    InvalidJson { topic: String, reason: String },
}

impl DecodeError {
    pub fn topic(&self) -> &str {
        match self {
            Self::InvalidUtf8 { topic, .. } | Self::InvalidJson { topic, .. } => topic,
        }
    }
}

/// A listener callback that failed during dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    #[error("Listener failed: {0}")]
    Failed(String),

    #[error("Listener panicked: {0}")]
    Panicked(String),
}

impl ListenerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("Window capacity must be at least 1")]
    InvalidCapacity,

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

pub type FeedResult<T> = Result<T, FeedError>;
