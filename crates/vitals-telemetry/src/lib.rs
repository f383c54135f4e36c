//! Prometheus metrics and structured logging for vitals-link.
//!
//! - Prometheus metrics for the broker session, dispatch and windows
//! - Structured logging with tracing (JSON or pretty)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::Metrics;
