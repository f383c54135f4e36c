//! Live telemetry fan-out for vitals-link.
//!
//! - [`TopicSubscriptionRegistry`]: many listeners per topic, one broker
//!   subscription per topic
//! - [`Dispatcher`]: decodes inbound payloads and isolates listener failures
//! - [`StreamWindow`]: bounded recent history per monitored topic

pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod sample;
pub mod window;

#[cfg(test)]
mod testing;

pub use dispatcher::{DispatchFault, DispatchReport, DispatchStats, Dispatcher};
pub use error::{DecodeError, FeedError, FeedResult, ListenerError};
pub use registry::{Listener, ListenerHandle, TopicSubscriptionRegistry};
pub use sample::Sample;
pub use window::{StreamWindow, WindowBuffer, WindowReader, DEFAULT_WINDOW_CAPACITY};
