//! Seam between the broker connection and the subscriber registry.

use crate::connection::ConnectionState;
use crate::error::ConnectionResult;
use crate::topics::SubscribeAck;
use std::sync::Weak;

/// Notified about broker-side subscription loss.
pub trait SessionObserver: Send + Sync {
    /// The session ended for good (disconnect or failure).
    fn on_session_closed(&self);

    /// The broker refused `topic` while re-subscribing after a reconnect;
    /// it no longer has a broker subscription.
    fn on_topic_lost(&self, topic: &str);
}

/// Broker operations the subscriber registry relies on.
///
/// Requests must not block: the registry calls them while holding its lock.
pub trait BrokerLink: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Start a broker-level subscription. Fails with `NotConnected` unless
    /// the session is Connected; nothing is queued in that case.
    fn request_subscribe(&self, topic: &str) -> ConnectionResult<SubscribeAck>;

    /// Drop a broker-level subscription. No-op for untracked topics.
    fn request_unsubscribe(&self, topic: &str);

    fn observe_session(&self, observer: Weak<dyn SessionObserver>);
}
