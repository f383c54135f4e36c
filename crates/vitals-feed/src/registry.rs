//! Topic subscription registry.
//!
//! Multiplexes any number of listener callbacks onto one broker-level
//! subscription per topic. A topic holds a broker subscription exactly when
//! its listener set is non-empty: every map mutation and the broker request
//! it implies happen under the same lock.

use crate::error::ListenerError;
use crate::sample::Sample;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use vitals_broker::{BrokerLink, ConnectionError, SessionObserver, SubscribeAck};
use vitals_telemetry::Metrics;

/// Listener callback. Runs on the dispatcher task, outside the registry lock.
pub type Listener = Arc<dyn Fn(&Sample) -> Result<(), ListenerError> + Send + Sync>;

/// Token for one registered listener. Equality is identity: two handles are
/// equal only if they came from the same `subscribe` call.
#[derive(Clone)]
pub struct ListenerHandle {
    id: u64,
    topic: Arc<str>,
}

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ListenerHandle {}

impl Hash for ListenerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerHandle(#{} {})", self.id, self.topic)
    }
}

struct TopicListeners {
    listeners: HashMap<u64, Listener>,
    ack: SubscribeAck,
}

/// Topic → listener-set map backed by broker-level subscriptions.
pub struct TopicSubscriptionRegistry {
    link: Arc<dyn BrokerLink>,
    topics: Mutex<HashMap<String, TopicListeners>>,
    next_id: AtomicU64,
}

impl TopicSubscriptionRegistry {
    /// The registry observes the link's session and clears itself when the
    /// session ends.
    pub fn new(link: Arc<dyn BrokerLink>) -> Arc<Self> {
        let registry = Arc::new(Self {
            link,
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        let observer: Weak<Self> = Arc::downgrade(&registry);
        registry.link.observe_session(observer);
        registry
    }

    /// Register `callback` for `topic`.
    ///
    /// The first listener on a topic requests the broker subscription and
    /// waits for its SUBACK; later listeners share that acknowledgement.
    /// Fails with `NotConnected` (nothing queued) unless the broker session
    /// is Connected, and with `SubscriptionRejected` if the broker refuses.
    /// On failure the listener is not left registered.
    pub async fn subscribe<F>(
        &self,
        topic: &str,
        callback: F,
    ) -> Result<ListenerHandle, ConnectionError>
    where
        F: Fn(&Sample) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(callback);

        let (handle, ack) = {
            let mut topics = self.topics.lock();
            let handle = ListenerHandle {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                topic: Arc::from(topic),
            };

            let ack = match topics.get(topic) {
                Some(entry) if !entry.ack.is_failed() => entry.ack.clone(),
                // First listener, or the previous request failed and its
                // waiters are leaving.
                _ => self.link.request_subscribe(topic)?,
            };

            let entry = topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicListeners {
                    listeners: HashMap::new(),
                    ack: ack.clone(),
                });
            entry.ack = ack.clone();
            entry.listeners.insert(handle.id, listener);
            Metrics::active_topics_set(topics.len());

            (handle, ack)
        };
        debug!(topic, listener = handle.id, "Listener registered");

        let pending = PendingListener {
            registry: self,
            handle: Some(handle.clone()),
        };
        ack.wait().await?;
        pending.disarm();
        Ok(handle)
    }

    /// Revoke a listener. Returns `false` for unknown or already revoked
    /// handles. Removing the last listener of a topic drops the broker
    /// subscription. Never blocks on I/O.
    pub fn unsubscribe(&self, handle: &ListenerHandle) -> bool {
        let mut topics = self.topics.lock();
        let Some(entry) = topics.get_mut(handle.topic()) else {
            return false;
        };
        if entry.listeners.remove(&handle.id).is_none() {
            return false;
        }

        if entry.listeners.is_empty() {
            topics.remove(handle.topic());
            self.link.request_unsubscribe(handle.topic());
            Metrics::active_topics_set(topics.len());
            debug!(topic = handle.topic(), "Last listener removed");
        }
        true
    }

    /// Point-in-time copy of the listeners on `topic`.
    pub fn listeners_for(&self, topic: &str) -> Vec<(ListenerHandle, Listener)> {
        let topics = self.topics.lock();
        let Some(entry) = topics.get(topic) else {
            return Vec::new();
        };
        let topic: Arc<str> = Arc::from(topic);
        entry
            .listeners
            .iter()
            .map(|(id, listener)| {
                (
                    ListenerHandle {
                        id: *id,
                        topic: Arc::clone(&topic),
                    },
                    Arc::clone(listener),
                )
            })
            .collect()
    }

    /// Topics with at least one listener, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.lock().contains_key(topic)
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |entry| entry.listeners.len())
    }

    pub fn contains(&self, handle: &ListenerHandle) -> bool {
        self.topics
            .lock()
            .get(handle.topic())
            .is_some_and(|entry| entry.listeners.contains_key(&handle.id))
    }

    pub fn is_empty(&self) -> bool {
        self.topics.lock().is_empty()
    }
}

impl SessionObserver for TopicSubscriptionRegistry {
    /// The transport is gone, so no broker UNSUBSCRIBE is sent.
    fn on_session_closed(&self) {
        let cleared = {
            let mut topics = self.topics.lock();
            let cleared = topics.len();
            topics.clear();
            cleared
        };
        Metrics::active_topics_set(0);
        if cleared > 0 {
            info!(topics = cleared, "Session closed, subscriptions cleared");
        }
    }

    /// Drop every listener of a topic whose broker subscription is gone.
    /// An entry re-requested since then (live ack) is left alone.
    fn on_topic_lost(&self, topic: &str) {
        let dropped = {
            let mut topics = self.topics.lock();
            match topics.get(topic) {
                Some(entry) if entry.ack.is_failed() => {
                    let dropped = topics.remove(topic).map_or(0, |e| e.listeners.len());
                    Metrics::active_topics_set(topics.len());
                    dropped
                }
                _ => 0,
            }
        };
        if dropped > 0 {
            warn!(topic, listeners = dropped, "Broker subscription lost, listeners detached");
        }
    }
}

/// Revokes a listener whose subscribe did not complete, including when the
/// subscribe future is dropped mid-wait.
struct PendingListener<'a> {
    registry: &'a TopicSubscriptionRegistry,
    handle: Option<ListenerHandle>,
}

impl PendingListener<'_> {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for PendingListener<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry.unsubscribe(&handle);
        }
    }
}
