//! In-memory broker link for unit tests.

use crate::error::ListenerError;
use crate::sample::Sample;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use vitals_broker::{
    AckState, BrokerLink, ConnectionError, ConnectionResult, ConnectionState, QoS,
    SessionObserver, SubscribeAck,
};

pub fn ok_listener() -> impl Fn(&Sample) -> Result<(), ListenerError> + Send + Sync + 'static {
    |_: &Sample| Ok(())
}

/// Tracks broker-level subscriptions the way the real connection does.
#[derive(Default)]
pub struct FakeLink {
    connected: AtomicBool,
    auto_grant: AtomicBool,
    broker: Mutex<BTreeSet<String>>,
    acks: Mutex<HashMap<String, watch::Sender<AckState>>>,
    log: Mutex<Vec<(bool, String)>>,
    observers: Mutex<Vec<Weak<dyn SessionObserver>>>,
}

impl FakeLink {
    /// Connected; every subscribe is granted immediately.
    pub fn connected() -> Arc<Self> {
        let link = Self::default();
        link.connected.store(true, Ordering::SeqCst);
        link.auto_grant.store(true, Ordering::SeqCst);
        Arc::new(link)
    }

    /// Connected; acknowledgements resolve through `grant`/`reject`.
    pub fn manual_ack() -> Arc<Self> {
        let link = Self::default();
        link.connected.store(true, Ordering::SeqCst);
        Arc::new(link)
    }

    pub fn disconnected() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn grant_on_request(&self, grant: bool) {
        self.auto_grant.store(grant, Ordering::SeqCst);
    }

    pub fn grant(&self, topic: &str) {
        if let Some(tx) = self.acks.lock().get(topic) {
            tx.send_replace(AckState::Granted(QoS::AtMostOnce));
        }
    }

    pub fn reject(&self, topic: &str) {
        self.broker.lock().remove(topic);
        if let Some(tx) = self.acks.lock().remove(topic) {
            tx.send_replace(AckState::Rejected);
        }
    }

    /// Broker refused `topic` on a restore after reconnect.
    pub fn lose_topic(&self, topic: &str) {
        self.reject(topic);
        for observer in self.live_observers() {
            observer.on_topic_lost(topic);
        }
    }

    /// Transport lost for good: pending acks cancelled, observers notified.
    pub fn close_session(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.broker.lock().clear();
        for (_, tx) in self.acks.lock().drain() {
            tx.send_if_modified(|state| {
                let pending = *state == AckState::Pending;
                if pending {
                    *state = AckState::Cancelled;
                }
                pending
            });
        }
        for observer in self.live_observers() {
            observer.on_session_closed();
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn broker_topics(&self) -> Vec<String> {
        self.broker.lock().iter().cloned().collect()
    }

    pub fn subscribe_requests(&self, topic: &str) -> usize {
        self.count(true, topic)
    }

    pub fn unsubscribe_requests(&self, topic: &str) -> usize {
        self.count(false, topic)
    }

    fn count(&self, subscribe: bool, topic: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(s, t)| *s == subscribe && t == topic)
            .count()
    }
}

impl BrokerLink for FakeLink {
    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn request_subscribe(&self, topic: &str) -> ConnectionResult<SubscribeAck> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        self.log.lock().push((true, topic.to_string()));
        self.broker.lock().insert(topic.to_string());

        let (tx, ack) = SubscribeAck::channel(topic);
        if self.auto_grant.load(Ordering::SeqCst) {
            tx.send_replace(AckState::Granted(QoS::AtMostOnce));
        }
        self.acks.lock().insert(topic.to_string(), tx);
        Ok(ack)
    }

    fn request_unsubscribe(&self, topic: &str) {
        self.log.lock().push((false, topic.to_string()));
        self.broker.lock().remove(topic);
        if let Some(tx) = self.acks.lock().remove(topic) {
            tx.send_replace(AckState::Cancelled);
        }
    }

    fn observe_session(&self, observer: Weak<dyn SessionObserver>) {
        self.observers.lock().push(observer);
    }
}
