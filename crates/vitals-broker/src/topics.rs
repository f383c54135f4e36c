//! Broker-level subscription table.
//!
//! Tracks which topics currently hold a broker subscription, which of those
//! the broker has acknowledged, and which SUBSCRIBE/UNSUBSCRIBE requests are
//! still in flight. The MQTT client assigns packet ids itself, so requests
//! wait in FIFO order until the client reports the id it sent them with.
//! Each tracked topic owns a `watch` channel that subscribers await for the
//! SUBACK outcome.

use crate::error::{ConnectionError, ConnectionResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::QoS;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Outcome of a broker-level subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Granted(QoS),
    Rejected,
    /// The session ended before the broker answered.
    Cancelled,
}

/// Awaitable acknowledgement of a broker-level subscription.
#[derive(Debug, Clone)]
pub struct SubscribeAck {
    topic: String,
    rx: watch::Receiver<AckState>,
}

impl SubscribeAck {
    /// A pending acknowledgement and the sender that resolves it.
    pub fn channel(topic: impl Into<String>) -> (watch::Sender<AckState>, Self) {
        let (tx, rx) = watch::channel(AckState::Pending);
        (
            tx,
            Self {
                topic: topic.into(),
                rx,
            },
        )
    }

    /// An acknowledgement that has already been granted.
    pub fn granted(topic: impl Into<String>) -> Self {
        let (tx, ack) = Self::channel(topic);
        tx.send_replace(AckState::Granted(QoS::AtMostOnce));
        ack
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> AckState {
        let state = *self.rx.borrow();
        if state == AckState::Pending && self.rx.has_changed().is_err() {
            return AckState::Cancelled;
        }
        state
    }

    /// Rejected, cancelled, or abandoned by its sender.
    pub fn is_failed(&self) -> bool {
        matches!(self.state(), AckState::Rejected | AckState::Cancelled)
    }

    /// Wait for the broker's answer.
    pub async fn wait(mut self) -> ConnectionResult<QoS> {
        loop {
            let state = *self.rx.borrow_and_update();
            match state {
                AckState::Granted(qos) => return Ok(qos),
                AckState::Rejected => {
                    return Err(ConnectionError::SubscriptionRejected(self.topic))
                }
                AckState::Cancelled => return Err(ConnectionError::NotConnected),
                AckState::Pending => {}
            }

            if self.rx.changed().await.is_err() {
                // Sender gone: only a value written just before the drop counts.
                return match *self.rx.borrow() {
                    AckState::Granted(qos) => Ok(qos),
                    AckState::Rejected => Err(ConnectionError::SubscriptionRejected(self.topic)),
                    AckState::Pending | AckState::Cancelled => Err(ConnectionError::NotConnected),
                };
            }
        }
    }
}

#[derive(Debug)]
struct TopicEntry {
    /// Identifies the request that created this entry; SUBACKs for an older
    /// request on the same topic are ignored.
    seq: u64,
    ack: watch::Sender<AckState>,
    requested_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Subscribe { topic: String, seq: u64 },
    Unsubscribe { topic: String },
}

impl Request {
    fn topic(&self) -> &str {
        match self {
            Self::Subscribe { topic, .. } | Self::Unsubscribe { topic } => topic,
        }
    }
}

/// Kind of outgoing request the MQTT client reported a packet id for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Default)]
struct TopicTable {
    entries: HashMap<String, TopicEntry>,
    /// Handed to the client, packet id not assigned yet. Same order as the
    /// client's request queue.
    queued: VecDeque<Request>,
    /// Written to the transport, waiting for SUBACK/UNSUBACK.
    pending: HashMap<u16, Request>,
    /// Dropped while no session could carry the UNSUBSCRIBE.
    stale: BTreeSet<String>,
    next_seq: u64,
}

/// Per-topic view for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTopicInfo {
    pub topic: String,
    pub state: AckState,
    pub requested_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Result of starting a broker subscribe.
#[derive(Debug)]
pub struct SubscribeRequest {
    /// A SUBSCRIBE must be handed to the client; false if the topic was
    /// already tracked.
    pub send: bool,
    pub ack: SubscribeAck,
}

/// Requests to replay on a fresh transport, in this order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Restore {
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
}

/// SUBACK applied to a tracked topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckOutcome {
    pub topic: String,
    /// `None` when the broker refused the subscription.
    pub granted: Option<QoS>,
}

/// Broker-level subscription table shared by the connection and its session task.
#[derive(Debug, Default)]
pub struct BrokerTopics {
    table: Mutex<TopicTable>,
}

impl BrokerTopics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `topic`. Idempotent: a tracked topic returns its existing ack.
    pub fn begin_subscribe(&self, topic: &str) -> SubscribeRequest {
        let mut table = self.table.lock();

        if let Some(entry) = table.entries.get(topic) {
            return SubscribeRequest {
                send: false,
                ack: SubscribeAck {
                    topic: topic.to_string(),
                    rx: entry.ack.subscribe(),
                },
            };
        }

        table.next_seq += 1;
        let seq = table.next_seq;
        let (tx, ack) = SubscribeAck::channel(topic);
        table.entries.insert(
            topic.to_string(),
            TopicEntry {
                seq,
                ack: tx,
                requested_at: Utc::now(),
                confirmed_at: None,
            },
        );
        table.stale.remove(topic);
        table.queued.push_back(Request::Subscribe {
            topic: topic.to_string(),
            seq,
        });
        debug!(topic, "Broker subscription requested");

        SubscribeRequest { send: true, ack }
    }

    /// Undo a `begin_subscribe` whose SUBSCRIBE never reached the client.
    pub fn abort_subscribe(&self, topic: &str) {
        let mut table = self.table.lock();
        if matches!(table.queued.back(), Some(Request::Subscribe { topic: t, .. }) if t == topic) {
            table.queued.pop_back();
        }
        if let Some(entry) = table.entries.remove(topic) {
            entry.ack.send_replace(AckState::Cancelled);
        }
    }

    /// Stop tracking `topic`. Returns true when an UNSUBSCRIBE must be handed
    /// to the client now. With `connected == false` the topic is remembered
    /// and replayed by the next [`restore`](Self::restore).
    pub fn begin_unsubscribe(&self, topic: &str, connected: bool) -> bool {
        let mut table = self.table.lock();
        let Some(entry) = table.entries.remove(topic) else {
            return false;
        };
        entry.ack.send_replace(AckState::Cancelled);

        if !connected {
            table.stale.insert(topic.to_string());
            debug!(topic, "Broker unsubscription deferred until reconnect");
            return false;
        }

        table.queued.push_back(Request::Unsubscribe {
            topic: topic.to_string(),
        });
        debug!(topic, "Broker unsubscription requested");
        true
    }

    /// Undo a `begin_unsubscribe` whose UNSUBSCRIBE never reached the client.
    pub fn abort_unsubscribe(&self, topic: &str) {
        let mut table = self.table.lock();
        if matches!(table.queued.back(), Some(Request::Unsubscribe { topic: t }) if t == topic) {
            table.queued.pop_back();
        }
        table.stale.insert(topic.to_string());
    }

    /// The client wrote the oldest queued request with `packet_id`.
    pub fn on_outgoing(&self, kind: RequestKind, packet_id: u16) {
        let mut table = self.table.lock();
        let Some(request) = table.queued.pop_front() else {
            debug!(?kind, packet_id, "Outgoing request not tracked");
            return;
        };

        let matches = matches!(
            (&request, kind),
            (Request::Subscribe { .. }, RequestKind::Subscribe)
                | (Request::Unsubscribe { .. }, RequestKind::Unsubscribe)
        );
        if !matches {
            warn!(?kind, packet_id, topic = request.topic(), "Outgoing request out of order");
            return;
        }
        table.pending.insert(packet_id, request);
    }

    /// Apply a SUBACK. `None` when it belongs to no tracked request.
    pub fn on_suback(&self, packet_id: u16, granted: Option<QoS>) -> Option<SubAckOutcome> {
        let mut table = self.table.lock();

        let (topic, seq) = match table.pending.remove(&packet_id) {
            Some(Request::Subscribe { topic, seq }) => (topic, seq),
            Some(other) => {
                warn!(packet_id, topic = other.topic(), "SUBACK for a non-subscribe request");
                return None;
            }
            None => {
                debug!(packet_id, "SUBACK for unknown packet id");
                return None;
            }
        };

        if table.entries.get(&topic).map(|entry| entry.seq) != Some(seq) {
            debug!(%topic, packet_id, "SUBACK for a superseded request");
            return None;
        }

        match granted {
            Some(qos) => {
                if let Some(entry) = table.entries.get_mut(&topic) {
                    entry.confirmed_at = Some(Utc::now());
                    entry.ack.send_replace(AckState::Granted(qos));
                }
            }
            None => {
                if let Some(entry) = table.entries.remove(&topic) {
                    entry.ack.send_replace(AckState::Rejected);
                }
            }
        }

        Some(SubAckOutcome { topic, granted })
    }

    /// Apply an UNSUBACK. Returns the topic it confirmed.
    pub fn on_unsuback(&self, packet_id: u16) -> Option<String> {
        let mut table = self.table.lock();
        match table.pending.remove(&packet_id) {
            Some(Request::Unsubscribe { topic }) => Some(topic),
            Some(other) => {
                // Not ours; put it back.
                table.pending.insert(packet_id, other);
                None
            }
            None => None,
        }
    }

    /// Prepare a fresh transport: every tracked topic is subscribed again and
    /// every deferred unsubscription is sent. The caller must hand the
    /// returned requests to the new client in order, under the same lock
    /// that guards request submission.
    pub fn restore(&self) -> Restore {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        table.queued.clear();
        table.pending.clear();

        let mut subscribe: Vec<(String, u64)> = table
            .entries
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.seq))
            .collect();
        subscribe.sort();

        let unsubscribe: Vec<String> = std::mem::take(&mut table.stale)
            .into_iter()
            .filter(|topic| !table.entries.contains_key(topic))
            .collect();

        for (topic, seq) in &subscribe {
            table.queued.push_back(Request::Subscribe {
                topic: topic.clone(),
                seq: *seq,
            });
        }
        for topic in &unsubscribe {
            table.queued.push_back(Request::Unsubscribe {
                topic: topic.clone(),
            });
        }

        Restore {
            subscribe: subscribe.into_iter().map(|(topic, _)| topic).collect(),
            unsubscribe,
        }
    }

    /// Put unsubscriptions from an abandoned restore back for the next one.
    pub fn defer_unsubscribes(&self, topics: &[String]) {
        let mut table = self.table.lock();
        for topic in topics {
            if !table.entries.contains_key(topic) {
                table.stale.insert(topic.clone());
            }
        }
    }

    /// Fail every pending acknowledgement and forget all topics.
    pub fn cancel_all(&self) -> usize {
        let mut table = self.table.lock();
        let count = table.entries.len();
        for (_, entry) in table.entries.drain() {
            entry.ack.send_if_modified(|state| {
                if *state == AckState::Pending {
                    *state = AckState::Cancelled;
                    true
                } else {
                    false
                }
            });
        }
        table.queued.clear();
        table.pending.clear();
        table.stale.clear();
        count
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.table.lock().entries.contains_key(topic)
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Tracked topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.table.lock().entries.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Topics the broker has acknowledged, sorted.
    pub fn confirmed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .table
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| matches!(*entry.ack.borrow(), AckState::Granted(_)))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn info(&self) -> Vec<BrokerTopicInfo> {
        let mut info: Vec<BrokerTopicInfo> = self
            .table
            .lock()
            .entries
            .iter()
            .map(|(topic, entry)| BrokerTopicInfo {
                topic: topic.clone(),
                state: *entry.ack.borrow(),
                requested_at: entry.requested_at,
                confirmed_at: entry.confirmed_at,
            })
            .collect();
        info.sort_by(|a, b| a.topic.cmp(&b.topic));
        info
    }

    /// Requests still waiting for their packet id or ACK.
    pub fn pending_count(&self) -> usize {
        let table = self.table.lock();
        table.queued.len() + table.pending.len()
    }

    /// Unsubscriptions waiting for the next transport.
    pub fn deferred_topics(&self) -> Vec<String> {
        self.table.lock().stale.iter().cloned().collect()
    }
}
