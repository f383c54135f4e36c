//! Broker connection manager.
//!
//! Owns the single MQTT-over-WebSocket session for one monitoring session:
//! connection lifecycle, the session task that polls the MQTT event loop,
//! and the optional reconnect policy with subscription restoration. Each
//! transport gets its own `rumqttc` client and event loop; the client's
//! built-in retry is never used, reconnects go through [`ReconnectPolicy`].

use crate::error::{ConnectionError, ConnectionResult};
use crate::link::{BrokerLink, SessionObserver};
use crate::topics::{BrokerTopicInfo, BrokerTopics, RequestKind, Restore, SubAckOutcome, SubscribeAck};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    Transport,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Default broker endpoint (EMQX-style WebSocket listener).
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8083/mqtt";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_JITTER_MS: u64 = 250;
/// Outstanding requests per client; restore submits one per tracked topic.
const REQUEST_CAPACITY: usize = 256;
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Only entered when the reconnect policy is enabled; with the default
    /// policy a transport loss goes straight to `Failed`.
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == Self::Connected
    }

    /// An attempt is in flight; `connect()` joins it instead of starting another.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnection policy applied after an unexpected transport loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Maximum attempts per outage (0 = unlimited).
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn exponential(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            enabled: true,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`. Jitter is added by the caller.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }
}

/// Per-connect options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    /// Zero disables keep-alive.
    pub keep_alive_secs: u16,
    pub connect_timeout_ms: u64,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: generate_client_id(),
            keep_alive_secs: 60,
            connect_timeout_ms: 10_000,
            clean_session: true,
            username: None,
            password: None,
        }
    }
}

/// `vitals-` plus 12 hex chars; stays within the 23-byte MQTT 3.1.1 limit.
pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("vitals-{}", &id[..12])
}

/// Raw message received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct SessionSlot {
    /// Bumped by every connect and disconnect; stale tasks compare against it.
    generation: u64,
    cancel: Option<CancellationToken>,
    /// Request handle of the live transport; set only while Connected.
    client: Option<AsyncClient>,
}

enum Activation {
    Ready(Restore),
    Superseded,
    Failed(ConnectionError),
}

struct Shared {
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    last_error: RwLock<Option<ConnectionError>>,
    topics: BrokerTopics,
    inbound_tx: mpsc::Sender<InboundMessage>,
    session: Mutex<SessionSlot>,
    observers: Mutex<Vec<Weak<dyn SessionObserver>>>,
    reconnects: AtomicU64,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Caller holds the session lock.
    fn set_state_locked(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Mark `generation` Connected on `client`. Every tracked topic is
    /// re-subscribed and every deferred unsubscription is submitted before
    /// the state flips, all under the session lock, so no subscribe or
    /// unsubscribe can slip in between.
    fn activate(&self, generation: u64, client: &AsyncClient) -> Activation {
        let mut slot = self.session.lock();
        let cancelled = slot.cancel.as_ref().map_or(true, |c| c.is_cancelled());
        if slot.generation != generation || cancelled {
            return Activation::Superseded;
        }

        let restore = self.topics.restore();
        let submitted = restore
            .subscribe
            .iter()
            .try_for_each(|topic| client.try_subscribe(topic.as_str(), QoS::AtMostOnce))
            .and_then(|()| {
                restore
                    .unsubscribe
                    .iter()
                    .try_for_each(|topic| client.try_unsubscribe(topic.as_str()))
            });
        if let Err(e) = submitted {
            self.topics.defer_unsubscribes(&restore.unsubscribe);
            return Activation::Failed(e.into());
        }

        slot.client = Some(client.clone());
        *self.last_error.write() = None;
        self.set_state_locked(ConnectionState::Connected);
        Activation::Ready(restore)
    }

    fn enter_reconnecting(&self, generation: u64) -> bool {
        let mut slot = self.session.lock();
        if slot.generation != generation {
            return false;
        }
        slot.client = None;
        self.set_state_locked(ConnectionState::Reconnecting);
        true
    }

    /// Terminal failure of `generation`: Failed, pending subscribes cancelled,
    /// observers told to drop their subscriptions.
    fn fail(&self, generation: u64, err: ConnectionError) {
        {
            let mut slot = self.session.lock();
            if slot.generation != generation {
                return;
            }
            slot.cancel = None;
            slot.client = None;
            *self.last_error.write() = Some(err.clone());
            self.set_state_locked(ConnectionState::Failed);
            self.topics.cancel_all();
        }
        error!(error = %err, "Broker session failed");
        self.notify_closed();
    }

    /// Apply `f` to the topic table only while `generation` is current.
    fn route<T>(&self, generation: u64, f: impl FnOnce(&BrokerTopics) -> T) -> Option<T> {
        let slot = self.session.lock();
        (slot.generation == generation).then(|| f(&self.topics))
    }

    fn live_observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        let mut observers = self.observers.lock();
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    fn notify_closed(&self) {
        for observer in self.live_observers() {
            observer.on_session_closed();
        }
    }

    fn notify_topic_lost(&self, topic: &str) {
        for observer in self.live_observers() {
            observer.on_topic_lost(topic);
        }
    }
}

/// Connection to the telemetry broker.
///
/// Explicitly constructed and owned; share it behind an `Arc`.
pub struct BrokerConnection {
    shared: Arc<Shared>,
}

impl BrokerConnection {
    /// Inbound PUBLISH payloads are delivered on `inbound_tx` in arrival order.
    pub fn new(policy: ReconnectPolicy, inbound_tx: mpsc::Sender<InboundMessage>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                policy,
                state_tx,
                last_error: RwLock::new(None),
                topics: BrokerTopics::new(),
                inbound_tx,
                session: Mutex::new(SessionSlot::default()),
                observers: Mutex::new(Vec::new()),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.shared.last_error.read().clone()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }

    /// Successful reconnects since construction.
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    /// Broker-level subscriptions, acknowledged or not.
    pub fn broker_topics(&self) -> Vec<String> {
        self.shared.topics.topics()
    }

    pub fn confirmed_topics(&self) -> Vec<String> {
        self.shared.topics.confirmed_topics()
    }

    pub fn topic_info(&self) -> Vec<BrokerTopicInfo> {
        self.shared.topics.info()
    }

    /// Connect to `endpoint` and complete the MQTT handshake.
    ///
    /// While an attempt is in flight, further calls wait for its outcome
    /// instead of opening a second transport.
    pub async fn connect(&self, endpoint: &str, options: &ConnectOptions) -> ConnectionResult<()> {
        let start = {
            let mut slot = self.shared.session.lock();
            match self.shared.state() {
                ConnectionState::Connected => AttemptStart::Ready,
                ConnectionState::Connecting | ConnectionState::Reconnecting => AttemptStart::Join,
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    slot.generation += 1;
                    let cancel = CancellationToken::new();
                    slot.cancel = Some(cancel.clone());
                    slot.client = None;
                    self.shared.set_state_locked(ConnectionState::Connecting);
                    AttemptStart::Begin(slot.generation, cancel)
                }
            }
        };

        let (generation, cancel) = match start {
            AttemptStart::Ready => return Ok(()),
            AttemptStart::Join => {
                debug!("Connect joins in-flight attempt");
                return self.wait_for_attempt().await;
            }
            AttemptStart::Begin(generation, cancel) => (generation, cancel),
        };

        info!(endpoint, client_id = %options.client_id, "Connecting to broker");

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ConnectionError::NotConnected),
            result = establish(endpoint, options) => result,
        };

        match result {
            Ok((client, eventloop)) => match self.shared.activate(generation, &client) {
                Activation::Ready(_) => {
                    info!(endpoint, "Connected to broker");
                    let session = Session {
                        shared: Arc::clone(&self.shared),
                        generation,
                        cancel,
                        endpoint: endpoint.to_string(),
                        options: options.clone(),
                    };
                    tokio::spawn(session.run(client, eventloop));
                    Ok(())
                }
                Activation::Superseded => {
                    debug!("Connect superseded before session start");
                    Err(ConnectionError::NotConnected)
                }
                Activation::Failed(err) => Err(self.fail_attempt(generation, &cancel, endpoint, err)),
            },
            Err(err) => Err(self.fail_attempt(generation, &cancel, endpoint, err)),
        }
    }

    /// Record a failed first attempt; a superseded one reports `NotConnected`.
    fn fail_attempt(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        endpoint: &str,
        err: ConnectionError,
    ) -> ConnectionError {
        let current = {
            let mut slot = self.shared.session.lock();
            let current = slot.generation == generation && !cancel.is_cancelled();
            if current {
                slot.cancel = None;
                *self.shared.last_error.write() = Some(err.clone());
                self.shared.set_state_locked(ConnectionState::Failed);
            }
            current
        };
        if current {
            warn!(endpoint, error = %err, "Broker connect failed");
            err
        } else {
            ConnectionError::NotConnected
        }
    }

    async fn wait_for_attempt(&self) -> ConnectionResult<()> {
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(self.last_error().unwrap_or(ConnectionError::NotConnected))
                }
                ConnectionState::Disconnected => return Err(ConnectionError::NotConnected),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionError::NotConnected);
            }
        }
    }

    /// Tear down the session. Pending subscribes fail with `NotConnected`,
    /// broker-level subscriptions are forgotten (no UNSUBSCRIBE is issued for
    /// them) and session observers are told to clear their state. UNSUBSCRIBEs
    /// queued before the call are still flushed ahead of the MQTT DISCONNECT.
    pub fn disconnect(&self) {
        let previous = {
            let mut slot = self.shared.session.lock();
            slot.generation += 1;
            if let Some(cancel) = slot.cancel.take() {
                cancel.cancel();
            }
            slot.client = None;
            let previous = self.shared.state();
            self.shared.set_state_locked(ConnectionState::Disconnected);
            self.shared.topics.cancel_all();
            previous
        };
        info!(previous = %previous, "Disconnected from broker");
        self.shared.notify_closed();
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(cancel) = self.shared.session.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

impl BrokerLink for BrokerConnection {
    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn request_subscribe(&self, topic: &str) -> ConnectionResult<SubscribeAck> {
        if topic.is_empty() || topic.len() > usize::from(u16::MAX) {
            return Err(ConnectionError::Protocol(format!("invalid topic {topic:?}")));
        }

        let slot = self.shared.session.lock();
        let client = match (self.shared.state(), slot.client.as_ref()) {
            (ConnectionState::Connected, Some(client)) => client,
            _ => return Err(ConnectionError::NotConnected),
        };

        let request = self.shared.topics.begin_subscribe(topic);
        if request.send {
            if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
                self.shared.topics.abort_subscribe(topic);
                warn!(topic, error = %e, "Subscribe request not queued");
                return Err(e.into());
            }
        }
        Ok(request.ack)
    }

    fn request_unsubscribe(&self, topic: &str) {
        let slot = self.shared.session.lock();
        let client = match (self.shared.state(), slot.client.as_ref()) {
            (ConnectionState::Connected, Some(client)) => Some(client),
            _ => None,
        };

        if !self.shared.topics.begin_unsubscribe(topic, client.is_some()) {
            return;
        }
        if let Some(client) = client {
            if let Err(e) = client.try_unsubscribe(topic) {
                self.shared.topics.abort_unsubscribe(topic);
                debug!(topic, error = %e, "Unsubscribe deferred");
            }
        }
    }

    fn observe_session(&self, observer: Weak<dyn SessionObserver>) {
        self.shared.observers.lock().push(observer);
    }
}

/// Client settings for one transport to `endpoint`.
fn mqtt_options(endpoint: &str, options: &ConnectOptions) -> ConnectionResult<MqttOptions> {
    let url = Url::parse(endpoint)
        .map_err(|e| ConnectionError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    let transport = match url.scheme() {
        "ws" => Transport::Ws,
        "wss" => Transport::wss_with_default_config(),
        other => {
            return Err(ConnectionError::InvalidEndpoint(format!(
                "{endpoint}: unsupported scheme {other}"
            )))
        }
    };
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConnectionError::InvalidEndpoint(format!("{endpoint}: missing host")));
    }
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ConnectionError::InvalidEndpoint(format!("{endpoint}: missing port")))?;

    if options.client_id.is_empty() || options.client_id.starts_with(char::is_whitespace) {
        return Err(ConnectionError::Protocol(format!(
            "invalid client id {:?}",
            options.client_id
        )));
    }

    // The WebSocket transport dials the full URL; host/port only label it.
    let mut mqtt = MqttOptions::new(options.client_id.clone(), endpoint, port);
    mqtt.set_transport(transport)
        .set_keep_alive(Duration::from_secs(u64::from(options.keep_alive_secs)))
        .set_clean_session(options.clean_session)
        .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    if let Some(username) = &options.username {
        mqtt.set_credentials(username.clone(), options.password.clone().unwrap_or_default());
    }
    Ok(mqtt)
}

/// Open the WebSocket and complete CONNECT/CONNACK within the connect timeout.
async fn establish(
    endpoint: &str,
    options: &ConnectOptions,
) -> ConnectionResult<(AsyncClient, EventLoop)> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(endpoint, options)?, REQUEST_CAPACITY);
    let timeout = Duration::from_millis(options.connect_timeout_ms);

    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!(session_present = ack.session_present, "CONNACK accepted");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => return Err(ConnectionError::from_handshake(e)),
            }
        }
    };

    match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(())) => Ok((client, eventloop)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ConnectionError::Unreachable(format!(
            "no CONNACK within {} ms",
            options.connect_timeout_ms
        ))),
    }
}

/// Random jitter (0-250ms).
fn rand_jitter() -> Duration {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos) % (MAX_JITTER_MS + 1))
}

enum AttemptStart {
    Ready,
    Join,
    Begin(u64, CancellationToken),
}

enum SessionEnd {
    Cancelled,
    Lost(ConnectionError),
}

struct Session {
    shared: Arc<Shared>,
    generation: u64,
    cancel: CancellationToken,
    endpoint: String,
    options: ConnectOptions,
}

impl Session {
    async fn run(self, mut client: AsyncClient, mut eventloop: EventLoop) {
        loop {
            let loss = match self.drive(&mut eventloop).await {
                SessionEnd::Cancelled => {
                    close_session(&client, &mut eventloop).await;
                    debug!(generation = self.generation, "Session task stopped");
                    return;
                }
                SessionEnd::Lost(err) => err,
            };
            warn!(error = %loss, "Broker transport lost");

            match self.reconnect(loss).await {
                Some((next_client, next_eventloop)) => {
                    client = next_client;
                    eventloop = next_eventloop;
                }
                None => return,
            }
        }
    }

    async fn drive(&self, eventloop: &mut EventLoop) -> SessionEnd {
        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return SessionEnd::Cancelled,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(packet)) => {
                    if let Err(end) = self.on_incoming(packet).await {
                        return end;
                    }
                }
                Ok(Event::Outgoing(outgoing)) => self.on_outgoing(outgoing),
                Err(e) => return SessionEnd::Lost(ConnectionError::from_session(e)),
            }
        }
    }

    async fn on_incoming(&self, packet: Packet) -> Result<(), SessionEnd> {
        match packet {
            Packet::Publish(publish) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    received_at: Utc::now(),
                };
                // A full channel stops polling here; order is kept.
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Err(SessionEnd::Cancelled),
                    sent = self.shared.inbound_tx.send(message) => {
                        if sent.is_err() {
                            debug!("Inbound receiver dropped");
                        }
                    }
                }
            }
            Packet::SubAck(suback) => {
                let granted = match suback.return_codes.first() {
                    Some(SubscribeReasonCode::Success(qos)) => Some(*qos),
                    _ => None,
                };
                let outcome = self
                    .shared
                    .route(self.generation, |topics| topics.on_suback(suback.pkid, granted))
                    .flatten();
                match outcome {
                    Some(SubAckOutcome {
                        topic,
                        granted: Some(qos),
                    }) => info!(%topic, ?qos, "Subscription confirmed"),
                    Some(SubAckOutcome {
                        topic,
                        granted: None,
                    }) => {
                        warn!(%topic, "Subscription refused by broker");
                        self.shared.notify_topic_lost(&topic);
                    }
                    None => {}
                }
            }
            Packet::UnsubAck(unsuback) => {
                let topic = self
                    .shared
                    .route(self.generation, |topics| topics.on_unsuback(unsuback.pkid))
                    .flatten();
                if let Some(topic) = topic {
                    debug!(%topic, "Unsubscription confirmed");
                }
            }
            Packet::PingResp => debug!("PINGRESP"),
            other => debug!(packet = ?other, "Ignoring packet"),
        }
        Ok(())
    }

    fn on_outgoing(&self, outgoing: Outgoing) {
        let (kind, packet_id) = match outgoing {
            Outgoing::Subscribe(packet_id) => (RequestKind::Subscribe, packet_id),
            Outgoing::Unsubscribe(packet_id) => (RequestKind::Unsubscribe, packet_id),
            Outgoing::PingReq => {
                debug!("Sent PINGREQ");
                return;
            }
            _ => return,
        };
        self.shared
            .route(self.generation, |topics| topics.on_outgoing(kind, packet_id));
    }

    /// Apply the reconnect policy after a transport loss. Returns the new
    /// client once every tracked topic has been re-submitted, or `None` when
    /// the session is over.
    async fn reconnect(&self, loss: ConnectionError) -> Option<(AsyncClient, EventLoop)> {
        let policy = &self.shared.policy;
        if !policy.enabled {
            self.shared.fail(self.generation, loss);
            return None;
        }
        if !self.shared.enter_reconnecting(self.generation) {
            return None;
        }

        let mut last_error = loss;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if !policy.allows_attempt(attempt) {
                error!(attempts = attempt - 1, "Max reconnection attempts reached");
                self.shared.fail(self.generation, last_error);
                return None;
            }

            let delay = policy.backoff_delay(attempt) + rand_jitter();
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!("Disconnect requested during backoff");
                    return None;
                }
                () = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                result = establish(&self.endpoint, &self.options) => result,
            };

            let (client, eventloop) = match result {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(attempt, error = %err, "Reconnect attempt failed");
                    last_error = err;
                    continue;
                }
            };

            match self.shared.activate(self.generation, &client) {
                Activation::Ready(restore) => {
                    self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(
                        attempt,
                        topics = restore.subscribe.len(),
                        unsubscribed = restore.unsubscribe.len(),
                        "Reconnected, subscriptions restored"
                    );
                    return Some((client, eventloop));
                }
                Activation::Superseded => return None,
                Activation::Failed(err) => {
                    warn!(attempt, error = %err, "Subscription restore failed");
                    last_error = err;
                }
            }
        }
    }
}

/// Best-effort close: queued UNSUBSCRIBEs go out first, then MQTT DISCONNECT.
async fn close_session(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "Disconnect request not queued");
        return;
    }

    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Close handshake incomplete"),
        Err(_) => debug!("Close handshake timed out"),
    }
}
