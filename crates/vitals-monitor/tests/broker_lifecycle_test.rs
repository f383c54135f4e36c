//! Broker lifecycle integration tests.
//!
//! Tests the connection lifecycle against a mock broker:
//! - Connection establishment and idempotent connect
//! - Subscription handling, refusal and cancellation
//! - Reconnection with subscription restore

mod integration;
use integration::common::eventually;
use integration::common::mock_broker::MockBroker;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vitals_broker::{
    BrokerConnection, ConnectOptions, ConnectionError, ConnectionState, ReconnectPolicy,
};
use vitals_feed::{Dispatcher, FeedError, StreamWindow, TopicSubscriptionRegistry};

const ECG: &str = "sensores/ecg";
const SPO2: &str = "sensores/oxigeno";

struct Harness {
    connection: Arc<BrokerConnection>,
    registry: Arc<TopicSubscriptionRegistry>,
    shutdown: CancellationToken,
}

impl Harness {
    /// Connection + registry + running dispatcher, not yet connected.
    fn new(policy: ReconnectPolicy) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let connection = Arc::new(BrokerConnection::new(policy, tx));
        let registry = TopicSubscriptionRegistry::new(connection.clone());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(rx, token).await });

        Self {
            connection,
            registry,
            shutdown,
        }
    }

    async fn connect(&self, broker: &MockBroker) {
        self.connection
            .connect(&broker.url(), &ConnectOptions::default())
            .await
            .unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.connection.disconnect();
    }
}

#[tokio::test]
async fn test_connect_and_subscribe() {
    let broker = MockBroker::start().await;
    let harness = Harness::new(ReconnectPolicy::disabled());

    harness.connect(&broker).await;
    assert_eq!(harness.connection.state(), ConnectionState::Connected);
    assert_eq!(broker.connection_count(), 1);
    assert!(broker.client_ids().await[0].starts_with("vitals-"));

    let window = StreamWindow::open(harness.registry.clone(), ECG, 50)
        .await
        .unwrap();
    assert!(window.is_attached());
    assert_eq!(broker.subscribes().await, vec![ECG.to_string()]);
    assert_eq!(harness.connection.confirmed_topics(), vec![ECG.to_string()]);

    broker.publish(ECG, r#"{"valor": 72}"#).await;
    eventually("first sample", || async { window.len() == 1 }).await;
    assert_eq!(window.latest().unwrap().as_f64(), Some(72.0));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_connect_opens_one_transport() {
    let broker = MockBroker::start().await;
    let harness = Harness::new(ReconnectPolicy::disabled());
    let options = ConnectOptions::default();
    let url = broker.url();

    let (a, b) = tokio::join!(
        harness.connection.connect(&url, &options),
        harness.connection.connect(&url, &options),
    );
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(broker.connection_count(), 1);

    // Already connected: no-op
    harness.connection.connect(&url, &options).await.unwrap();
    assert_eq!(broker.connection_count(), 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_one_broker_subscription_per_topic() {
    let broker = MockBroker::start().await;
    let harness = Harness::new(ReconnectPolicy::disabled());
    harness.connect(&broker).await;

    let mut first = StreamWindow::open(harness.registry.clone(), ECG, 10)
        .await
        .unwrap();
    let mut second = StreamWindow::open(harness.registry.clone(), ECG, 20)
        .await
        .unwrap();
    assert_eq!(broker.subscribe_count(ECG).await, 1);

    broker.publish(ECG, "80").await;
    eventually("both windows fed", || async {
        first.len() == 1 && second.len() == 1
    })
    .await;

    assert!(first.close());
    assert!(broker.unsubscribes().await.is_empty());
    assert!(harness.registry.has_topic(ECG));

    broker.publish(ECG, "81").await;
    eventually("second window still fed", || async { second.len() == 2 }).await;
    assert_eq!(first.len(), 1);
    assert_eq!(second.latest().unwrap().as_f64(), Some(81.0));

    assert!(second.close());
    eventually("unsubscribe", || async {
        broker.unsubscribes().await == vec![ECG.to_string()]
    })
    .await;
    assert!(!harness.registry.has_topic(ECG));
    assert!(harness.connection.broker_topics().is_empty());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_rejected_subscription_leaves_no_entry() {
    let broker = MockBroker::start().await;
    broker.reject(ECG).await;
    let harness = Harness::new(ReconnectPolicy::disabled());
    harness.connect(&broker).await;

    let err = StreamWindow::open(harness.registry.clone(), ECG, 50)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FeedError::Connection(ConnectionError::SubscriptionRejected(ECG.to_string()))
    );
    assert!(!harness.registry.has_topic(ECG));
    assert!(harness.connection.broker_topics().is_empty());
    assert_eq!(harness.connection.state(), ConnectionState::Connected);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_cancels_pending_subscribe() {
    let broker = MockBroker::start().await;
    broker.hold_subacks(true);
    let harness = Harness::new(ReconnectPolicy::disabled());
    harness.connect(&broker).await;

    let registry = harness.registry.clone();
    let pending = tokio::spawn(async move { StreamWindow::open(registry, ECG, 50).await });

    eventually("subscribe sent", || async {
        broker.subscribe_count(ECG).await == 1
    })
    .await;
    harness.connection.disconnect();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, FeedError::Connection(ConnectionError::NotConnected));
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
    assert!(harness.registry.is_empty());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_after_disconnect_fails() {
    let broker = MockBroker::start().await;
    let harness = Harness::new(ReconnectPolicy::disabled());
    harness.connect(&broker).await;

    let window = StreamWindow::open(harness.registry.clone(), ECG, 50)
        .await
        .unwrap();
    harness.connection.disconnect();

    assert!(!window.is_attached());
    assert!(harness.registry.is_empty());

    let err = StreamWindow::open(harness.registry.clone(), ECG, 50)
        .await
        .unwrap_err();
    assert_eq!(err, FeedError::Connection(ConnectionError::NotConnected));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_drop_without_reconnect_fails_connection() {
    let broker = MockBroker::start().await;
    let harness = Harness::new(ReconnectPolicy::disabled());
    harness.connect(&broker).await;
    let window = StreamWindow::open(harness.registry.clone(), ECG, 50)
        .await
        .unwrap();

    broker.drop_connections().await;

    let mut state = harness.connection.state_watch();
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Failed),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(harness.connection.last_error().is_some());
    assert!(!window.is_attached());
    assert_eq!(broker.connection_count(), 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let broker = MockBroker::start().await;
    let harness = Harness::new(ReconnectPolicy::exponential(5, 50, 200));
    harness.connect(&broker).await;

    let window = StreamWindow::open(harness.registry.clone(), ECG, 50)
        .await
        .unwrap();
    broker.publish(ECG, "1").await;
    eventually("sample before drop", || async { window.len() == 1 }).await;

    broker.drop_connections().await;

    eventually("second session", || async { broker.connection_count() == 2 }).await;
    eventually("topic restored", || async {
        broker.subscribe_count(ECG).await == 2
    })
    .await;
    eventually("connected again", || async {
        harness.connection.state() == ConnectionState::Connected
            && harness.connection.confirmed_topics() == vec![ECG.to_string()]
    })
    .await;

    assert_eq!(harness.connection.reconnect_count(), 1);
    assert!(window.is_attached());

    broker.publish(ECG, "2").await;
    eventually("delivery resumed", || async { window.len() == 2 }).await;
    let values: Vec<i64> = window
        .snapshot()
        .iter()
        .filter_map(|s| s.value.as_i64())
        .collect();
    assert_eq!(values, vec![1, 2]);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_refused_restore_detaches_window() {
    let broker = MockBroker::start().await;
    let harness = Harness::new(ReconnectPolicy::exponential(5, 50, 200));
    harness.connect(&broker).await;

    let ecg = StreamWindow::open(harness.registry.clone(), ECG, 50)
        .await
        .unwrap();
    let spo2 = StreamWindow::open(harness.registry.clone(), SPO2, 50)
        .await
        .unwrap();

    broker.reject(ECG).await;
    broker.drop_connections().await;

    eventually("second session", || async { broker.connection_count() == 2 }).await;
    eventually("restore answered", || async {
        harness.connection.state() == ConnectionState::Connected
            && harness.connection.confirmed_topics() == vec![SPO2.to_string()]
    })
    .await;
    eventually("ecg detached", || async { !ecg.is_attached() }).await;

    assert!(!harness.registry.has_topic(ECG));
    assert_eq!(harness.registry.listener_count(ECG), 0);
    assert_eq!(harness.connection.broker_topics(), vec![SPO2.to_string()]);
    assert!(spo2.is_attached());
    assert_eq!(harness.registry.topics(), harness.connection.broker_topics());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_during_outage_reaches_broker_after_reconnect() {
    let broker = MockBroker::start().await;
    let harness = Harness::new(ReconnectPolicy::exponential(5, 300, 1000));
    harness.connect(&broker).await;

    let mut ecg = StreamWindow::open(harness.registry.clone(), ECG, 50)
        .await
        .unwrap();
    let spo2 = StreamWindow::open(harness.registry.clone(), SPO2, 50)
        .await
        .unwrap();

    broker.drop_connections().await;
    let mut state = harness.connection.state_watch();
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(ecg.close());
    assert!(!harness.registry.has_topic(ECG));
    assert!(broker.unsubscribes().await.is_empty());

    eventually("reconnected", || async {
        harness.connection.state() == ConnectionState::Connected
            && harness.connection.confirmed_topics() == vec![SPO2.to_string()]
    })
    .await;
    eventually("deferred unsubscribe sent", || async {
        broker.unsubscribes().await == vec![ECG.to_string()]
    })
    .await;

    assert_eq!(broker.subscribe_count(ECG).await, 1);
    assert_eq!(broker.subscribe_count(SPO2).await, 2);
    assert!(spo2.is_attached());
    assert_eq!(harness.registry.topics(), harness.connection.broker_topics());

    broker.shutdown().await;
}
