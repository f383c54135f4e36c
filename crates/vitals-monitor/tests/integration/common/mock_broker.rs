//! Mock MQTT-over-WebSocket broker for integration tests.
//!
//! Provides a minimal broker that can:
//! - Accept connections on the `mqtt` subprotocol
//! - Acknowledge, refuse or withhold subscriptions
//! - Publish to subscribed sessions
//! - Drop every live connection without a close frame

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use rumqttc::mqttbytes::Error as FrameError;
use rumqttc::{
    ConnAck, ConnectReturnCode, Packet, Publish, QoS, SubAck, SubscribeReasonCode, UnsubAck,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};

const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";
const MAX_PACKET_SIZE: usize = 256 * 1024;

enum Command {
    Publish { topic: String, payload: Vec<u8> },
    Drop,
}

#[derive(Default)]
struct Shared {
    connections: AtomicUsize,
    hold_subacks: AtomicBool,
    rejected: Mutex<HashSet<String>>,
    subscribes: Mutex<Vec<String>>,
    unsubscribes: Mutex<Vec<String>>,
    client_ids: Mutex<Vec<String>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<Command>>>,
}

/// A mock MQTT broker for testing.
pub struct MockBroker {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    shared: Arc<Shared>,
}

impl MockBroker {
    /// Start a new mock broker on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(stream, accept_shared.clone()));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            shared,
        }
    }

    /// Get the broker's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}/mqtt", self.addr)
    }

    /// Completed MQTT sessions (CONNECT received), current and past.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Refuse future SUBSCRIBEs for `topic`.
    pub async fn reject(&self, topic: &str) {
        self.shared.rejected.lock().await.insert(topic.to_string());
    }

    /// Record SUBSCRIBEs but never answer them.
    pub fn hold_subacks(&self, hold: bool) {
        self.shared.hold_subacks.store(hold, Ordering::SeqCst);
    }

    /// Every SUBSCRIBE filter received, in order, across sessions.
    pub async fn subscribes(&self) -> Vec<String> {
        self.shared.subscribes.lock().await.clone()
    }

    pub async fn subscribe_count(&self, topic: &str) -> usize {
        self.subscribes().await.iter().filter(|t| *t == topic).count()
    }

    pub async fn unsubscribes(&self) -> Vec<String> {
        self.shared.unsubscribes.lock().await.clone()
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.shared.client_ids.lock().await.clone()
    }

    /// Publish to every live session subscribed to `topic`.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let payload = payload.into();
        self.broadcast(|| Command::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
        })
        .await;
    }

    /// Sever every live connection without a close frame.
    pub async fn drop_connections(&self) {
        self.broadcast(|| Command::Drop).await;
        self.shared.sessions.lock().await.clear();
    }

    /// Shutdown the broker. Live sessions are dropped too.
    pub async fn shutdown(self) {
        self.drop_connections().await;
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn broadcast(&self, command: impl Fn() -> Command) {
        self.shared
            .sessions
            .lock()
            .await
            .retain(|session| session.send(command()).is_ok());
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let echo_subprotocol = |request: &Request, mut response: Response| {
        if request.headers().contains_key(SUBPROTOCOL_HEADER) {
            response
                .headers_mut()
                .insert(SUBPROTOCOL_HEADER, HeaderValue::from_static("mqtt"));
        }
        Ok::<Response, ErrorResponse>(response)
    };

    let ws_stream = match accept_hdr_async(stream, echo_subprotocol).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    shared.sessions.lock().await.push(command_tx);

    let mut buffer = BytesMut::new();
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        let mut replies = Vec::new();

        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    buffer.extend_from_slice(&data);
                    while let Some(packet) = next_packet(&mut buffer) {
                        match handle_packet(packet, &shared, &mut subscribed).await {
                            Some(Reply::Packet(reply)) => replies.push(reply),
                            Some(Reply::Close) => return,
                            None => {}
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            command = command_rx.recv() => match command {
                Some(Command::Publish { topic, payload }) => {
                    if subscribed.contains(&topic) {
                        replies.push(Packet::Publish(Publish::new(topic, QoS::AtMostOnce, payload)));
                    }
                }
                Some(Command::Drop) | None => return,
            },
        }

        for reply in replies {
            let mut bytes = BytesMut::new();
            reply.write(&mut bytes, MAX_PACKET_SIZE).unwrap();
            if write.send(Message::Binary(bytes.to_vec())).await.is_err() {
                return;
            }
        }
    }
}

/// Next complete packet in `buffer`; partial packets stay buffered.
fn next_packet(buffer: &mut BytesMut) -> Option<Packet> {
    match Packet::read(buffer, MAX_PACKET_SIZE) {
        Ok(packet) => Some(packet),
        Err(FrameError::InsufficientBytes(_)) => None,
        Err(e) => panic!("malformed packet from client: {e:?}"),
    }
}

enum Reply {
    Packet(Packet),
    Close,
}

async fn handle_packet(
    packet: Packet,
    shared: &Shared,
    subscribed: &mut HashSet<String>,
) -> Option<Reply> {
    match packet {
        Packet::Connect(connect) => {
            shared.client_ids.lock().await.push(connect.client_id);
            shared.connections.fetch_add(1, Ordering::SeqCst);
            Some(Reply::Packet(Packet::ConnAck(ConnAck::new(
                ConnectReturnCode::Success,
                false,
            ))))
        }
        Packet::Subscribe(subscribe) => {
            let rejected = shared.rejected.lock().await.clone();
            let mut return_codes = Vec::new();
            for filter in &subscribe.filters {
                let topic = &filter.path;
                shared.subscribes.lock().await.push(topic.clone());
                if rejected.contains(topic) {
                    return_codes.push(SubscribeReasonCode::Failure);
                } else {
                    subscribed.insert(topic.clone());
                    return_codes.push(SubscribeReasonCode::Success(QoS::AtMostOnce));
                }
            }
            if shared.hold_subacks.load(Ordering::SeqCst) {
                return None;
            }
            Some(Reply::Packet(Packet::SubAck(SubAck::new(
                subscribe.pkid,
                return_codes,
            ))))
        }
        Packet::Unsubscribe(unsubscribe) => {
            for topic in &unsubscribe.topics {
                subscribed.remove(topic);
                shared.unsubscribes.lock().await.push(topic.clone());
            }
            Some(Reply::Packet(Packet::UnsubAck(UnsubAck::new(
                unsubscribe.pkid,
            ))))
        }
        Packet::PingReq => Some(Reply::Packet(Packet::PingResp)),
        Packet::Disconnect => Some(Reply::Close),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_broker_starts() {
        let broker = MockBroker::start().await;
        assert!(broker.url().starts_with("ws://127.0.0.1:"));
        assert!(broker.url().ends_with("/mqtt"));
        assert_eq!(broker.connection_count(), 0);
        broker.shutdown().await;
    }
}
