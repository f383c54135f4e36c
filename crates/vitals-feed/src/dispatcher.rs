//! Inbound message dispatcher.
//!
//! Decodes each raw broker message into a [`Sample`] and invokes every
//! listener registered for its topic at dispatch time. Decode failures and
//! listener failures are contained here: they are logged, counted and
//! published on the fault channel, never propagated.

use crate::error::{DecodeError, ListenerError};
use crate::registry::{ListenerHandle, TopicSubscriptionRegistry};
use crate::sample::Sample;
use chrono::Utc;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vitals_broker::InboundMessage;
use vitals_telemetry::Metrics;

const FAULT_CHANNEL_CAPACITY: usize = 256;

/// A failure contained by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchFault {
    Decode(DecodeError),
    Listener {
        handle: ListenerHandle,
        error: ListenerError,
    },
}

impl DispatchFault {
    pub fn topic(&self) -> &str {
        match self {
            Self::Decode(err) => err.topic(),
            Self::Listener { handle, .. } => handle.topic(),
        }
    }
}

/// Outcome of dispatching one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub decode_failed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub messages: u64,
    pub decode_errors: u64,
    pub deliveries: u64,
    pub listener_errors: u64,
    /// Decoded samples with no listener on their topic.
    pub unrouted: u64,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    messages: AtomicU64,
    decode_errors: AtomicU64,
    deliveries: AtomicU64,
    listener_errors: AtomicU64,
    unrouted: AtomicU64,
}

pub struct Dispatcher {
    registry: Arc<TopicSubscriptionRegistry>,
    faults: broadcast::Sender<DispatchFault>,
    counters: DispatchCounters,
}

impl Dispatcher {
    pub fn new(registry: Arc<TopicSubscriptionRegistry>) -> Self {
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Self {
            registry,
            faults,
            counters: DispatchCounters::default(),
        }
    }

    /// Fault stream. Slow receivers lag rather than block dispatch.
    pub fn faults(&self) -> broadcast::Receiver<DispatchFault> {
        self.faults.subscribe()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            messages: self.counters.messages.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            listener_errors: self.counters.listener_errors.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
        }
    }

    /// Decode and fan out one message.
    ///
    /// Listeners are snapshotted before the first call: one registered during
    /// this dispatch does not see the message, one revoked during it may.
    pub fn dispatch(&self, message: &InboundMessage) -> DispatchReport {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);

        let sample = match Sample::decode(message) {
            Ok(sample) => sample,
            Err(err) => {
                warn!(topic = %message.topic, error = %err, "Dropping undecodable message");
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                Metrics::decode_error(&message.topic);
                self.report(DispatchFault::Decode(err));
                return DispatchReport {
                    decode_failed: true,
                    ..Default::default()
                };
            }
        };

        let listeners = self.registry.listeners_for(&sample.topic);
        if listeners.is_empty() {
            debug!(topic = %sample.topic, "No listeners for sample");
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
        }

        let mut report = DispatchReport::default();
        for (handle, listener) in listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(&sample)));
            let error = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(err)) => err,
                Err(payload) => ListenerError::Panicked(panic_message(payload.as_ref())),
            };

            report.failed += 1;
            warn!(
                topic = %sample.topic,
                listener = handle.id(),
                error = %error,
                "Listener failed"
            );
            Metrics::listener_error(&sample.topic, error.kind());
            self.report(DispatchFault::Listener { handle, error });
        }

        self.counters
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .listener_errors
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        let latency_us = (Utc::now() - sample.received_at)
            .num_microseconds()
            .unwrap_or(0);
        Metrics::sample_dispatched(&sample.topic, latency_us as f64 / 1000.0);

        report
    }

    /// Dispatch messages one at a time, in arrival order, until the channel
    /// closes or `shutdown` is cancelled.
    pub async fn run(
        &self,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) {
        info!("Dispatcher started");
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    info!("Dispatcher shutdown requested");
                    break;
                }

                message = inbound_rx.recv() => match message {
                    Some(message) => {
                        self.dispatch(&message);
                    }
                    None => {
                        info!("Inbound channel closed");
                        break;
                    }
                },
            }
        }
        let stats = self.stats();
        info!(
            messages = stats.messages,
            decode_errors = stats.decode_errors,
            listener_errors = stats.listener_errors,
            "Dispatcher stopped"
        );
    }

    fn report(&self, fault: DispatchFault) {
        // No receiver is fine.
        let _ = self.faults.send(fault);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
