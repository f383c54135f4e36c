//! Main application orchestration.
//!
//! Coordinates all components:
//! - Broker connection and topic registry
//! - Dispatcher feeding one stream window per configured channel
//! - Fault observer and connection state watcher
//! - Dashboard server

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vitals_broker::{BrokerConnection, ConnectionState, InboundMessage};
use vitals_dashboard::DashboardState;
use vitals_feed::{DispatchFault, Dispatcher, StreamWindow, TopicSubscriptionRegistry};
use vitals_telemetry::Metrics;

/// Main application.
pub struct Application {
    config: AppConfig,
    connection: Arc<BrokerConnection>,
    registry: Arc<TopicSubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    inbound_rx: Option<mpsc::Receiver<InboundMessage>>,
    windows: Vec<StreamWindow>,
    dashboard: DashboardState,
    shutdown: CancellationToken,
}

impl Application {
    /// Build every component. Nothing touches the network until `start()`.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(config.broker.inbound_capacity);
        let connection = Arc::new(BrokerConnection::new(config.reconnect_policy(), inbound_tx));
        let registry = TopicSubscriptionRegistry::new(connection.clone());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        let dashboard = DashboardState::new(connection.state_watch());

        Ok(Self {
            config,
            connection,
            registry,
            dispatcher,
            inbound_rx: Some(inbound_rx),
            windows: Vec::new(),
            dashboard,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<TopicSubscriptionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn windows(&self) -> &[StreamWindow] {
        &self.windows
    }

    pub fn dashboard(&self) -> &DashboardState {
        &self.dashboard
    }

    /// Connect to the broker and open one window per configured channel.
    pub async fn start(&mut self) -> AppResult<()> {
        let options = self.config.connect_options();
        info!(
            url = %self.config.broker.url,
            client_id = %options.client_id,
            reconnect = self.config.reconnect.enabled,
            "Connecting to broker"
        );
        self.connection
            .connect(&self.config.broker.url, &options)
            .await?;

        for channel in &self.config.channels {
            let window =
                StreamWindow::open(self.registry.clone(), &channel.topic, channel.capacity).await?;
            self.dashboard
                .add_channel(channel.display_label(), window.reader());
            self.windows.push(window);
        }

        info!(
            channels = ?self.config.channels.iter().map(|c| &c.topic).collect::<Vec<_>>(),
            "Stream windows opened"
        );
        Ok(())
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> AppResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Run the dispatcher, observers and dashboard until `stop` resolves or
    /// the connection fails for good.
    pub async fn run_until(mut self, stop: impl Future<Output = ()>) -> AppResult<()> {
        let inbound_rx = self
            .inbound_rx
            .take()
            .ok_or_else(|| AppError::Config("Application already running".to_string()))?;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let dispatcher = self.dispatcher.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher.run(inbound_rx, token).await;
        }));

        tasks.push(tokio::spawn(observe_faults(
            self.dispatcher.faults(),
            self.shutdown.clone(),
        )));

        if self.config.dashboard.enabled {
            let dashboard = self.dashboard.clone();
            let config = self.config.dashboard.clone();
            let token = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = vitals_dashboard::run_server(dashboard, config, token).await {
                    error!(error = %e, "Dashboard server failed");
                }
            }));
        } else {
            info!("Dashboard disabled");
        }

        let watcher = watch_connection(
            self.connection.state_watch(),
            self.connection.clone(),
            self.shutdown.clone(),
        );

        let result = tokio::select! {
            () = stop => Ok(()),
            outcome = watcher => outcome,
        };

        self.shutdown_components(tasks).await;
        result
    }

    async fn shutdown_components(&mut self, tasks: Vec<JoinHandle<()>>) {
        info!("Shutting down");

        for window in &mut self.windows {
            window.close();
        }
        self.connection.disconnect();
        self.shutdown.cancel();

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }

        let stats = self.dispatcher.stats();
        info!(
            messages = stats.messages,
            deliveries = stats.deliveries,
            decode_errors = stats.decode_errors,
            listener_errors = stats.listener_errors,
            unrouted = stats.unrouted,
            "Shutdown complete"
        );
    }
}

/// Mirror connection state into logs and metrics. Returns an error once the
/// connection has failed for good.
async fn watch_connection(
    mut state_rx: watch::Receiver<ConnectionState>,
    connection: Arc<BrokerConnection>,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let mut reconnects_seen = connection.reconnect_count();

    loop {
        let state = *state_rx.borrow_and_update();
        Metrics::broker_state_set(state.as_str());

        match state {
            ConnectionState::Connected => {
                let reconnects = connection.reconnect_count();
                if reconnects > reconnects_seen {
                    Metrics::broker_reconnected(reconnects - reconnects_seen);
                    reconnects_seen = reconnects;
                }
                info!(indicator = "connected", reconnects, "Broker connection up");
            }
            ConnectionState::Connecting => debug!("Broker connecting"),
            ConnectionState::Reconnecting => {
                warn!(indicator = "disconnected", "Broker connection lost, reconnecting");
            }
            ConnectionState::Disconnected => {
                info!(indicator = "disconnected", "Broker disconnected");
            }
            ConnectionState::Failed => {
                let reason = connection
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                error!(indicator = "disconnected", reason = %reason, "Broker connection failed");
                return Err(AppError::ConnectionFailed(reason));
            }
        }

        tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Log contained dispatch faults with a running per-topic tally.
async fn observe_faults(
    mut faults: broadcast::Receiver<DispatchFault>,
    shutdown: CancellationToken,
) {
    let mut per_topic: HashMap<String, u64> = HashMap::new();

    loop {
        let fault = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            fault = faults.recv() => fault,
        };

        match fault {
            Ok(fault) => {
                let count = per_topic.entry(fault.topic().to_string()).or_default();
                *count += 1;
                match &fault {
                    DispatchFault::Decode(err) => {
                        debug!(topic = fault.topic(), total = *count, error = %err, "Sample dropped");
                    }
                    DispatchFault::Listener { handle, error } => {
                        warn!(
                            topic = fault.topic(),
                            listener = ?handle,
                            total = *count,
                            error = %error,
                            "Listener failed"
                        );
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Fault observer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    if !per_topic.is_empty() {
        info!(faults = ?per_topic, "Dispatch faults observed");
    }
}
