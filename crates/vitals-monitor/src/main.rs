//! Vitals monitor - Entry Point
//!
//! Streams vital-sign telemetry from the broker into bounded windows and
//! serves them on the dashboard.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use vitals_monitor::config::DEFAULT_CONFIG_PATH;

/// Live vital-sign telemetry monitor
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "VITALS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Broker WebSocket URL (overrides the config file)
    #[arg(long)]
    broker_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = vitals_monitor::AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    if let Some(url) = args.broker_url {
        config.broker.url = url;
    }

    vitals_telemetry::init_logging(&config.logging)?;

    info!("Starting vitals-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = %args.config,
        broker_url = %config.broker.url,
        channels = config.channels.len(),
        "Configuration loaded"
    );

    let mut app = vitals_monitor::Application::new(config)?;
    app.start().await?;
    app.run().await?;

    Ok(())
}
