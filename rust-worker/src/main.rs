//! Mailroute Worker - RabbitMQ consumer for outbound mail jobs.
//!
//! This worker drains the configured mail queues, hands each job to the
//! sender service, and reroutes failed jobs through tiered dead-letter
//! queues or into a failure queue for operators.

mod consumer;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailroute::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        consumers_path = %config.consumers_path.display(),
        sender_url = %config.sender_url,
        sender_count = config.sender_count,
        sender_timeout_ms = config.sender_timeout_ms,
        port = config.port,
        "config_loaded"
    );

    consumer::run(config).await?;

    Ok(())
}
