//! Consumer orchestration.
//!
//! This module wires the pieces together:
//! 1. Loads the consumer topology file
//! 2. Dials every broker endpoint through the connection supervisor
//! 3. Declares the full queue topology of every binding
//! 4. Spawns one worker pool per binding
//! 5. Serves the health endpoint
//! 6. Runs until SIGINT/SIGTERM or a fatal configuration error

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::{net::TcpListener, signal, sync::oneshot, task::JoinSet};
use tracing::{info, warn};

use mailroute::config::ConsumersConfig;
use mailroute::queue::{declare, Binding};
use mailroute::web::{router, AppState};
use mailroute::worker::{prefetch_count, WorkerPool};
use mailroute::{Config, ConfigurationError, ConnectionSupervisor, HttpSender, Sender};

/// Run the consumer until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let consumers = ConsumersConfig::load(&config.consumers_path)
        .context("Failed to load consumer config")?;

    let total_workers = consumers.total_handlers();
    let prefetch = prefetch_count(config.sender_count, total_workers);
    info!(
        endpoints = consumers.consumers.len(),
        total_workers,
        sender_count = config.sender_count,
        prefetch,
        "consumer_config_loaded"
    );

    let mut supervisor =
        ConnectionSupervisor::start(consumers.consumers.iter().map(|c| c.uri.as_str())).await?;

    let client = Client::builder()
        .pool_max_idle_per_host(config.sender_count)
        .build()
        .context("Failed to create HTTP client")?;
    let sender: Arc<dyn Sender> = Arc::new(HttpSender::new(
        client,
        config.sender_url.clone(),
        Duration::from_millis(config.sender_timeout_ms),
    ));

    let mut pools = Vec::new();
    for consumer in &consumers.consumers {
        let handle = supervisor.handle(&consumer.uri)?;
        let connection = handle.current();
        let channel = connection
            .create_channel()
            .await
            .map_err(|source| ConfigurationError::Channel {
                endpoint: handle.endpoint().to_string(),
                step: "open",
                source,
            })?;

        for binding_config in &consumer.bindings {
            let binding = Binding::build(&binding_config.resolve()?);
            declare(&channel, &binding).await?;
            pools.push(WorkerPool::new(binding, handle.clone(), Arc::clone(&sender), prefetch));
        }

        if let Err(e) = channel.close(200, "Topology declared").await {
            warn!(endpoint = %handle.endpoint(), error = %e, "rabbitmq_channel_close_error");
        }
    }

    let mut workers = JoinSet::new();
    for pool in &pools {
        pool.spawn(&mut workers);
    }

    let state = AppState::new(supervisor.handles(), pools);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;
    info!(address = %addr, "health_server_listening");

    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async {
                let _ = server_stopped.await;
            })
            .await
    });

    info!("worker_ready");

    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        e = supervisor.failed() => Err(e),
        e = first_failure(&mut workers) => Err(e),
    };

    info!("worker_stopping");
    workers.abort_all();
    let _ = stop_server.send(());
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "health_server_error"),
        Err(e) => warn!(error = %e, "health_server_task_failed"),
        Ok(Ok(())) => {}
    }
    supervisor.close().await;

    outcome.context("Fatal configuration error")?;

    info!("worker_shutdown_complete");
    Ok(())
}

/// Resolve with the first fatal error reported by a worker.
async fn first_failure(workers: &mut JoinSet<Result<(), ConfigurationError>>) -> ConfigurationError {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => return e,
            Err(join) => {
                return ConfigurationError::TaskFailed {
                    task: "worker",
                    message: join.to_string(),
                }
            }
        }
    }
    std::future::pending().await
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
