//! Worker command implementation.

use crate::server::{start_server, ServerState};
use anyhow::Result;
use shokuyoku_core::config::parse_server_list;
use shokuyoku_core::health::HealthCheck;
use shokuyoku_core::metrics::IngestionMetrics;
use shokuyoku_core::{Config, IngestionEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Run the ingestion worker until SIGINT or SIGTERM.
pub async fn run(
    mut config: Config,
    bootstrap_servers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
) -> Result<()> {
    apply_overrides(&mut config, bootstrap_servers, topic, consumer_group);

    info!(
        topic = %config.kafka.topic,
        group = %config.kafka.consumer_group,
        database = %config.schema.database,
        "Starting ingestion worker"
    );

    let metrics = Arc::new(IngestionMetrics::new()?);
    let health = Arc::new(HealthCheck::new());
    let shutdown = CancellationToken::new();

    let mut engine = IngestionEngine::from_config(&config)?
        .with_metrics(Arc::clone(&metrics))
        .with_health(Arc::clone(&health))
        .with_shutdown(shutdown.clone());

    let server_state = Arc::new(ServerState { health, metrics });
    tokio::spawn(start_server(
        server_state,
        config.monitoring.health_port,
        shutdown.clone(),
    ));

    tokio::spawn(wait_for_signal(shutdown.clone()));

    engine.run().await?;

    // Stops the HTTP server when the engine exits on its own.
    shutdown.cancel();
    info!("Ingestion worker stopped");
    Ok(())
}

fn apply_overrides(
    config: &mut Config,
    bootstrap_servers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
) {
    if let Some(servers) = bootstrap_servers {
        config.kafka.bootstrap_servers = parse_server_list(&servers);
    }
    if let Some(t) = topic {
        config.kafka.topic = t;
    }
    if let Some(g) = consumer_group {
        config.kafka.consumer_group = g;
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C stops the worker");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    shutdown.cancel();
}
