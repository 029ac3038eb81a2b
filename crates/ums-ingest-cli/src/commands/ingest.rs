//! Ingest command implementation.

use crate::server::{start_server, ServerState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ums_ingest_core::engine::{BackoffPolicy, PollRunner};
use ums_ingest_core::kafka::KafkaBroker;
use ums_ingest_core::sink::FileSink;
use ums_ingest_core::transform::{GeoResolver, MaxMindResolver, UnavailableResolver};
use ums_ingest_core::{Config, KafkaSource};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Run the source until SIGINT or SIGTERM.
pub async fn run(
    mut config: Config,
    bootstrap_servers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
) -> Result<()> {
    // Apply CLI overrides
    if let Some(servers) = bootstrap_servers {
        config.kafka.bootstrap_servers = servers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(t) = topic {
        config.kafka.topic = t;
    }
    if let Some(g) = consumer_group {
        config.kafka.consumer_group = g;
    }
    config.validate()?;

    info!(
        topic = %config.kafka.topic,
        group = %config.kafka.consumer_group,
        sink = %config.sink.path.display(),
        "Starting Kafka source"
    );

    let geo_resolver: Arc<dyn GeoResolver> = match config.geo.database_path {
        Some(ref path) => Arc::new(MaxMindResolver::open(path, config.geo.locale.clone())?),
        None => {
            warn!("No geo database configured, client data locations will be unknown");
            Arc::new(UnavailableResolver)
        }
    };

    let source = Arc::new(
        KafkaSource::builder(config.clone())
            .broker(Arc::new(KafkaBroker::new(config.kafka.clone())))
            .sink(Arc::new(FileSink::from_config(&config.sink)))
            .geo_resolver(geo_resolver)
            .build()?,
    );
    source.start().await?;

    let runner = PollRunner::new(Arc::clone(&source), BackoffPolicy::from(&config.runner));
    let shutdown_tx = runner.shutdown_signal();

    // Start HTTP server
    let server_state = Arc::new(ServerState {
        source: Arc::clone(&source),
    });
    tokio::spawn(start_server(
        server_state,
        config.monitoring.metrics_port,
        shutdown_tx.subscribe(),
    ));

    tokio::spawn(forward_shutdown_signals(shutdown_tx));

    let run_result = runner.run().await;

    if let Err(e) = source.stop().await {
        warn!(error = %e, "Source stopped with errors");
    }
    run_result?;

    info!("Kafka source stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM and broadcast shutdown.
async fn forward_shutdown_signals(shutdown_tx: broadcast::Sender<()>) {
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
                warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
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

    let _ = shutdown_tx.send(());
}
