mod bootstrap;
mod health;
mod webhook;

use std::time::Duration;

use anyhow::Result;
use axum::Router;
use parley_agent::background::drain_failures;
use parley_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use parley_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let enrichment = tokio::spawn(drain_failures(app.enrichment_failures));
    let workers = app.workers.spawn(shutdown_rx.clone());

    let router = Router::new()
        .merge(health::router(health::HealthState {
            db_pool: app.db_pool.clone(),
            inbound: app.inbound.clone(),
        }))
        .merge(webhook::router(webhook::WebhookState {
            pipeline: app.pipeline.clone(),
            verifier: app.verifier.clone(),
        }));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        worker_count = workers.len(),
        "parley-server listening"
    );

    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "failed to listen for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stopping| *stopping).await;
        })
        .await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "draining ingestion workers"
    );
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    for worker in workers {
        if tokio::time::timeout(grace, worker).await.is_err() {
            tracing::warn!(
                event_name = "system.server.worker_timeout",
                correlation_id = "shutdown",
                "worker did not stop within the grace period"
            );
        }
    }

    // The pipeline holds the last enrichment sender.
    drop(app.workers);
    drop(app.pipeline);
    if let Ok(Ok(drained)) = tokio::time::timeout(grace, enrichment).await {
        tracing::info!(
            event_name = "system.server.enrichment_drained",
            correlation_id = "shutdown",
            failures = drained,
            "enrichment failure channel drained"
        );
    }
    app.db_pool.close().await;

    Ok(())
}
