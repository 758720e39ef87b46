use anyhow::{Context, Result};
use catalog_service::api::{start_api_server, AppState};
use catalog_service::catalog_store::CatalogStore;
use catalog_service::config::Config;
use catalog_service::encoder::{FormatEncoder, HttpFormatEncoder};
use catalog_service::object_store;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Cafe Catalog Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let catalog = CatalogStore::connect(&config.database)
        .await
        .context("Failed to connect to database")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        catalog
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let store = object_store::from_config(&config.s3, config.uploads.object_timeout())
        .await
        .context("Failed to initialize object store")?;

    let encoder: Option<Arc<dyn FormatEncoder>> = HttpFormatEncoder::from_config(&config.encoder)
        .context("Failed to initialize format encoder")?
        .map(|e| Arc::new(e) as Arc<dyn FormatEncoder>);
    if encoder.is_none() {
        warn!("No format encoder configured; alternate-format variants are skipped");
    }

    let state = AppState::new(
        catalog,
        store,
        encoder,
        &config.optimizer,
        &config.uploads,
    );

    start_api_server(state, &config.api, shutdown_signal()).await?;

    info!("Catalog service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down catalog service");
}
