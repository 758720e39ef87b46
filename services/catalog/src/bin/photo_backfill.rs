//! Re-optimize cafe photos still stored under their staged upload key.
//!
//! Uses the service configuration; batch size and concurrency come from
//! `BACKFILL_BATCH_SIZE` and `BACKFILL_CONCURRENCY`.

use anyhow::{Context, Result};
use catalog_service::backfill::PhotoBackfill;
use catalog_service::catalog_store::CatalogStore;
use catalog_service::config::Config;
use catalog_service::encoder::{FormatEncoder, HttpFormatEncoder};
use catalog_service::object_store;
use catalog_service::optimizer::PhotoOptimizer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_BATCH_SIZE: i64 = 100;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} is not a valid number: {raw}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();

    let batch_size: i64 = env_or("BACKFILL_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
    let concurrency: usize = env_or("BACKFILL_CONCURRENCY", config.optimizer.max_concurrency)?;

    let catalog = CatalogStore::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    let store = object_store::from_config(&config.s3, config.uploads.object_timeout())
        .await
        .context("Failed to initialize object store")?;
    let encoder = HttpFormatEncoder::from_config(&config.encoder)
        .context("Failed to initialize format encoder")?
        .map(|e| Arc::new(e) as Arc<dyn FormatEncoder>);

    let optimizer = Arc::new(PhotoOptimizer::new(
        store,
        encoder,
        config.optimizer.clone(),
        config.uploads.max_upload_bytes,
    ));
    let backfill = PhotoBackfill::new(catalog, optimizer);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing the current batch");
            on_signal.cancel();
        }
    });

    info!(batch_size, concurrency, "Starting photo backfill");
    let summary = backfill.run(batch_size, concurrency, cancel).await?;

    info!(
        scanned = summary.scanned,
        rewritten = summary.rewritten,
        unchanged = summary.unchanged,
        superseded = summary.superseded,
        failed = summary.failed,
        "Photo backfill finished"
    );

    if summary.failed > 0 {
        anyhow::bail!("{} photos could not be optimized", summary.failed);
    }
    Ok(())
}
