//! Loyalty ledger server binary
//!
//! Opens the ledger and the retry queue, then drains the queue in the
//! background until Ctrl-C.

use anyhow::Context;
use loyalty_core::{metrics::Metrics, Config, Ledger, RetryQueue, Storage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOYALTY_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("LOYALTY_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading config from {}", path)),
        Err(_) => Config::from_env().context("loading config from environment"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = load_config()?;
    tracing::info!(
        service = %config.service_name,
        data_dir = %config.data_dir.display(),
        "Starting loyalty ledger"
    );

    let storage = Arc::new(Storage::open(&config).context("opening storage")?);
    let metrics = Metrics::new().context("registering metrics")?;
    let ledger = Ledger::new(storage, &config.ledger, metrics.clone());

    let queue = Arc::new(
        RetryQueue::open(config.queue_path(), config.queue.clone())
            .await
            .context("opening retry queue")?
            .with_metrics(metrics),
    );

    let cancel = CancellationToken::new();
    let drain = queue.clone().spawn_drain_loop(
        Arc::new(ledger.clone()),
        config.queue.drain_interval(),
        cancel.clone(),
    );
    tracing::info!("Ledger opened, retry queue draining");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down loyalty ledger");
    cancel.cancel();
    drain.await.context("drain loop panicked")?;
    ledger.shutdown().await?;

    Ok(())
}
