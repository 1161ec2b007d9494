//! dazzle-publisher worker entry point.
//!
//! Thin by design, matching `dazzle-daemon::main`'s shape: wire tracing and
//! storage from the environment, build a `Publisher`, then run its poll
//! loop until `SIGINT`/`SIGTERM`. This is the worker binary the admin daemon
//! defers to for the populated outbox-draining loop (`dazzle-daemon::main`'s
//! `FunctionRegistry::new()` comment).

use std::sync::Arc;

use anyhow::Context;
use dazzle_publisher::{Publisher, PublisherConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let outbox_store = dazzle_outbox::OutboxStore::new(
        dazzle_outbox::connect_from_env().await.context("connecting outbox database")?,
    );
    dazzle_outbox::migrate(outbox_store.pool()).await?;

    let event_bus = dazzle_tier::create_bus(&dazzle_tier::TierConfig::default())
        .await
        .context("wiring event bus")?;

    let config = PublisherConfig {
        poll_interval_ms: env_u64("DAZZLE_PUBLISHER_POLL_INTERVAL_MS").unwrap_or(500),
        batch_size: env_i64("DAZZLE_PUBLISHER_BATCH_SIZE").unwrap_or(50),
        max_attempts: env_i32("DAZZLE_PUBLISHER_MAX_ATTEMPTS").unwrap_or(5),
        lease_seconds: env_i64("DAZZLE_PUBLISHER_LEASE_SECONDS").unwrap_or(30),
        ..PublisherConfig::default()
    };

    let publisher = Arc::new(Publisher::new(outbox_store, event_bus, config));
    info!(publisher_id = %publisher.publisher_id(), "dazzle-publisher starting");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining in-flight batch");
        shutdown.cancel();
    });

    publisher.run(cancel).await;
    info!("dazzle-publisher stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_i32(key: &str) -> Option<i32> {
    std::env::var(key).ok()?.parse().ok()
}
