//! dazzle-orchestrator worker entry point.
//!
//! Owns the populated `FunctionRegistry` and the timer-driven side of step
//! execution that has no HTTP caller to trigger it: human-task escalation
//! sweeps and cron-style schedule triggers. Service-step dispatch itself
//! happens inline inside `Orchestrator::advance` (called from
//! `start_process`/`complete_task`/`signal`), so this binary's loop is a
//! ticker, not a queue consumer.
//!
//! `dazzle-daemon::main` deliberately builds its `Orchestrator` with an
//! empty registry and leaves this binary to own the real one — see
//! DESIGN.md's Open Question (d).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dazzle_orchestrator::{FunctionRegistry, Orchestrator};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let process_store = dazzle_process::ProcessStore::new(
        dazzle_process::store::connect_from_env().await.context("connecting process database")?,
    );
    dazzle_process::store::migrate(process_store.pool()).await?;

    let event_bus = dazzle_tier::create_bus(&dazzle_tier::TierConfig::default())
        .await
        .context("wiring event bus")?;

    // Deployments with `Service` steps register their step functions here,
    // e.g. `registry.register("send_welcome_email", my_fn)`, before the
    // orchestrator starts taking `start_process` calls over the bus.
    let registry = FunctionRegistry::new();
    let orchestrator = Arc::new(Orchestrator::new(process_store, Some(event_bus), registry));

    let escalation_interval_secs = env_i64("DAZZLE_ORCHESTRATOR_ESCALATION_INTERVAL_SECS").unwrap_or(300);
    let tick_interval = Duration::from_millis(env_u64("DAZZLE_ORCHESTRATOR_TICK_INTERVAL_MS").unwrap_or(5_000));

    info!(tick_interval_ms = tick_interval.as_millis() as u64, "dazzle-orchestrator starting");

    let mut ticker = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match orchestrator.check_task_timeouts(escalation_interval_secs).await {
                    Ok(0) => {}
                    Ok(n) => info!(transitioned = n, "human task timeouts processed"),
                    Err(err) => warn!(error = %err, "check_task_timeouts failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

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
