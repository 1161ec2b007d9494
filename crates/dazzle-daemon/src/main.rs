//! dazzle-daemon entry point.
//!
//! Thin by design: wires tracing, shared state, and middleware, then hands
//! off to `routes::build_router`. All handlers live in `routes.rs`; all
//! shared state lives in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use dazzle_daemon::{routes, state};
use dazzle_orchestrator::{FunctionRegistry, Orchestrator};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let process_store = dazzle_process::ProcessStore::new(dazzle_process::store::connect_from_env().await?);
    dazzle_process::store::migrate(process_store.pool()).await?;

    let outbox_store = dazzle_outbox::OutboxStore::new(dazzle_outbox::connect_from_env().await?);
    dazzle_outbox::migrate(outbox_store.pool()).await?;

    let version_store = dazzle_version::VersionStore::new(dazzle_version::store::connect_from_env().await?);
    dazzle_version::store::migrate(version_store.pool()).await?;

    let event_bus = dazzle_tier::create_bus(&dazzle_tier::TierConfig::default()).await?;

    // The daemon itself binds no step functions — it only performs admin
    // actions (cancel, complete human task, signal); the worker process
    // that runs `Orchestrator::run`-style polling owns the populated
    // `FunctionRegistry`.
    let orchestrator = Arc::new(Orchestrator::new(
        process_store.clone(),
        Some(event_bus.clone()),
        FunctionRegistry::new(),
    ));

    let shared = Arc::new(state::AppState::new(
        process_store,
        outbox_store,
        version_store,
        event_bus,
        orchestrator,
    ));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(5));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8787)));
    info!("dazzle-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("DAZZLE_DAEMON_ADDR").ok()?.parse().ok()
}

fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
    ];

    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
