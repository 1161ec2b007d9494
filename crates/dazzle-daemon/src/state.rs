//! Shared runtime state for the admin daemon.
//!
//! A `Clone`-able `Arc` handle carrying a broadcast bus for SSE plus the
//! store/orchestrator handles route handlers need, with no async work done
//! at construction time.

use std::sync::Arc;
use std::time::Duration;

use dazzle_bus::Bus;
use dazzle_orchestrator::Orchestrator;
use dazzle_outbox::OutboxStore;
use dazzle_process::ProcessStore;
use dazzle_version::VersionStore;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    RunTransitioned { run_id: String, status: String },
    TaskCompleted { task_id: String, outcome: String },
    LogLine { level: String, msg: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Clone)]
pub struct AppState {
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub process_store: ProcessStore,
    pub outbox_store: OutboxStore,
    pub version_store: VersionStore,
    pub event_bus: Arc<dyn Bus>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(
        process_store: ProcessStore,
        outbox_store: OutboxStore,
        version_store: VersionStore,
        event_bus: Arc<dyn Bus>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "dazzle-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            process_store,
            outbox_store,
            version_store,
            event_bus,
            orchestrator,
        }
    }
}

pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START.get_or_init(std::time::Instant::now).elapsed().as_secs()
}

pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
