//! Drain watcher — polls in-progress migrations and auto-completes the
//! ones whose `from` version has no non-terminal runs left.
//!
//! A `tokio::spawn` loop ticking a `tokio::time::interval`, cancellable and
//! restartable without leaking the previous task.

use std::sync::Arc;
use std::time::Duration;

use dazzle_process::ProcessStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::store::{VersionError, VersionStore};

pub struct DrainWatcher {
    version_store: VersionStore,
    process_store: ProcessStore,
    poll_interval: Duration,
}

impl DrainWatcher {
    pub fn new(version_store: VersionStore, process_store: ProcessStore, poll_interval: Duration) -> Self {
        Self {
            version_store,
            process_store,
            poll_interval,
        }
    }

    /// Run one poll of all in-progress migrations, completing those that
    /// have drained. Returns the number completed this pass.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let migrations = self.version_store.list_in_progress_migrations().await?;
        let mut completed = 0;
        for migration in migrations {
            let remaining = self
                .process_store
                .count_runs_for_version(&migration.from_version)
                .await?;
            if remaining == 0 {
                match self.version_store.complete_migration(&migration.id, 0).await {
                    Ok(()) => {
                        info!(migration_id = %migration.id, from = %migration.from_version, "migration drained and completed");
                        completed += 1;
                    }
                    Err(VersionError::MigrationInFlight { .. }) => {
                        // Lost the race to another completer between the count and the update; fine.
                    }
                    Err(e) => error!(migration_id = %migration.id, error = %e, "failed to complete drained migration"),
                }
            } else {
                debug!(migration_id = %migration.id, remaining, "migration still draining");
            }
        }
        Ok(completed)
    }

    /// Spawn the poll loop. Drop the returned handle or await it after
    /// cancelling `cancel` to ensure the task actually stops; calling this
    /// again with a fresh `CancellationToken` starts an independent loop.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("drain watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once().await {
                            error!(error = %e, "drain watcher poll failed");
                        }
                    }
                }
            }
        })
    }
}
