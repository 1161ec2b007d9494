//! Background outbox-draining worker.
//!
//! Ticks a batch, folds the results into a running stats report.
//! Backoff contract: `delay = base * 2^attempts`, capped at `max`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dazzle_bus::Bus;
use dazzle_outbox::{FetchPendingOptions, OutboxEntry, OutboxStore};
use dazzle_schemas::Envelope;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("outbox error: {0}")]
    Outbox(#[from] dazzle_outbox::OutboxError),
    #[error("envelope {id} is not valid JSON: {source}")]
    MalformedEnvelope {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, PublisherError>;

/// Why a single leased entry failed to publish this attempt.
#[derive(Debug, thiserror::Error)]
enum PublishAttemptError {
    #[error("envelope is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("bus rejected publish: {0}")]
    Bus(#[source] dazzle_bus::BusError),
    #[error("publish exceeded soft time limit")]
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub lease_seconds: i64,
    pub soft_time_limit_ms: u64,
    pub hard_time_limit_ms: u64,
    /// Base for `delay = base * 2^attempts`, capped at `backoff_max_ms`.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 50,
            max_attempts: 5,
            lease_seconds: 30,
            soft_time_limit_ms: 5_000,
            hard_time_limit_ms: 15_000,
            backoff_base_ms: 200,
            backoff_max_ms: 30_000,
        }
    }
}

/// `delay = min(base * 2^attempts, max)`, saturating so a runaway `attempts`
/// count can't overflow the shift.
pub fn compute_backoff(config: &PublisherConfig, attempts: i32) -> StdDuration {
    let shift = attempts.clamp(0, 32) as u32;
    let delay_ms = config.backoff_base_ms.saturating_mul(1u64 << shift);
    StdDuration::from_millis(delay_ms.min(config.backoff_max_ms))
}

#[derive(Debug, Clone, Default)]
pub struct PublisherStats {
    pub events_published: u64,
    pub events_failed: u64,
    pub batches_processed: u64,
    pub last_publish_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Drains `event_outbox` rows to a [`Bus`]. One `publisher_id` tags every
/// lease this instance holds, so two publisher processes running
/// concurrently never claim the same row (property 2).
pub struct Publisher {
    publisher_id: String,
    store: OutboxStore,
    bus: Arc<dyn Bus>,
    config: PublisherConfig,
    stats: Mutex<PublisherStats>,
}

impl Publisher {
    pub fn new(store: OutboxStore, bus: Arc<dyn Bus>, config: PublisherConfig) -> Self {
        Self {
            publisher_id: Uuid::new_v4().to_string(),
            store,
            bus,
            config,
            stats: Mutex::new(PublisherStats::default()),
        }
    }

    pub fn publisher_id(&self) -> &str {
        &self.publisher_id
    }

    pub async fn stats(&self) -> PublisherStats {
        self.stats.lock().await.clone()
    }

    /// Lease one batch and publish every entry, preserving per-key order
    /// within this tick by grouping leased rows by `key` and draining each
    /// group's queue before moving to the next. Multi-publisher deployments
    /// still need key-affinity from the backend to keep global per-key FIFO;
    /// this only guarantees it within a single publisher process.
    pub async fn tick(&self) -> Result<usize> {
        let entries = self
            .store
            .fetch_pending(&FetchPendingOptions {
                limit: self.config.batch_size,
                lock_token: Some(self.publisher_id.clone()),
                lease_seconds: self.config.lease_seconds,
            })
            .await?;

        if entries.is_empty() {
            let mut stats = self.stats.lock().await;
            stats.batches_processed += 1;
            return Ok(0);
        }

        let mut by_key: BTreeMap<String, Vec<OutboxEntry>> = BTreeMap::new();
        for entry in entries {
            by_key.entry(entry.key.clone()).or_default().push(entry);
        }

        let mut processed = 0usize;
        for (_key, group) in by_key {
            for entry in group {
                self.publish_one(entry).await;
                processed += 1;
            }
        }

        let mut stats = self.stats.lock().await;
        stats.batches_processed += 1;
        Ok(processed)
    }

    async fn publish_one(&self, entry: OutboxEntry) {
        match self.try_publish(&entry).await {
            Ok(()) => match self.store.mark_published(&entry.id).await {
                Ok(_) => {
                    let mut stats = self.stats.lock().await;
                    stats.events_published += 1;
                    stats.last_publish_at = Some(Utc::now());
                }
                Err(err) => {
                    tracing::error!(entry_id = %entry.id, error = %err, "mark_published failed");
                }
            },
            Err(err) => {
                let message = err.to_string();
                let backoff = compute_backoff(&self.config, entry.attempts);
                tracing::warn!(
                    entry_id = %entry.id,
                    topic = %entry.topic,
                    attempts = entry.attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %message,
                    "publish failed"
                );
                match self
                    .store
                    .mark_failed(&entry.id, &message, self.config.max_attempts)
                    .await
                {
                    Ok(_retrying) => {
                        let mut stats = self.stats.lock().await;
                        stats.events_failed += 1;
                        stats.last_error = Some(message);
                    }
                    Err(mark_err) => {
                        tracing::error!(entry_id = %entry.id, error = %mark_err, "mark_failed failed");
                    }
                }
            }
        }
    }

    async fn try_publish(&self, entry: &OutboxEntry) -> std::result::Result<(), PublishAttemptError> {
        let envelope: Envelope = serde_json::from_value(entry.envelope.clone())
            .map_err(PublishAttemptError::Malformed)?;

        let deadline = StdDuration::from_millis(self.config.soft_time_limit_ms);
        match tokio::time::timeout(deadline, self.bus.publish(&entry.topic, envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(bus_err)) => Err(PublishAttemptError::Bus(bus_err)),
            Err(_elapsed) => Err(PublishAttemptError::TimedOut),
        }
    }

    /// Process every currently-pending entry synchronously, ticking until a
    /// batch comes back empty or `timeout` elapses. For tests and graceful
    /// shutdown — callers that want "flush everything now" rather than the
    /// steady poll loop.
    pub async fn drain(&self, timeout: StdDuration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut total = 0usize;
        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            let processed = self.tick().await?;
            total += processed;
            if processed == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Run the steady poll loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = StdDuration::from_millis(self.config.poll_interval_ms);
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "publisher tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = PublisherConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..PublisherConfig::default()
        };
        assert_eq!(compute_backoff(&config, 0).as_millis(), 100);
        assert_eq!(compute_backoff(&config, 1).as_millis(), 200);
        assert_eq!(compute_backoff(&config, 2).as_millis(), 400);
        assert_eq!(compute_backoff(&config, 10).as_millis(), 1_000);
    }
}
