//! Scenario: a permanent nack routes to the topic's Redis-list DLQ, and two
//! independent consumer groups on the same stream each receive their own
//! copy of an event (fan-out, not work-queue sharing).
//!
//! Skips gracefully when `DAZZLE_BUS_REDIS_URL` is not set.

#![cfg(feature = "streams")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dazzle_bus::{Bus, Disposition, Handler, NackReason};
use dazzle_bus_adapters::streams::{StreamsBus, StreamsBusConfig};
use dazzle_schemas::Envelope;

const ENV_REDIS_URL: &str = "DAZZLE_BUS_REDIS_URL";

async fn make_bus() -> StreamsBus {
    let url = std::env::var(ENV_REDIS_URL).unwrap_or_else(|_| {
        panic!(
            "Redis tests require {ENV_REDIS_URL}; run: {ENV_REDIS_URL}=redis://127.0.0.1:6379 \
             cargo test -p dazzle-bus-adapters --features streams -- --include-ignored"
        )
    });
    let client = redis::Client::open(url).unwrap();
    let conn = client.get_connection_manager().await.unwrap();
    StreamsBus::new(
        conn,
        StreamsBusConfig {
            max_stream_length: 1_000,
            block_ms: 200,
        },
    )
}

struct CountingHandler {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for CountingHandler {
    async fn handle(&self, _envelope: &Envelope) -> Disposition {
        self.count.fetch_add(1, Ordering::SeqCst);
        Disposition::Ack
    }
}

struct AlwaysNackHandler;

#[async_trait]
impl Handler for AlwaysNackHandler {
    async fn handle(&self, _envelope: &Envelope) -> Disposition {
        Disposition::Nack(NackReason::permanent("boom", "always fails"))
    }
}

#[tokio::test]
#[ignore = "requires DAZZLE_BUS_REDIS_URL; run: DAZZLE_BUS_REDIS_URL=redis://127.0.0.1:6379 cargo test -p dazzle-bus-adapters --features streams -- --include-ignored"]
async fn two_groups_each_receive_their_own_copy() -> anyhow::Result<()> {
    let bus = make_bus().await;
    let topic = format!("orders-{}", uuid::Uuid::new_v4());

    let count_a = Arc::new(AtomicUsize::new(0));
    let count_b = Arc::new(AtomicUsize::new(0));
    bus.subscribe(&topic, "billing", Arc::new(CountingHandler { count: count_a.clone() }))
        .await?;
    bus.subscribe(&topic, "shipping", Arc::new(CountingHandler { count: count_b.clone() }))
        .await?;

    bus.publish(&topic, Envelope::new(&topic, "OrderCreated", "O-1", serde_json::json!({}), None)?)
        .await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(count_a.load(Ordering::SeqCst), 1);
    assert_eq!(count_b.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
#[ignore = "requires DAZZLE_BUS_REDIS_URL; run: DAZZLE_BUS_REDIS_URL=redis://127.0.0.1:6379 cargo test -p dazzle-bus-adapters --features streams -- --include-ignored"]
async fn permanent_nack_lands_in_dlq() -> anyhow::Result<()> {
    let bus = make_bus().await;
    let topic = format!("orders-{}", uuid::Uuid::new_v4());

    bus.subscribe(&topic, "billing", Arc::new(AlwaysNackHandler)).await?;
    bus.publish(&topic, Envelope::new(&topic, "OrderCreated", "O-1", serde_json::json!({}), None)?)
        .await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let info = bus.get_topic_info(&topic).await?;
    assert_eq!(info.dlq_depth, 1);

    Ok(())
}
