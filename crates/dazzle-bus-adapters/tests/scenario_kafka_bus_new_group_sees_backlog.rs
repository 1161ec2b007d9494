//! Scenario: a brand-new consumer group starts from the earliest offset,
//! not the tail (Open Question (a)'s decision for this adapter) — so an
//! event published before a group ever subscribes is still delivered. Also
//! covers permanent-nack routing to the `<topic>.dlq` topic.
//!
//! Skips gracefully when `DAZZLE_BUS_KAFKA_BROKERS` is not set. Requires a
//! broker with `auto.create.topics.enable=true` (the default for local dev
//! clusters).

#![cfg(feature = "partitioned-log")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dazzle_bus::{Bus, Disposition, Handler, NackReason};
use dazzle_bus_adapters::partitioned_log::{KafkaBus, KafkaBusConfig};
use dazzle_schemas::Envelope;

const ENV_BROKERS: &str = "DAZZLE_BUS_KAFKA_BROKERS";

fn make_bus() -> KafkaBus {
    let bootstrap_servers = std::env::var(ENV_BROKERS).unwrap_or_else(|_| {
        panic!(
            "Kafka tests require {ENV_BROKERS}; run: {ENV_BROKERS}=localhost:9092 \
             cargo test -p dazzle-bus-adapters --features partitioned-log -- --include-ignored"
        )
    });
    KafkaBus::new(KafkaBusConfig {
        bootstrap_servers,
        security_protocol: "PLAINTEXT".to_string(),
    })
    .unwrap()
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
#[ignore = "requires DAZZLE_BUS_KAFKA_BROKERS; run: DAZZLE_BUS_KAFKA_BROKERS=localhost:9092 cargo test -p dazzle-bus-adapters --features partitioned-log -- --include-ignored"]
async fn fresh_group_sees_events_published_before_it_subscribed() -> anyhow::Result<()> {
    let bus = make_bus();
    let topic = format!("orders-{}", uuid::Uuid::new_v4());

    bus.publish(&topic, Envelope::new(&topic, "OrderCreated", "O-1", serde_json::json!({}), None)?)
        .await?;

    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe(&topic, "billing", Arc::new(CountingHandler { count: count.clone() }))
        .await?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
#[ignore = "requires DAZZLE_BUS_KAFKA_BROKERS; run: DAZZLE_BUS_KAFKA_BROKERS=localhost:9092 cargo test -p dazzle-bus-adapters --features partitioned-log -- --include-ignored"]
async fn permanent_nack_is_published_to_dlq_topic() -> anyhow::Result<()> {
    let bus = make_bus();
    let topic = format!("orders-{}", uuid::Uuid::new_v4());
    let dlq_topic = format!("{topic}.dlq");

    bus.subscribe(&topic, "billing", Arc::new(AlwaysNackHandler)).await?;
    bus.publish(&topic, Envelope::new(&topic, "OrderCreated", "O-1", serde_json::json!({}), None)?)
        .await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe(&dlq_topic, "dlq-watcher", Arc::new(CountingHandler { count: count.clone() }))
        .await?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    Ok(())
}
