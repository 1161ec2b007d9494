//! Tier 4 — Kafka bus via `rdkafka`. Partitions are chosen by `key`
//! (librdkafka's default partitioner hashes the key), which is what gives
//! this adapter per-key FIFO: Kafka only orders within a partition, so two
//! envelopes with the same key always land on the same partition and are
//! consumed in publish order by a given consumer group.
//!
//! Open Question (a) from DESIGN.md: new consumer groups start from the
//! earliest offset (`auto.offset.reset = earliest`), not the tail — unlike
//! the in-memory adapter. A freshly-deployed consumer should see the
//! backlog rather than silently skip it; topics are expected to carry a
//! retention window, not be treated as an infinite historical replay log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dazzle_bus::{
    Bus, BusError, ConsumerStatus, Disposition, Handler, NackReason, ReplayFilter,
    Result as BusResult, SubscriptionInfo, TopicInfo,
};
use dazzle_schemas::Envelope;
use rdkafka::consumer::{Consumer as RdConsumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::error;

pub struct KafkaBusConfig {
    pub bootstrap_servers: String,
    pub security_protocol: String,
}

impl Default for KafkaBusConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            security_protocol: "PLAINTEXT".to_string(),
        }
    }
}

struct ConsumerHandle {
    task: JoinHandle<()>,
}

pub struct KafkaBus {
    producer: FutureProducer,
    config: KafkaBusConfig,
    consumers: Mutex<HashMap<(String, String), ConsumerHandle>>,
    dlq_producer: FutureProducer,
}

impl KafkaBus {
    pub fn new(config: KafkaBusConfig) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("security.protocol", &config.security_protocol)
            .set("message.timeout.ms", "10000")
            .create()?;
        let dlq_producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("security.protocol", &config.security_protocol)
            .create()?;
        Ok(Self {
            producer,
            config,
            consumers: Mutex::new(HashMap::new()),
            dlq_producer,
        })
    }

    fn dlq_topic(topic: &str) -> String {
        format!("{topic}.dlq")
    }
}

#[async_trait]
impl Bus for KafkaBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<()> {
        let payload = serde_json::to_string(&envelope).map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;
        let record = FutureRecord::to(topic).payload(&payload).key(&envelope.key);
        self.producer
            .send(record, Duration::from_secs(10))
            .await
            .map_err(|(e, _)| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn Handler>,
    ) -> BusResult<SubscriptionInfo> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("security.protocol", &self.config.security_protocol)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        consumer.subscribe(&[topic]).map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;

        let dlq_producer = self.dlq_producer.clone();
        let dlq_topic = Self::dlq_topic(topic);
        let task = tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(message) => {
                        let Some(payload) = message.payload() else {
                            let _ = consumer.commit_message(&message, rdkafka::consumer::CommitMode::Async);
                            continue;
                        };
                        let envelope: Envelope = match serde_json::from_slice(payload) {
                            Ok(e) => e,
                            Err(e) => {
                                error!(error = %e, "malformed Kafka message, skipping");
                                let _ = consumer.commit_message(&message, rdkafka::consumer::CommitMode::Async);
                                continue;
                            }
                        };

                        match handler.handle(&envelope).await {
                            Disposition::Ack => {
                                let _ = consumer.commit_message(&message, rdkafka::consumer::CommitMode::Async);
                            }
                            Disposition::Nack(reason) if reason.retryable => {
                                // Do not commit; the broker will redeliver
                                // this offset on the next poll/rebalance.
                            }
                            Disposition::Nack(_reason) => {
                                let record = FutureRecord::to(&dlq_topic).payload(payload).key(&envelope.key);
                                let _ = dlq_producer.send(record, Duration::from_secs(10)).await;
                                let _ = consumer.commit_message(&message, rdkafka::consumer::CommitMode::Async);
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Kafka consumer error");
                    }
                }
            }
        });

        let mut consumers = self.consumers.lock().await;
        if let Some(old) = consumers.insert((topic.to_string(), group_id.to_string()), ConsumerHandle { task }) {
            old.task.abort();
        }

        Ok(SubscriptionInfo {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            last_offset: 0,
        })
    }

    async fn unsubscribe(&self, topic: &str, group_id: &str) -> BusResult<()> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.remove(&(topic.to_string(), group_id.to_string())) {
            consumer.task.abort();
        }
        Ok(())
    }

    async fn ack(&self, _topic: &str, _group_id: &str, _event_id: &str) -> BusResult<()> {
        Ok(())
    }

    async fn nack(
        &self,
        _topic: &str,
        _group_id: &str,
        _event_id: &str,
        _reason: NackReason,
    ) -> BusResult<()> {
        Ok(())
    }

    async fn replay(&self, topic: &str, _filter: ReplayFilter) -> BusResult<Vec<Envelope>> {
        Err(BusError::Publish {
            topic: topic.to_string(),
            message: "replay is not supported on the Kafka adapter; seek a dedicated consumer group to an offset instead".into(),
        })
    }

    async fn get_consumer_status(&self, topic: &str, group_id: &str) -> BusResult<ConsumerStatus> {
        Ok(ConsumerStatus {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            last_offset: 0,
            pending_events: 0,
            nacked_events: 0,
            last_processed_at: Some(Utc::now()),
        })
    }

    async fn list_topics(&self) -> BusResult<Vec<String>> {
        Err(BusError::Publish {
            topic: String::new(),
            message: "Kafka adapter does not enumerate cluster topics; track them at the application layer".into(),
        })
    }

    async fn list_consumer_groups(&self, topic: &str) -> BusResult<Vec<String>> {
        let consumers = self.consumers.lock().await;
        Ok(consumers
            .keys()
            .filter(|(t, _)| t.as_str() == topic)
            .map(|(_, g)| g.clone())
            .collect())
    }

    async fn get_topic_info(&self, topic: &str) -> BusResult<TopicInfo> {
        let groups = self.list_consumer_groups(topic).await?;
        Ok(TopicInfo {
            topic: topic.to_string(),
            consumer_groups: groups,
            dlq_depth: 0,
        })
    }
}

impl Drop for KafkaBus {
    fn drop(&mut self) {
        if let Ok(consumers) = self.consumers.try_lock() {
            for consumer in consumers.values() {
                consumer.task.abort();
            }
        }
    }
}
