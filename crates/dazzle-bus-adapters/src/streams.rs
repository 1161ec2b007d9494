//! Tier 2 — Redis Streams bus. Each `(topic, group_id)` maps onto a Redis
//! consumer group on the stream named `topic`, using `XADD`/`XREADGROUP`/
//! `XACK` directly rather than polling a SQL table — Redis already gives
//! us the per-group cursor and the pending-entries list (`XPENDING`) that
//! the relational adapter has to simulate by hand.

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
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::error;

const FIELD: &str = "envelope";
const CONSUMER_NAME: &str = "dazzle";

pub struct StreamsBusConfig {
    pub max_stream_length: usize,
    pub block_ms: usize,
}

impl Default for StreamsBusConfig {
    fn default() -> Self {
        Self {
            max_stream_length: 100_000,
            block_ms: 2_000,
        }
    }
}

struct Consumer {
    task: JoinHandle<()>,
}

pub struct StreamsBus {
    conn: ConnectionManager,
    config: StreamsBusConfig,
    consumers: Mutex<HashMap<(String, String), Consumer>>,
    dlq_key_prefix: String,
}

impl StreamsBus {
    pub fn new(conn: ConnectionManager, config: StreamsBusConfig) -> Self {
        Self {
            conn,
            config,
            consumers: Mutex::new(HashMap::new()),
            dlq_key_prefix: "dazzle.dlq.".to_string(),
        }
    }

    fn dlq_key(&self, topic: &str) -> String {
        format!("{}{}", self.dlq_key_prefix, topic)
    }

    async fn ensure_group(conn: &mut ConnectionManager, topic: &str, group_id: &str) -> redis::RedisResult<()> {
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group_id)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn poll_once(
        conn: &mut ConnectionManager,
        topic: &str,
        group_id: &str,
        handler: &Arc<dyn Handler>,
        block_ms: usize,
        dlq_key: &str,
    ) {
        let reply: redis::RedisResult<
            Vec<(String, Vec<(String, Vec<(String, String)>)>)>,
        > = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group_id)
            .arg(CONSUMER_NAME)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(topic)
            .arg(">")
            .query_async(conn)
            .await;

        let streams = match reply {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "XREADGROUP failed");
                return;
            }
        };

        for (_stream, entries) in streams {
            for (entry_id, fields) in entries {
                let Some((_, payload)) = fields.into_iter().find(|(k, _)| k == FIELD) else {
                    continue;
                };
                let envelope: Envelope = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        error!(error = %e, "malformed stream entry, acking to skip");
                        let _: redis::RedisResult<()> =
                            conn.xack(topic, group_id, &[entry_id.clone()]).await;
                        continue;
                    }
                };

                match handler.handle(&envelope).await {
                    Disposition::Ack => {
                        let _: redis::RedisResult<()> = conn.xack(topic, group_id, &[entry_id]).await;
                    }
                    Disposition::Nack(reason) if reason.retryable => {
                        // Leave unacked; it stays in the group's pending
                        // entries list for a future XCLAIM/redelivery.
                    }
                    Disposition::Nack(_reason) => {
                        let _: redis::RedisResult<()> = conn.rpush(dlq_key, &payload).await;
                        let _: redis::RedisResult<()> = conn.xack(topic, group_id, &[entry_id]).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Bus for StreamsBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<()> {
        let payload = serde_json::to_string(&envelope).map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_stream_length)
            .arg("*")
            .arg(FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Publish {
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
        let mut conn = self.conn.clone();
        Self::ensure_group(&mut conn, topic, group_id)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        let block_ms = self.config.block_ms;
        let dlq_key = self.dlq_key(topic);
        let topic_owned = topic.to_string();
        let group_owned = group_id.to_string();
        let mut loop_conn = self.conn.clone();
        let task = tokio::spawn(async move {
            loop {
                Self::poll_once(&mut loop_conn, &topic_owned, &group_owned, &handler, block_ms, &dlq_key).await;
            }
        });

        let mut consumers = self.consumers.lock().await;
        if let Some(old) = consumers.insert((topic.to_string(), group_id.to_string()), Consumer { task }) {
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
        let mut conn = self.conn.clone();
        let _: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(topic)
            .arg(group_id)
            .query_async(&mut conn)
            .await;
        Ok(())
    }

    async fn ack(&self, topic: &str, group_id: &str, event_id: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();
        conn.xack(topic, group_id, &[event_id])
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    async fn nack(
        &self,
        _topic: &str,
        _group_id: &str,
        _event_id: &str,
        _reason: NackReason,
    ) -> BusResult<()> {
        // Handled inline by the poll loop (leaves the entry pending, or
        // DLQs and acks it); an out-of-band nack call is a no-op here.
        Ok(())
    }

    async fn replay(&self, topic: &str, filter: ReplayFilter) -> BusResult<Vec<Envelope>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, Vec<(String, String)>)> = conn
            .xrange_all(topic)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        let mut out = Vec::new();
        for (_id, fields) in entries {
            let Some((_, payload)) = fields.into_iter().find(|(k, _)| k == FIELD) else {
                continue;
            };
            let envelope: Envelope = serde_json::from_str(&payload).map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
            if let Some(from_ts) = filter.from_ts {
                if envelope.timestamp < from_ts {
                    continue;
                }
            }
            if let Some(to_ts) = filter.to_ts {
                if envelope.timestamp > to_ts {
                    continue;
                }
            }
            if let Some(key) = &filter.key_filter {
                if &envelope.key != key {
                    continue;
                }
            }
            out.push(envelope);
        }
        Ok(out)
    }

    async fn get_consumer_status(&self, topic: &str, group_id: &str) -> BusResult<ConsumerStatus> {
        let mut conn = self.conn.clone();
        // XPENDING summary form replies with [count, min_id, max_id, consumers];
        // we only need the leading count.
        let summary: redis::RedisResult<(i64, Option<String>, Option<String>, Option<Vec<(String, String)>>)> =
            redis::cmd("XPENDING")
                .arg(topic)
                .arg(group_id)
                .query_async(&mut conn)
                .await;
        let pending_events = summary.map(|(count, ..)| count).unwrap_or(0);

        Ok(ConsumerStatus {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            last_offset: 0,
            pending_events,
            nacked_events: 0,
            last_processed_at: Some(Utc::now()),
        })
    }

    async fn list_topics(&self) -> BusResult<Vec<String>> {
        Err(BusError::Publish {
            topic: String::new(),
            message: "Redis Streams adapter does not support listing all topics; track them at the application layer".into(),
        })
    }

    async fn list_consumer_groups(&self, topic: &str) -> BusResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let groups: Vec<HashMap<String, redis::Value>> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(topic)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(groups
            .into_iter()
            .filter_map(|g| match g.get("name") {
                Some(redis::Value::BulkString(bytes)) => String::from_utf8(bytes.clone()).ok(),
                _ => None,
            })
            .collect())
    }

    async fn get_topic_info(&self, topic: &str) -> BusResult<TopicInfo> {
        let groups = self.list_consumer_groups(topic).await.unwrap_or_default();
        let mut conn = self.conn.clone();
        let dlq_depth: i64 = conn.llen(self.dlq_key(topic)).await.unwrap_or(0);
        Ok(TopicInfo {
            topic: topic.to_string(),
            consumer_groups: groups,
            dlq_depth,
        })
    }
}

impl Drop for StreamsBus {
    fn drop(&mut self) {
        if let Ok(consumers) = self.consumers.try_lock() {
            for consumer in consumers.values() {
                consumer.task.abort();
            }
        }
    }
}
