//! Durable outbox store: append-in-transaction, lease-based fetch, mark
//! published/failed, cleanup/stats/retry accounting.
//!
//! Claim/lease protocol built on `FOR UPDATE SKIP LOCKED`: rows move
//! `pending -> publishing -> {published|failed}` with an explicit
//! `lock_token`/`lock_expires_at` lease that expires on its own rather than
//! living until released, so a crashed publisher's claims reclaim
//! themselves instead of sitting locked forever.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use dazzle_schemas::Envelope;

pub const ENV_DB_URL: &str = "DAZZLE_DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox append failed: {0}")]
    Append(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, OutboxError>;

/// Connect to Postgres using `DAZZLE_DATABASE_URL`.
pub async fn connect_from_env() -> anyhow::Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| anyhow::anyhow!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await?;
    Ok(pool)
}

/// Test helper: connect via `DAZZLE_DATABASE_URL` and ensure migrations ran.
pub async fn testkit_db_pool() -> anyhow::Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "publishing" => Self::Publishing,
            "published" => Self::Published,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxEntry {
    pub id: String,
    pub topic: String,
    pub event_type: String,
    pub key: String,
    pub envelope: Value,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub lock_token: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    fn from_row(row: sqlx::postgres::PgRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            event_type: row.try_get("event_type")?,
            key: row.try_get("key")?,
            envelope: row.try_get("envelope")?,
            status: OutboxStatus::parse(&status),
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            lock_token: row.try_get("lock_token")?,
            lock_expires_at: row.try_get("lock_expires_at")?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, topic, event_type, key, envelope, status, created_at, \
    published_at, attempts, last_error, lock_token, lock_expires_at";

#[derive(Debug, Clone, Default)]
pub struct OutboxStats {
    pub pending: i64,
    pub publishing: i64,
    pub published: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FetchPendingOptions {
    pub limit: i64,
    pub lock_token: Option<String>,
    pub lease_seconds: i64,
}

/// Durable staging table for events awaiting publication.
#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
}

impl OutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, exposed so callers can open the business
    /// transaction that `append` is meant to be called within.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a `pending` row in the caller's open transaction. Visible to a
    /// publisher only once that transaction commits — `fetch_pending` reads
    /// through the same `event_outbox` table, so a rolled-back transaction
    /// leaves no row behind (property 1, outbox atomicity).
    pub async fn append(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        envelope: &Envelope,
    ) -> Result<OutboxEntry> {
        let id = envelope.event_id.to_string();
        let envelope_json =
            serde_json::to_value(envelope).expect("envelope serialization must not fail");

        let row = sqlx::query(&format!(
            "insert into event_outbox (id, topic, event_type, key, envelope, status) \
             values ($1, $2, $3, $4, $5, 'pending') \
             returning {SELECT_COLUMNS}"
        ))
        .bind(&id)
        .bind(&envelope.topic)
        .bind(&envelope.event_type)
        .bind(&envelope.key)
        .bind(&envelope_json)
        .fetch_one(&mut **txn)
        .await
        .map_err(OutboxError::Append)?;

        OutboxEntry::from_row(row).map_err(OutboxError::from)
    }

    /// Atomically lease up to `limit` rows whose lease is unset or expired,
    /// in `created_at` ascending order. Uses `FOR UPDATE SKIP LOCKED` so two
    /// concurrent publishers never lease the same row (property 2).
    pub async fn fetch_pending(&self, opts: &FetchPendingOptions) -> Result<Vec<OutboxEntry>> {
        let lock_token = opts
            .lock_token
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let lease_expires_at = Utc::now() + ChronoDuration::seconds(opts.lease_seconds.max(1));

        let rows = sqlx::query(&format!(
            "with to_claim as ( \
                select id from event_outbox \
                where status = 'pending' \
                   or (status = 'publishing' and lock_expires_at < now()) \
                order by created_at asc \
                limit $1 \
                for update skip locked \
            ) \
            update event_outbox \
               set status = 'publishing', \
                   lock_token = $2, \
                   lock_expires_at = $3 \
             where id in (select id from to_claim) \
            returning {SELECT_COLUMNS}"
        ))
        .bind(opts.limit)
        .bind(&lock_token)
        .bind(lease_expires_at)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(OutboxEntry::from_row)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(OutboxError::from)
    }

    /// Transition a `publishing` row to the terminal `published` state.
    pub async fn mark_published(&self, id: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "update event_outbox \
               set status = 'published', published_at = now() \
             where id = $1 and status = 'publishing' \
             returning id",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Record a failed publish attempt. Increments `attempts`; when the new
    /// count reaches `max_attempts` the row becomes terminal `failed` and is
    /// no longer leased, otherwise it is returned to `pending` for re-lease.
    /// Returns `true` if the entry will be retried, `false` if it is now
    /// terminally `failed`.
    pub async fn mark_failed(&self, id: &str, error: &str, max_attempts: i32) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "update event_outbox \
               set attempts = attempts + 1, last_error = $2 \
             where id = $1 \
             returning attempts",
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        let Some((attempts,)) = row else {
            return Ok(false);
        };

        if attempts >= max_attempts {
            sqlx::query(
                "update event_outbox set status = 'failed', lock_token = null, \
                 lock_expires_at = null where id = $1",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(false)
        } else {
            sqlx::query(
                "update event_outbox set status = 'pending', lock_token = null, \
                 lock_expires_at = null where id = $1",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(true)
        }
    }

    pub async fn get_stats(&self) -> Result<OutboxStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "select status, count(*)::bigint from event_outbox group by status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OutboxStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => stats.pending = count,
                "publishing" => stats.publishing = count,
                "published" => stats.published = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Delete `published` rows older than `older_than`, so a long-running
    /// deployment doesn't accumulate an unbounded published-events history.
    pub async fn cleanup_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "delete from event_outbox where status = 'published' and published_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_failed_entries(&self) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "select {SELECT_COLUMNS} from event_outbox where status = 'failed' \
             order by created_at asc"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(OutboxEntry::from_row)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(OutboxError::from)
    }

    pub async fn get_recent_entries(&self, limit: i64) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "select {SELECT_COLUMNS} from event_outbox order by created_at desc limit $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(OutboxEntry::from_row)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(OutboxError::from)
    }

    /// Reset a `failed` row back to `pending` with `attempts` cleared, so the
    /// publisher re-leases it on its next tick.
    pub async fn retry_failed(&self, id: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "update event_outbox \
               set status = 'pending', attempts = 0, last_error = null, \
                   lock_token = null, lock_expires_at = null \
             where id = $1 and status = 'failed' \
             returning id",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
