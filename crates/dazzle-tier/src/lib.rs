//! Tier factory: turns config/environment into a wired [`dazzle_bus::Bus`].
//!
//! An explicit override always beats auto-detection; detection otherwise
//! falls through `EVENT_BACKEND` -> `KAFKA_BOOTSTRAP_SERVERS` ->
//! `REDIS_URL` -> `DATABASE_URL` -> in-memory. A missing backend library is
//! a `BackendUnavailable` error raised here, at factory time, never a
//! surprise the first time something tries to publish.

use std::sync::Arc;

use dazzle_bus::Bus;
use dazzle_bus_adapters::{BackendUnavailable, InMemoryBus};

#[derive(Debug, thiserror::Error)]
pub enum TierError {
    #[error(transparent)]
    BackendUnavailable(#[from] BackendUnavailable),
    #[error("tier {0} is not yet implemented")]
    NotImplemented(&'static str),
    #[error("{0} not configured; set the {1} environment variable or the matching TierConfig field")]
    MissingUrl(&'static str, &'static str),
    #[error("failed to connect backend for tier {tier}: {message}")]
    Connect { tier: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, TierError>;

/// Event bus tiers in order of increasing capability/complexity, mirroring
/// the original's numbering (memory=0, sqlite=0.5, postgres=1, redis=2,
/// eventbridge=3, kafka=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTier {
    Memory,
    Sqlite,
    Postgres,
    Redis,
    EventBridge,
    Kafka,
    Auto,
}

impl EventTier {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::Redis => "redis",
            Self::EventBridge => "eventbridge",
            Self::Kafka => "kafka",
            Self::Auto => "auto",
        }
    }

    fn from_explicit(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "sqlite" => Some(Self::Sqlite),
            "postgres" => Some(Self::Postgres),
            "redis" => Some(Self::Redis),
            "kafka" => Some(Self::Kafka),
            _ => None,
        }
    }
}

/// Configuration for tier selection; `None`/default fields fall back to the
/// matching environment variable, same as `TierConfig`'s dataclass fields.
#[derive(Debug, Clone, Default)]
pub struct TierConfig {
    pub tier: Option<EventTier>,
    pub sqlite_db_path: Option<String>,
    pub postgres_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_max_stream_length: Option<usize>,
    pub kafka_bootstrap_servers: Option<String>,
    pub kafka_security_protocol: Option<String>,
    pub poll_interval_ms: Option<u64>,
}

/// Detection order: explicit `EVENT_BACKEND` env var, then
/// `KAFKA_BOOTSTRAP_SERVERS`, then `REDIS_URL`, then a `postgres`-prefixed
/// `DATABASE_URL`, else in-memory.
pub fn detect_tier() -> EventTier {
    if let Ok(explicit) = std::env::var("EVENT_BACKEND") {
        if let Some(tier) = EventTier::from_explicit(&explicit) {
            tracing::info!(tier = tier.as_str(), "using explicit tier from EVENT_BACKEND");
            return tier;
        }
    }

    if std::env::var("KAFKA_BOOTSTRAP_SERVERS").is_ok() {
        tracing::info!("auto-detected tier: kafka (KAFKA_BOOTSTRAP_SERVERS set)");
        return EventTier::Kafka;
    }

    if std::env::var("REDIS_URL").is_ok() {
        tracing::info!("auto-detected tier: redis (REDIS_URL set)");
        return EventTier::Redis;
    }

    if std::env::var("DATABASE_URL")
        .map(|url| url.starts_with("postgres"))
        .unwrap_or(false)
    {
        tracing::info!("auto-detected tier: postgres (DATABASE_URL is postgres)");
        return EventTier::Postgres;
    }

    tracing::info!("auto-detected tier: memory (no external backend configured)");
    EventTier::Memory
}

/// Construct a `Bus` for the configured (or auto-detected) tier.
pub async fn create_bus(config: &TierConfig) -> Result<Arc<dyn Bus>> {
    let tier = match config.tier {
        Some(EventTier::Auto) | None => detect_tier(),
        Some(t) => t,
    };

    match tier {
        EventTier::Memory => Ok(Arc::new(InMemoryBus::new())),
        EventTier::Sqlite => create_sqlite_bus(config).await,
        EventTier::Postgres => create_postgres_bus(config).await,
        EventTier::Redis => create_redis_bus(config).await,
        EventTier::Kafka => create_kafka_bus(config),
        EventTier::EventBridge => Err(TierError::NotImplemented("eventbridge")),
        EventTier::Auto => unreachable!("Auto resolved above"),
    }
}

#[cfg(feature = "embedded")]
async fn create_sqlite_bus(config: &TierConfig) -> Result<Arc<dyn Bus>> {
    use dazzle_bus_adapters::embedded::{EmbeddedBus, EmbeddedBusConfig};
    use sqlx::sqlite::SqlitePoolOptions;

    let db_path = config
        .sqlite_db_path
        .clone()
        .unwrap_or_else(|| "data/events.db".to_string());
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    tracing::debug!(db_path, "creating SQLite event bus (tier 0.5)");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite://{db_path}?mode=rwc"))
        .await
        .map_err(|e| TierError::Connect {
            tier: "sqlite",
            message: e.to_string(),
        })?;

    let bus = EmbeddedBus::new(pool, EmbeddedBusConfig::default())
        .await
        .map_err(|e| TierError::Connect {
            tier: "sqlite",
            message: e.to_string(),
        })?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "embedded"))]
async fn create_sqlite_bus(_config: &TierConfig) -> Result<Arc<dyn Bus>> {
    Err(BackendUnavailable {
        tier: "sqlite".into(),
        feature: "embedded".into(),
        hint: "rebuild with `--features embedded`".into(),
    }
    .into())
}

#[cfg(feature = "relational")]
async fn create_postgres_bus(config: &TierConfig) -> Result<Arc<dyn Bus>> {
    use dazzle_bus_adapters::relational::{RelationalBus, RelationalBusConfig};
    use sqlx::postgres::PgPoolOptions;

    let dsn = config
        .postgres_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or(TierError::MissingUrl("postgres_url", "DATABASE_URL"))?;

    tracing::debug!("creating PostgreSQL event bus (tier 1)");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&dsn)
        .await
        .map_err(|e| TierError::Connect {
            tier: "postgres",
            message: e.to_string(),
        })?;

    let rel_config = RelationalBusConfig {
        poll_interval: std::time::Duration::from_millis(config.poll_interval_ms.unwrap_or(500)),
    };
    let bus = RelationalBus::new(pool, rel_config).await.map_err(|e| TierError::Connect {
        tier: "postgres",
        message: e.to_string(),
    })?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "relational"))]
async fn create_postgres_bus(_config: &TierConfig) -> Result<Arc<dyn Bus>> {
    Err(BackendUnavailable {
        tier: "postgres".into(),
        feature: "relational".into(),
        hint: "rebuild with `--features relational`".into(),
    }
    .into())
}

#[cfg(feature = "streams")]
async fn create_redis_bus(config: &TierConfig) -> Result<Arc<dyn Bus>> {
    use dazzle_bus_adapters::streams::{StreamsBus, StreamsBusConfig};
    use redis::aio::ConnectionManager;

    let url = config
        .redis_url
        .clone()
        .or_else(|| std::env::var("REDIS_URL").ok())
        .ok_or(TierError::MissingUrl("redis_url", "REDIS_URL"))?;

    tracing::debug!("creating Redis Streams event bus (tier 2)");
    let client = redis::Client::open(url).map_err(|e| TierError::Connect {
        tier: "redis",
        message: e.to_string(),
    })?;
    let conn = ConnectionManager::new(client).await.map_err(|e| TierError::Connect {
        tier: "redis",
        message: e.to_string(),
    })?;

    let streams_config = StreamsBusConfig {
        max_stream_length: config.redis_max_stream_length.unwrap_or(100_000),
        ..Default::default()
    };
    Ok(Arc::new(StreamsBus::new(conn, streams_config)))
}

#[cfg(not(feature = "streams"))]
async fn create_redis_bus(_config: &TierConfig) -> Result<Arc<dyn Bus>> {
    Err(BackendUnavailable {
        tier: "redis".into(),
        feature: "streams".into(),
        hint: "rebuild with `--features streams`".into(),
    }
    .into())
}

#[cfg(feature = "partitioned-log")]
fn create_kafka_bus(config: &TierConfig) -> Result<Arc<dyn Bus>> {
    use dazzle_bus_adapters::partitioned_log::{KafkaBus, KafkaBusConfig};

    let servers = config
        .kafka_bootstrap_servers
        .clone()
        .or_else(|| std::env::var("KAFKA_BOOTSTRAP_SERVERS").ok())
        .ok_or(TierError::MissingUrl("kafka_bootstrap_servers", "KAFKA_BOOTSTRAP_SERVERS"))?;

    tracing::debug!("creating Kafka event bus (tier 4)");
    let kafka_config = KafkaBusConfig {
        bootstrap_servers: servers,
        security_protocol: config.kafka_security_protocol.clone().unwrap_or_else(|| "PLAINTEXT".into()),
    };
    let bus = KafkaBus::new(kafka_config).map_err(|e| TierError::Connect {
        tier: "kafka",
        message: e.to_string(),
    })?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "partitioned-log"))]
fn create_kafka_bus(_config: &TierConfig) -> Result<Arc<dyn Bus>> {
    Err(BackendUnavailable {
        tier: "kafka".into(),
        feature: "partitioned-log".into(),
        hint: "rebuild with `--features partitioned-log`".into(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_explicit_is_case_insensitive() {
        assert_eq!(EventTier::from_explicit("REDIS"), Some(EventTier::Redis));
        assert_eq!(EventTier::from_explicit("bogus"), None);
    }

    #[tokio::test]
    async fn default_config_with_no_env_backends_yields_memory() {
        // SAFETY: test-only env var removal, single-threaded test.
        std::env::remove_var("EVENT_BACKEND");
        std::env::remove_var("KAFKA_BOOTSTRAP_SERVERS");
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("DATABASE_URL");

        let bus = create_bus(&TierConfig::default()).await.unwrap();
        assert_eq!(bus.list_topics().await.unwrap().len(), 0);
    }

    // Combined into one test (rather than one test per rule) because every
    // case mutates the same process-global env vars; splitting them risks a
    // parallel test thread observing a partially-set environment.
    #[test]
    fn detect_tier_follows_precedence_order_then_clears() {
        std::env::remove_var("EVENT_BACKEND");
        std::env::remove_var("KAFKA_BOOTSTRAP_SERVERS");
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("DATABASE_URL");
        assert_eq!(detect_tier(), EventTier::Memory);

        std::env::set_var("DATABASE_URL", "postgres://localhost/dazzle");
        assert_eq!(detect_tier(), EventTier::Postgres);

        std::env::set_var("REDIS_URL", "redis://localhost");
        assert_eq!(detect_tier(), EventTier::Redis);

        std::env::set_var("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092");
        assert_eq!(detect_tier(), EventTier::Kafka);

        // An explicit EVENT_BACKEND always wins, even over a higher-tier
        // env var that would otherwise auto-detect.
        std::env::set_var("EVENT_BACKEND", "memory");
        assert_eq!(detect_tier(), EventTier::Memory);

        std::env::remove_var("EVENT_BACKEND");
        std::env::remove_var("KAFKA_BOOTSTRAP_SERVERS");
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("DATABASE_URL");
    }

    #[tokio::test]
    async fn unavailable_tier_reports_the_missing_feature() {
        std::env::remove_var("EVENT_BACKEND");
        std::env::remove_var("KAFKA_BOOTSTRAP_SERVERS");
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("DATABASE_URL");

        let config = TierConfig {
            tier: Some(EventTier::EventBridge),
            ..Default::default()
        };
        let err = create_bus(&config).await.unwrap_err();
        assert!(matches!(err, TierError::NotImplemented("eventbridge")));
    }
}
