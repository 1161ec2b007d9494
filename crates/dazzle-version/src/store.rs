//! Postgres persistence for DSL versions and migrations.
//!
//! The "at most one active version" invariant (property 9) is enforced
//! twice: at the schema level (`idx_dsl_versions_single_active`, a unique
//! partial index) and at the call level (`deploy_version` demotes the
//! previous active row in the same transaction) so a bug in one layer
//! can't silently violate it.

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

pub const ENV_DB_URL: &str = "DAZZLE_VERSION_DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("version {0} already deployed")]
    DuplicateVersionId(String),
    #[error("version {0} not found")]
    VersionNotFound(String),
    #[error("migration {0} not found")]
    MigrationNotFound(String),
    #[error("migration {id} cannot complete: {runs_remaining} runs still tagged {from_version}")]
    MigrationInFlight {
        id: String,
        runs_remaining: i64,
        from_version: String,
    },
}

pub type Result<T> = std::result::Result<T, VersionError>;

pub async fn connect_from_env() -> anyhow::Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).map_err(|_| anyhow::anyhow!("missing env var {ENV_DB_URL}"))?;
    Ok(PgPoolOptions::new().max_connections(5).connect(&url).await?)
}

pub async fn testkit_db_pool() -> anyhow::Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    Active,
    Draining,
    Archived,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "draining" => Self::Draining,
            "archived" => Self::Archived,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DslVersion {
    pub version_id: String,
    pub dsl_hash: String,
    pub status: VersionStatus,
    pub manifest: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    InProgress,
    Completed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "rolled_back" => Self::RolledBack,
            _ => Self::InProgress,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VersionMigration {
    pub id: String,
    pub from_version: String,
    pub to_version: String,
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct VersionStore {
    pool: PgPool,
}

impl VersionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new `active` version, demoting the previous active row to
    /// `draining` in the same transaction. A duplicate `version_id` is an
    /// error, not an upsert.
    pub async fn deploy_version(
        &self,
        version_id: &str,
        dsl_hash: &str,
        manifest: serde_json::Value,
    ) -> Result<DslVersion> {
        let exists: Option<(String,)> =
            sqlx::query_as("select version_id from dsl_versions where version_id = $1")
                .bind(version_id)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_some() {
            return Err(VersionError::DuplicateVersionId(version_id.to_string()));
        }

        let mut txn = self.pool.begin().await?;

        sqlx::query("update dsl_versions set status = 'draining' where status = 'active'")
            .execute(&mut *txn)
            .await?;

        let row = sqlx::query(
            "insert into dsl_versions (version_id, dsl_hash, status, manifest) \
             values ($1, $2, 'active', $3) \
             returning version_id, dsl_hash, status, manifest, created_at",
        )
        .bind(version_id)
        .bind(dsl_hash)
        .bind(&manifest)
        .fetch_one(&mut *txn)
        .await?;

        txn.commit().await?;
        Self::version_from_row(row)
    }

    pub async fn get_version(&self, version_id: &str) -> Result<DslVersion> {
        let row = sqlx::query(
            "select version_id, dsl_hash, status, manifest, created_at from dsl_versions \
             where version_id = $1",
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| VersionError::VersionNotFound(version_id.to_string()))?;
        Self::version_from_row(row)
    }

    pub async fn get_active_version(&self) -> Result<Option<DslVersion>> {
        let row = sqlx::query(
            "select version_id, dsl_hash, status, manifest, created_at from dsl_versions \
             where status = 'active'",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::version_from_row).transpose()
    }

    fn version_from_row(row: sqlx::postgres::PgRow) -> Result<DslVersion> {
        let status: String = row.try_get("status")?;
        Ok(DslVersion {
            version_id: row.try_get("version_id")?,
            dsl_hash: row.try_get("dsl_hash")?,
            status: VersionStatus::parse(&status),
            manifest: row.try_get("manifest")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Mark `from` draining and open an `in_progress` migration row. The
    /// caller (the drain watcher or an admin handler) separately computes
    /// `runs_remaining` against the process store, since that table lives
    /// in a different crate's schema.
    pub async fn start_migration(&self, from: &str, to: &str) -> Result<VersionMigration> {
        let mut txn = self.pool.begin().await?;

        sqlx::query("update dsl_versions set status = 'draining' where version_id = $1")
            .bind(from)
            .execute(&mut *txn)
            .await?;

        let id = uuid::Uuid::new_v4().to_string();
        let row = sqlx::query(
            "insert into version_migrations (id, from_version, to_version, status) \
             values ($1, $2, $3, 'in_progress') \
             returning id, from_version, to_version, status, started_at, completed_at",
        )
        .bind(&id)
        .bind(from)
        .bind(to)
        .fetch_one(&mut *txn)
        .await?;

        txn.commit().await?;
        Self::migration_from_row(row)
    }

    pub async fn get_migration(&self, id: &str) -> Result<VersionMigration> {
        let row = sqlx::query(
            "select id, from_version, to_version, status, started_at, completed_at \
             from version_migrations where id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| VersionError::MigrationNotFound(id.to_string()))?;
        Self::migration_from_row(row)
    }

    /// Completes the migration iff it is still `in_progress` AND
    /// `runs_remaining == 0`. The `where status = 'in_progress'` predicate
    /// makes the update a no-op for a second concurrent caller, so two
    /// operators (or an operator racing the drain watcher) never
    /// double-complete the same migration.
    pub async fn complete_migration(&self, id: &str, runs_remaining: i64) -> Result<()> {
        if runs_remaining > 0 {
            let migration = self.get_migration(id).await?;
            return Err(VersionError::MigrationInFlight {
                id: id.to_string(),
                runs_remaining,
                from_version: migration.from_version,
            });
        }

        let mut txn = self.pool.begin().await?;
        let row: Option<(String, String)> = sqlx::query_as(
            "update version_migrations set status = 'completed', completed_at = now() \
             where id = $1 and status = 'in_progress' \
             returning from_version, to_version",
        )
        .bind(id)
        .fetch_optional(&mut *txn)
        .await?;

        if let Some((from_version, _to_version)) = row {
            sqlx::query("update dsl_versions set status = 'archived' where version_id = $1")
                .bind(&from_version)
                .execute(&mut *txn)
                .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    /// Restores `from` to active, archives `to`, marks the migration
    /// `rolled_back`. Same `in_progress`-gated update to avoid racing a
    /// concurrent `complete_migration`.
    pub async fn rollback_migration(&self, id: &str) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        let row: Option<(String, String)> = sqlx::query_as(
            "update version_migrations set status = 'rolled_back', completed_at = now() \
             where id = $1 and status = 'in_progress' \
             returning from_version, to_version",
        )
        .bind(id)
        .fetch_optional(&mut *txn)
        .await?;

        if let Some((from_version, to_version)) = row {
            sqlx::query("update dsl_versions set status = 'active' where version_id = $1")
                .bind(&from_version)
                .execute(&mut *txn)
                .await?;
            sqlx::query("update dsl_versions set status = 'archived' where version_id = $1")
                .bind(&to_version)
                .execute(&mut *txn)
                .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    pub async fn list_in_progress_migrations(&self) -> Result<Vec<VersionMigration>> {
        let rows = sqlx::query(
            "select id, from_version, to_version, status, started_at, completed_at \
             from version_migrations where status = 'in_progress' order by started_at asc",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::migration_from_row).collect()
    }

    fn migration_from_row(row: sqlx::postgres::PgRow) -> Result<VersionMigration> {
        let status: String = row.try_get("status")?;
        Ok(VersionMigration {
            id: row.try_get("id")?,
            from_version: row.try_get("from_version")?,
            to_version: row.try_get("to_version")?,
            status: MigrationStatus::parse(&status),
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}
