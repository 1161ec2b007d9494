//! Postgres persistence for process specs, runs, and tasks.

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::run::{ProcessRun, RunStatus};
use crate::spec::{ProcessSpec, Trigger};
use crate::task::{ProcessTask, TaskStatus};

pub const ENV_DB_URL: &str = "DAZZLE_PROCESS_DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("process spec {0} not found")]
    SpecNotFound(String),
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("duplicate idempotency key for process {process_name}: {key}")]
    DuplicateIdempotencyKey { process_name: String, key: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub async fn connect_from_env() -> anyhow::Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).map_err(|_| anyhow::anyhow!("missing env var {ENV_DB_URL}"))?;
    Ok(PgPoolOptions::new().max_connections(10).connect(&url).await?)
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

#[derive(Clone)]
pub struct ProcessStore {
    pool: PgPool,
}

impl ProcessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn put_spec(&self, spec: &ProcessSpec) -> Result<()> {
        let cron = match &spec.trigger {
            Trigger::Schedule { cron } => Some(cron.clone()),
            _ => None,
        };
        sqlx::query(
            "insert into process_specs (name, trigger, steps, schedule_cron) \
             values ($1, $2, $3, $4) \
             on conflict (name) do update set trigger = excluded.trigger, steps = excluded.steps, \
                 schedule_cron = excluded.schedule_cron",
        )
        .bind(&spec.name)
        .bind(serde_json::to_value(&spec.trigger).expect("trigger serializes"))
        .bind(serde_json::to_value(&spec.steps).expect("steps serialize"))
        .bind(cron)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_spec(&self, name: &str) -> Result<ProcessSpec> {
        let row = sqlx::query("select name, trigger, steps from process_specs where name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::SpecNotFound(name.to_string()))?;

        let trigger: serde_json::Value = row.try_get("trigger")?;
        let steps: serde_json::Value = row.try_get("steps")?;
        Ok(ProcessSpec {
            name: row.try_get("name")?,
            trigger: serde_json::from_value(trigger).expect("stored trigger is well-formed"),
            steps: serde_json::from_value(steps).expect("stored steps are well-formed"),
        })
    }

    /// Every registered spec. The bridge filters these in memory by trigger
    /// kind rather than via a bespoke query — the deployment-scale spec
    /// count makes that the simpler, equally correct choice.
    pub async fn list_specs(&self) -> Result<Vec<ProcessSpec>> {
        let rows = sqlx::query("select name, trigger, steps from process_specs")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let trigger: serde_json::Value = row.try_get("trigger")?;
                let steps: serde_json::Value = row.try_get("steps")?;
                Ok(ProcessSpec {
                    name: row.try_get("name")?,
                    trigger: serde_json::from_value(trigger).expect("stored trigger is well-formed"),
                    steps: serde_json::from_value(steps).expect("stored steps are well-formed"),
                })
            })
            .collect()
    }

    pub async fn record_schedule_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("update process_specs set schedule_last_run = $2 where name = $1")
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create a new `pending` run. `idempotency_key`, when set, deduplicates
    /// `start_process` calls for the same process name (§3 invariant).
    pub async fn create_run(
        &self,
        process_name: &str,
        inputs: serde_json::Value,
        deployed_version_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Result<ProcessRun> {
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self
                .find_run_by_idempotency_key(process_name, key)
                .await?
            {
                return Ok(existing);
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let row = sqlx::query(
            "insert into process_runs \
                 (run_id, process_name, status, current_step, inputs, context, \
                  deployed_version_id, idempotency_key) \
             values ($1, $2, 'pending', 0, $3, '{}'::jsonb, $4, $5) \
             returning run_id, process_name, status, current_step, inputs, context, outputs, \
                 error, deployed_version_id, idempotency_key, created_at, updated_at, completed_at",
        )
        .bind(&run_id)
        .bind(process_name)
        .bind(&inputs)
        .bind(&deployed_version_id)
        .bind(&idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        Self::run_from_row(row)
    }

    async fn find_run_by_idempotency_key(
        &self,
        process_name: &str,
        key: &str,
    ) -> Result<Option<ProcessRun>> {
        let row = sqlx::query(
            "select run_id, process_name, status, current_step, inputs, context, outputs, \
                 error, deployed_version_id, idempotency_key, created_at, updated_at, completed_at \
             from process_runs where process_name = $1 and idempotency_key = $2",
        )
        .bind(process_name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::run_from_row).transpose()
    }

    pub async fn get_run(&self, run_id: &str) -> Result<ProcessRun> {
        let row = sqlx::query(
            "select run_id, process_name, status, current_step, inputs, context, outputs, \
                 error, deployed_version_id, idempotency_key, created_at, updated_at, completed_at \
             from process_runs where run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        Self::run_from_row(row)
    }

    /// Persist a run in full. The orchestrator holds a `ProcessRun`, mutates
    /// it via its state-machine methods, and calls this to flush at each
    /// step boundary — matching §5's "committed in small transactions
    /// around each step boundary".
    pub async fn save_run(&self, run: &ProcessRun) -> Result<()> {
        sqlx::query(
            "update process_runs set status = $2, current_step = $3, inputs = $4, \
                 context = $5, outputs = $6, error = $7, updated_at = $8, completed_at = $9 \
             where run_id = $1",
        )
        .bind(&run.run_id)
        .bind(run.status.as_str())
        .bind(run.current_step)
        .bind(&run.inputs)
        .bind(&run.context)
        .bind(&run.outputs)
        .bind(&run.error)
        .bind(run.updated_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<ProcessRun>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "select run_id, process_name, status, current_step, inputs, context, outputs, \
                         error, deployed_version_id, idempotency_key, created_at, updated_at, completed_at \
                     from process_runs where status = $1 order by created_at asc",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "select run_id, process_name, status, current_step, inputs, context, outputs, \
                         error, deployed_version_id, idempotency_key, created_at, updated_at, completed_at \
                     from process_runs order by created_at asc",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(Self::run_from_row).collect()
    }

    pub async fn count_runs_for_version(&self, version_id: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "select count(*)::bigint from process_runs \
             where deployed_version_id = $1 and status not in ('completed', 'failed', 'cancelled')",
        )
        .bind(version_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    fn run_from_row(row: sqlx::postgres::PgRow) -> Result<ProcessRun> {
        let status: String = row.try_get("status")?;
        Ok(ProcessRun {
            run_id: row.try_get("run_id")?,
            process_name: row.try_get("process_name")?,
            status: RunStatus::parse(&status),
            current_step: row.try_get("current_step")?,
            inputs: row.try_get("inputs")?,
            context: row.try_get("context")?,
            outputs: row.try_get("outputs")?,
            error: row.try_get("error")?,
            deployed_version_id: row.try_get("deployed_version_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    pub async fn create_task(
        &self,
        run_id: &str,
        step_name: &str,
        surface_name: &str,
        entity_name: Option<String>,
        entity_id: Option<String>,
        assignee_id: Option<String>,
        assignee_role: Option<String>,
        due_at: DateTime<Utc>,
    ) -> Result<ProcessTask> {
        let task_id = Uuid::new_v4().to_string();
        let row = sqlx::query(
            "insert into process_tasks \
                 (task_id, run_id, step_name, surface_name, entity_name, entity_id, \
                  assignee_id, assignee_role, status, due_at) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9) \
             returning task_id, run_id, step_name, surface_name, entity_name, entity_id, \
                 assignee_id, assignee_role, status, outcome, outcome_data, due_at, \
                 escalated_at, completed_at, created_at",
        )
        .bind(&task_id)
        .bind(run_id)
        .bind(step_name)
        .bind(surface_name)
        .bind(&entity_name)
        .bind(&entity_id)
        .bind(&assignee_id)
        .bind(&assignee_role)
        .bind(due_at)
        .fetch_one(&self.pool)
        .await?;
        Self::task_from_row(row)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<ProcessTask> {
        let row = sqlx::query(
            "select task_id, run_id, step_name, surface_name, entity_name, entity_id, \
                 assignee_id, assignee_role, status, outcome, outcome_data, due_at, \
                 escalated_at, completed_at, created_at \
             from process_tasks where task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        Self::task_from_row(row)
    }

    pub async fn save_task(&self, task: &ProcessTask) -> Result<()> {
        sqlx::query(
            "update process_tasks set assignee_id = $2, status = $3, outcome = $4, \
                 outcome_data = $5, escalated_at = $6, completed_at = $7 where task_id = $1",
        )
        .bind(&task.task_id)
        .bind(task.status.as_str())
        .bind(&task.assignee_id)
        .bind(&task.outcome)
        .bind(&task.outcome_data)
        .bind(task.escalated_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_tasks_pending_timeout(&self, now: DateTime<Utc>) -> Result<Vec<ProcessTask>> {
        let rows = sqlx::query(
            "select task_id, run_id, step_name, surface_name, entity_name, entity_id, \
                 assignee_id, assignee_role, status, outcome, outcome_data, due_at, \
                 escalated_at, completed_at, created_at \
             from process_tasks \
             where status in ('pending', 'escalated') and due_at < $1 \
             order by due_at asc",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::task_from_row).collect()
    }

    pub async fn list_tasks_for_run(&self, run_id: &str) -> Result<Vec<ProcessTask>> {
        let rows = sqlx::query(
            "select task_id, run_id, step_name, surface_name, entity_name, entity_id, \
                 assignee_id, assignee_role, status, outcome, outcome_data, due_at, \
                 escalated_at, completed_at, created_at \
             from process_tasks where run_id = $1 order by created_at asc",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::task_from_row).collect()
    }

    /// All tasks across all runs/assignees, for the admin surface.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ProcessTask>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "select task_id, run_id, step_name, surface_name, entity_name, entity_id, \
                         assignee_id, assignee_role, status, outcome, outcome_data, due_at, \
                         escalated_at, completed_at, created_at \
                     from process_tasks where status = $1 order by due_at asc",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "select task_id, run_id, step_name, surface_name, entity_name, entity_id, \
                         assignee_id, assignee_role, status, outcome, outcome_data, due_at, \
                         escalated_at, completed_at, created_at \
                     from process_tasks order by due_at asc",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(Self::task_from_row).collect()
    }

    pub async fn list_tasks_for_assignee(
        &self,
        assignee_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<ProcessTask>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "select task_id, run_id, step_name, surface_name, entity_name, entity_id, \
                         assignee_id, assignee_role, status, outcome, outcome_data, due_at, \
                         escalated_at, completed_at, created_at \
                     from process_tasks where assignee_id = $1 and status = $2 \
                     order by due_at asc",
                )
                .bind(assignee_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "select task_id, run_id, step_name, surface_name, entity_name, entity_id, \
                         assignee_id, assignee_role, status, outcome, outcome_data, due_at, \
                         escalated_at, completed_at, created_at \
                     from process_tasks where assignee_id = $1 order by due_at asc",
                )
                .bind(assignee_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(Self::task_from_row).collect()
    }

    fn task_from_row(row: sqlx::postgres::PgRow) -> Result<ProcessTask> {
        let status: String = row.try_get("status")?;
        Ok(ProcessTask {
            task_id: row.try_get("task_id")?,
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            surface_name: row.try_get("surface_name")?,
            entity_name: row.try_get("entity_name")?,
            entity_id: row.try_get("entity_id")?,
            assignee_id: row.try_get("assignee_id")?,
            assignee_role: row.try_get("assignee_role")?,
            status: TaskStatus::parse(&status),
            outcome: row.try_get("outcome")?,
            outcome_data: row.try_get("outcome_data")?,
            due_at: row.try_get("due_at")?,
            escalated_at: row.try_get("escalated_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
