//! Axum router and HTTP handlers for the admin surface.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)` so scenario tests can
//! compose the bare router.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::api_types::{
    CompleteTaskRequest, DeployVersionRequest, ErrorResponse, HealthResponse,
    MigrationStatusResponse, ReassignTaskRequest, RetryResponse, RunsQuery, StartMigrationRequest,
    TasksQuery, TopicInfoResponse, TopicsResponse,
};
use crate::state::{uptime_secs, AppState, BusMsg};
use dazzle_process::{RunStatus, TaskStatus};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/v1/runs", get(list_runs))
        .route("/v1/runs/:run_id/cancel", post(cancel_run))
        .route("/v1/tasks", get(list_tasks))
        .route("/v1/tasks/:task_id/complete", post(complete_task))
        .route("/v1/tasks/:task_id/reassign", post(reassign_task))
        .route("/v1/bus/topics", get(list_topics))
        .route("/v1/bus/topics/:topic", get(topic_info))
        .route("/v1/bus/topics/:topic/groups", get(list_consumer_groups))
        .route("/v1/outbox/failed", get(list_failed_outbox))
        .route("/v1/outbox/:id/retry", post(retry_outbox_entry))
        .route("/v1/versions", post(deploy_version))
        .route("/v1/versions/migrations", post(start_migration))
        .route("/v1/versions/migrations/:id", get(migration_status))
        .route("/v1/versions/migrations/:id/complete", post(complete_migration))
        .route("/v1/versions/migrations/:id/rollback", post(rollback_migration))
        .with_state(state)
}

fn err(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            uptime_secs: uptime_secs(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/stream — SSE status bus
// ---------------------------------------------------------------------------

async fn stream(
    State(st): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = st.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        let msg = msg.ok()?;
        let json = serde_json::to_string(&msg).ok()?;
        Some(Ok(Event::default().data(json)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Process runs
// ---------------------------------------------------------------------------

async fn list_runs(State(st): State<Arc<AppState>>, Query(q): Query<RunsQuery>) -> Response {
    let status = q.status.as_deref().map(RunStatus::parse);
    match st.process_store.list_runs(status).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn cancel_run(State(st): State<Arc<AppState>>, Path(run_id): Path<String>) -> Response {
    match st.orchestrator.cancel_run(&run_id).await {
        Ok(()) => {
            info!(run_id, "run cancelled via admin API");
            let _ = st.bus.send(BusMsg::RunTransitioned {
                run_id,
                status: "cancelled".into(),
            });
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => err(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Human tasks
// ---------------------------------------------------------------------------

async fn list_tasks(State(st): State<Arc<AppState>>, Query(q): Query<TasksQuery>) -> Response {
    let status = q.status.as_deref().map(TaskStatus::parse);
    match st.process_store.list_tasks(status).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn complete_task(
    State(st): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(req): Json<CompleteTaskRequest>,
) -> Response {
    match st
        .orchestrator
        .complete_task(&task_id, &req.outcome, req.outcome_data)
        .await
    {
        Ok(()) => {
            let _ = st.bus.send(BusMsg::TaskCompleted {
                task_id,
                outcome: req.outcome,
            });
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => err(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn reassign_task(
    State(st): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(req): Json<ReassignTaskRequest>,
) -> Response {
    let mut task = match st.process_store.get_task(&task_id).await {
        Ok(t) => t,
        Err(e) => return err(StatusCode::NOT_FOUND, e.to_string()),
    };
    if let Err(e) = task.reassign(Some(req.assignee_id)) {
        return err(StatusCode::BAD_REQUEST, e.to_string());
    }
    match st.process_store.save_task(&task).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Bus introspection
// ---------------------------------------------------------------------------

async fn list_topics(State(st): State<Arc<AppState>>) -> Response {
    match st.event_bus.list_topics().await {
        Ok(topics) => Json(TopicsResponse { topics }).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn topic_info(State(st): State<Arc<AppState>>, Path(topic): Path<String>) -> Response {
    match st.event_bus.get_topic_info(&topic).await {
        Ok(info) => Json(TopicInfoResponse {
            topic: info.topic,
            consumer_groups: info.consumer_groups,
            dlq_depth: info.dlq_depth,
        })
        .into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn list_consumer_groups(State(st): State<Arc<AppState>>, Path(topic): Path<String>) -> Response {
    match st.event_bus.list_consumer_groups(&topic).await {
        Ok(groups) => Json(groups).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

async fn list_failed_outbox(State(st): State<Arc<AppState>>) -> Response {
    match st.outbox_store.get_failed_entries().await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn retry_outbox_entry(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match st.outbox_store.retry_failed(&id).await {
        Ok(retried) => Json(RetryResponse { retried }).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// DSL versions / migrations
// ---------------------------------------------------------------------------

async fn deploy_version(
    State(st): State<Arc<AppState>>,
    Json(req): Json<DeployVersionRequest>,
) -> Response {
    match st
        .version_store
        .deploy_version(&req.version_id, &req.dsl_hash, req.manifest)
        .await
    {
        Ok(version) => Json(version.version_id).into_response(),
        Err(e) => err(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn start_migration(
    State(st): State<Arc<AppState>>,
    Json(req): Json<StartMigrationRequest>,
) -> Response {
    match st
        .version_store
        .start_migration(&req.from_version, &req.to_version)
        .await
    {
        Ok(migration) => Json(migration.id).into_response(),
        Err(e) => err(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn migration_status(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let migration = match st.version_store.get_migration(&id).await {
        Ok(m) => m,
        Err(e) => return err(StatusCode::NOT_FOUND, e.to_string()),
    };
    let runs_remaining = match st.process_store.count_runs_for_version(&migration.from_version).await {
        Ok(n) => n,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    Json(MigrationStatusResponse {
        id: migration.id,
        from_version: migration.from_version,
        to_version: migration.to_version,
        status: migration.status.as_str().to_string(),
        runs_remaining,
    })
    .into_response()
}

async fn complete_migration(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let migration = match st.version_store.get_migration(&id).await {
        Ok(m) => m,
        Err(e) => return err(StatusCode::NOT_FOUND, e.to_string()),
    };
    let runs_remaining = match st.process_store.count_runs_for_version(&migration.from_version).await {
        Ok(n) => n,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    match st.version_store.complete_migration(&id, runs_remaining).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err(StatusCode::CONFLICT, e.to_string()),
    }
}

async fn rollback_migration(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match st.version_store.rollback_migration(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err(StatusCode::BAD_REQUEST, e.to_string()),
    }
}
