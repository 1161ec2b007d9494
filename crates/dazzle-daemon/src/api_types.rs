//! Request/response DTOs for the admin HTTP surface.

use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

#[derive(Deserialize)]
pub struct RunsQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct TasksQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct CompleteTaskRequest {
    pub outcome: String,
    #[serde(default)]
    pub outcome_data: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ReassignTaskRequest {
    pub assignee_id: String,
}

#[derive(Serialize)]
pub struct TopicsResponse {
    pub topics: Vec<String>,
}

#[derive(Serialize)]
pub struct TopicInfoResponse {
    pub topic: String,
    pub consumer_groups: Vec<String>,
    pub dlq_depth: i64,
}

#[derive(Serialize)]
pub struct RetryResponse {
    pub retried: bool,
}

#[derive(Deserialize)]
pub struct DeployVersionRequest {
    pub version_id: String,
    pub dsl_hash: String,
    #[serde(default)]
    pub manifest: serde_json::Value,
}

#[derive(Deserialize)]
pub struct StartMigrationRequest {
    pub from_version: String,
    pub to_version: String,
}

#[derive(Serialize)]
pub struct MigrationStatusResponse {
    pub id: String,
    pub from_version: String,
    pub to_version: String,
    pub status: String,
    pub runs_remaining: i64,
}
