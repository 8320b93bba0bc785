use crate::facade::JobForge;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Builds the minimal HTTP surface named in spec §6: submit, cancel,
/// inspect, and DLQ management. No dashboard, no metrics endpoint -- those
/// are explicitly out of scope.
pub fn router(app: JobForge) -> Router {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/events", get(get_events))
        .route("/dlq", get(list_dlq))
        .route("/dlq/:id", get(get_dlq))
        .route("/dlq/:id/retry", post(retry_dlq))
        .route("/healthz", get(health))
        .with_state(app)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct SubmitRequest {
    definition_key: String,
    definition_version: i32,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    priority: i32,
    max_attempts: Option<i32>,
    scheduled_at: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
}

async fn submit_job(
    State(app): State<JobForge>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<Value>, ApiError> {
    let job = app
        .submit(
            req.definition_key,
            req.definition_version,
            req.params,
            req.priority,
            req.max_attempts,
            req.scheduled_at,
            req.idempotency_key,
        )
        .await?;
    Ok(Json(json!(job)))
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<i64>,
}

async fn list_jobs(
    State(app): State<JobForge>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let jobs = app.list_jobs(q.status.as_deref(), q.limit.unwrap_or(100)).await?;
    Ok(Json(json!(jobs)))
}

async fn get_job(State(app): State<JobForge>, Path(id): Path<Uuid>) -> Result<Json<Value>, ApiError> {
    match app.get_job(id).await? {
        Some(job) => Ok(Json(json!(job))),
        None => Err(ApiError::NotFound),
    }
}

async fn cancel_job(State(app): State<JobForge>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    app.cancel(id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_events(
    State(app): State<JobForge>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let events = app.get_events(id).await?;
    Ok(Json(json!(events)))
}

#[derive(Deserialize)]
struct DlqListQuery {
    limit: Option<i64>,
}

async fn list_dlq(
    State(app): State<JobForge>,
    Query(q): Query<DlqListQuery>,
) -> Result<Json<Value>, ApiError> {
    let rows = app.list_dlq(q.limit.unwrap_or(100)).await?;
    Ok(Json(json!(rows)))
}

async fn get_dlq(State(app): State<JobForge>, Path(id): Path<Uuid>) -> Result<Json<Value>, ApiError> {
    match app.get_dlq(id).await? {
        Some(row) => Ok(Json(json!(row))),
        None => Err(ApiError::NotFound),
    }
}

#[derive(Deserialize, Default)]
struct RetryDlqRequest {
    max_attempts: Option<i32>,
}

async fn retry_dlq(
    State(app): State<JobForge>,
    Path(id): Path<Uuid>,
    body: Option<Json<RetryDlqRequest>>,
) -> Result<Json<Value>, ApiError> {
    let max_attempts = body.map(|Json(b)| b.max_attempts).unwrap_or(None);
    let job_id = app.retry_dlq(id, max_attempts).await?;
    Ok(Json(json!({ "job_id": job_id })))
}

enum ApiError {
    NotFound,
    Core(crate::error::CoreError),
}

impl From<crate::error::CoreError> for ApiError {
    fn from(e: crate::error::CoreError) -> Self {
        ApiError::Core(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ApiError::Core(crate::error::CoreError::Validation(msg)) => {
                (StatusCode::CONFLICT, msg).into_response()
            }
            ApiError::Core(crate::error::CoreError::UnknownDefinition { key, version }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("unknown definition {key}@{version}"),
            )
                .into_response(),
            ApiError::Core(crate::error::CoreError::InvalidTransition(msg)) => {
                (StatusCode::CONFLICT, msg).into_response()
            }
            ApiError::Core(e) => {
                tracing::error!(error = %e, "api request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}
