use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use common::storage::types::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterStatus};

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    #[serde(default)]
    pub status: Option<DeadLetterStatus>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, alias = "taskId")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// `GET /dlq`
pub async fn list_dead_letters(
    State(state): State<ApiState>,
    Query(query): Query<DlqQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = DeadLetterFilter {
        status: query.status,
        reason_contains: query.reason,
        task_id: query.task_id,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
        offset: query.offset.unwrap_or(0),
    };

    let entries = DeadLetterEntry::query(&filter, &state.db).await?;
    Ok(Json(entries))
}

/// `GET /dlq/stats`
pub async fn dead_letter_stats(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = DeadLetterEntry::get_stats(&state.db).await?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct ManualRetryBody {
    #[serde(alias = "approvedBy")]
    pub approved_by: String,
}

/// `POST /dlq/:id/retry`
pub async fn manual_retry(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<ManualRetryBody>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = state.dlq.manual_retry(&id, &body.approved_by).await?;
    Ok(Json(json!({"entry_id": id, "task_id": task_id})))
}

#[derive(Debug, Deserialize)]
pub struct ManualResolveBody {
    #[serde(alias = "resolvedBy")]
    pub resolved_by: String,
    pub resolution: String,
}

/// `POST /dlq/:id/resolve`
pub async fn manual_resolve(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<ManualResolveBody>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .dlq
        .manual_resolve(&id, &body.resolved_by, &body.resolution)
        .await?;
    Ok(Json(entry))
}
