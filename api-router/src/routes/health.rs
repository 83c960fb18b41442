use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::api_state::ApiState;

/// Liveness probe: the process is up.
pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "alive"})))
}

/// Readiness probe: the store answers and the embedder circuit is closed.
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    let store_ok = state.db.query("RETURN 1").await.is_ok();
    let embedder_ok = state.embedder.is_available();

    if store_ok && embedder_ok {
        (
            StatusCode::OK,
            Json(json!({"status": "ready", "store": true, "embedder": true})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "store": store_ok, "embedder": embedder_ok})),
        )
    }
}
