use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::Value;

use memory_router::StoreMemoryRequest;

use crate::{
    api_state::ApiState,
    error::ApiError,
    tenant::{resolve_tenant, TenantBody},
};

#[derive(Debug, Deserialize)]
pub struct StoreMemoryBody {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(flatten)]
    pub tenant: TenantBody,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub importance: Option<f32>,
    #[serde(default, alias = "forceEntityExtraction")]
    pub force_entity_extraction: bool,
    #[serde(default, alias = "forceEpisodicStorage")]
    pub force_episodic_storage: bool,
    #[serde(default, alias = "preIdentifiedEntities")]
    pub pre_identified_entities: Vec<String>,
    #[serde(default, alias = "episodeType")]
    pub episode_type: Option<String>,
}

fn validate_body(
    body: &StoreMemoryBody,
    headers: &HeaderMap,
    max_content_bytes: usize,
) -> Result<(String, common::storage::types::tenant::TenantContext), ApiError> {
    let content = body
        .content
        .as_deref()
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| ApiError::validation("MISSING_CONTENT", "content is required"))?;

    if content.len() > max_content_bytes {
        return Err(ApiError::payload_too_large(format!(
            "content exceeds the {max_content_bytes} byte limit"
        )));
    }

    let tenant = resolve_tenant(headers, &body.tenant)?;
    Ok((content.to_string(), tenant))
}

fn to_request(content: String, body: StoreMemoryBody) -> StoreMemoryRequest {
    StoreMemoryRequest {
        content,
        tags: body.tags,
        metadata: body.metadata,
        importance: body.importance,
        force_entity_extraction: body.force_entity_extraction,
        force_episodic_storage: body.force_episodic_storage,
        pre_identified_entities: body.pre_identified_entities,
        episode_type: body.episode_type,
    }
}

/// `POST /memory`: the synchronous ingest contract.
pub async fn store_memory(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<StoreMemoryBody>,
) -> Result<impl IntoResponse, ApiError> {
    let (content, tenant) = validate_body(&body, &headers, state.config.max_content_bytes)?;
    let request = to_request(content, body);

    let outcome = state.memory_router.store_sync(request, tenant).await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

/// `POST /memory/async`: accepted once the primary stores hold the memory;
/// enrichment continues off the request path.
pub async fn store_memory_async(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<StoreMemoryBody>,
) -> Result<impl IntoResponse, ApiError> {
    let (content, tenant) = validate_body(&body, &headers, state.config.max_content_bytes)?;
    let request = to_request(content, body);

    let outcome = state.memory_router.store_async(request, tenant).await?;

    Ok((StatusCode::ACCEPTED, Json(outcome)))
}
