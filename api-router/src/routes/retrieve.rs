use std::collections::BTreeMap;
use std::str::FromStr;

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use retrieval_pipeline::{
    ContentKind, ContentTypeMask, MetadataFilter, RetrievalConfig, RetrievalStrategy, ScoredItem,
};

use common::storage::types::{interaction::Interaction, tenant::TenantContext};
use tracing::warn;

use crate::{
    api_state::ApiState,
    error::ApiError,
    tenant::{resolve_tenant, PlatformHeaders, TenantBody},
};

#[derive(Debug, Deserialize)]
pub struct RetrieveBody {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub rerank: bool,
    #[serde(default, alias = "contentTypes")]
    pub content_types: Option<ContentTypeMask>,
    #[serde(default)]
    pub filters: Option<MetadataFilter>,
    #[serde(flatten)]
    pub tenant: TenantBody,
}

fn build_config(body: &RetrieveBody, state: &ApiState) -> Result<RetrievalConfig, ApiError> {
    let strategy = match body.strategy.as_deref() {
        None => RetrievalStrategy::default(),
        Some(raw) => RetrievalStrategy::from_str(raw)
            .map_err(|err| ApiError::validation("INVALID_STRATEGY", err))?,
    };

    let mut config = RetrievalConfig::with_strategy(strategy);
    config.limit = body.limit.unwrap_or(10).clamp(1, 100);
    config.offset = body.offset.unwrap_or(0);
    config.rerank = body.rerank;
    if let Some(mask) = body.content_types {
        config.content_types = mask;
    }
    if let Some(filter) = &body.filters {
        config.filter = filter.clone();
    }
    config.tuning.deadline_secs = state.config.retrieval_deadline_secs;
    Ok(config)
}

fn require_query(body: &RetrieveBody) -> Result<String, ApiError> {
    body.query
        .as_deref()
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ApiError::validation("MISSING_QUERY", "query is required"))
}

/// `POST /retrieve`: hybrid retrieval with strategy selection.
pub async fn retrieve(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<RetrieveBody>,
) -> Result<impl IntoResponse, ApiError> {
    let query = require_query(&body)?;
    let tenant = resolve_tenant(&headers, &body.tenant)?;
    let config = build_config(&body, &state)?;

    let response = retrieval_pipeline::retrieve(
        &state.db,
        &state.embedder,
        state.reranker.as_deref(),
        &query,
        &tenant,
        config,
    )
    .await?;

    record_interaction(&state, &headers, &tenant, &query, &response).await;

    Ok(Json(json!({
        "strategy_used": response.strategy_used,
        "content": response.items,
        "metadata": {
            "total": response.total,
            "reranked": response.reranked,
            "sub_queries": response.reports,
        },
        "relevanceScore": response.items.first().map(|item| item.score),
        "usage": {
            "latency_ms": response.latency_ms,
        },
    })))
}

/// Capture the turn when the caller identifies a platform. Best-effort:
/// retrieval never fails because telemetry did.
async fn record_interaction(
    state: &ApiState,
    headers: &axum::http::HeaderMap,
    tenant: &TenantContext,
    query: &str,
    response: &retrieval_pipeline::RetrievalResponse,
) {
    let platform = PlatformHeaders::from_headers(headers);
    let Some(platform_name) = platform.platform else {
        return;
    };

    let mut interaction = Interaction::new(
        platform_name,
        query.to_string(),
        String::new(),
        None,
        tenant,
    );
    interaction.latency_ms = Some(response.latency_ms);
    interaction.retrieved_memory_ids = response
        .items
        .iter()
        .filter(|item| item.item.content_type == ContentKind::Memory)
        .map(|item| item.item.id.clone())
        .collect();
    interaction.entity_ids = response
        .items
        .iter()
        .filter(|item| item.item.content_type == ContentKind::Entity)
        .map(|item| item.item.id.clone())
        .collect();

    if let Err(err) = interaction.record(&state.db).await {
        warn!(error = %err, "failed to record retrieval interaction");
    }
}

/// `POST /search`: same engine, results grouped by content type with
/// pagination and timing fields.
pub async fn search(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<RetrieveBody>,
) -> Result<impl IntoResponse, ApiError> {
    let query = require_query(&body)?;
    let tenant = resolve_tenant(&headers, &body.tenant)?;
    let config = build_config(&body, &state)?;
    let (limit, offset) = (config.limit, config.offset);

    let response = retrieval_pipeline::retrieve(
        &state.db,
        &state.embedder,
        state.reranker.as_deref(),
        &query,
        &tenant,
        config,
    )
    .await?;

    let mut groups: BTreeMap<&'static str, Vec<&ScoredItem>> = BTreeMap::new();
    for item in &response.items {
        let bucket = match item.item.content_type {
            ContentKind::Memory => "memories",
            ContentKind::Chunk => "chunks",
            ContentKind::Entity => "entities",
        };
        groups.entry(bucket).or_default().push(item);
    }

    Ok(Json(json!({
        "strategy_used": response.strategy_used,
        "results": groups,
        "pagination": {
            "limit": limit,
            "offset": offset,
            "total": response.total,
        },
        "performance": {
            "latency_ms": response.latency_ms,
            "reranked": response.reranked,
            "sub_queries": response.reports,
        },
    })))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RerankDocument {
    Text(String),
    WithId {
        #[serde(default)]
        id: Option<String>,
        content: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct RerankBody {
    pub query: String,
    #[serde(default)]
    pub documents: Vec<RerankDocument>,
    #[serde(default, alias = "topK")]
    pub top_k: Option<usize>,
}

/// `POST /rerank`: direct access to the rerank capability.
pub async fn rerank(
    State(state): State<ApiState>,
    Json(body): Json<RerankBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.query.trim().is_empty() {
        return Err(ApiError::validation("MISSING_QUERY", "query is required"));
    }
    let Some(reranker) = &state.reranker else {
        return Err(ApiError::from(common::error::AppError::Unavailable(
            "rerank_unavailable".into(),
        )));
    };

    let (ids, contents): (Vec<Option<String>>, Vec<String>) = body
        .documents
        .iter()
        .map(|doc| match doc {
            RerankDocument::Text(text) => (None, text.clone()),
            RerankDocument::WithId { id, content } => (id.clone(), content.clone()),
        })
        .unzip();

    let top_k = body.top_k.unwrap_or(contents.len().max(1)).clamp(1, 100);
    let results = reranker.rerank(&body.query, &contents, top_k).await?;

    let rows: Vec<_> = results
        .into_iter()
        .map(|result| {
            json!({
                "id": ids.get(result.index).cloned().flatten(),
                "content": contents.get(result.index),
                "score": result.score,
                "index": result.index,
            })
        })
        .collect();

    Ok(Json(json!(rows)))
}
