use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use text_splitter::{ChunkCapacity, ChunkConfig, TextSplitter};
use tracing::{error, info};

use common::{
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkType},
        document::Document,
        task_record::TaskStatus,
        tenant::TenantContext,
    },
    utils::{embedding::EmbeddingKind, hashing::content_hash},
};

use crate::{
    api_state::ApiState,
    error::ApiError,
    tenant::{resolve_tenant, TenantBody},
};

const CHUNK_MIN_CHARS: usize = 200;
const CHUNK_MAX_CHARS: usize = 1_000;
// Documents past this size switch to tighter chunks so retrieval stays precise.
const DENSE_CONTENT_THRESHOLD: usize = 32_000;
const DENSE_CHUNK_MAX_CHARS: usize = 600;
const CONTEXT_MAX_CHARS: usize = 8_000;

#[derive(Debug, Deserialize)]
pub struct StoreDocumentBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub tenant: TenantBody,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct IngestUrlBody {
    pub url: String,
    #[serde(flatten)]
    pub tenant: TenantBody,
}

fn classify_chunk(text: &str) -> ChunkType {
    let trimmed = text.trim_start();
    if trimmed.starts_with('#') {
        ChunkType::Header
    } else if trimmed.starts_with("```") || trimmed.starts_with("    ") {
        ChunkType::Code
    } else {
        ChunkType::Paragraph
    }
}

/// Split content into chunks with byte positions, in document order.
fn split_into_chunks(
    document_id: &str,
    content: &str,
    tenant: &TenantContext,
) -> Result<Vec<Chunk>, AppError> {
    let max_chars = if content.len() > DENSE_CONTENT_THRESHOLD {
        DENSE_CHUNK_MAX_CHARS
    } else {
        CHUNK_MAX_CHARS
    };
    let capacity = ChunkCapacity::new(CHUNK_MIN_CHARS.min(max_chars))
        .with_max(max_chars)
        .map_err(|e| AppError::Validation(format!("invalid chunk capacity: {e}")))?;
    let splitter = TextSplitter::new(ChunkConfig::new(capacity));

    let chunks: Vec<Chunk> = splitter
        .chunk_indices(content)
        .map(|(offset, text)| {
            Chunk::new(
                document_id.to_string(),
                text.to_string(),
                offset,
                offset + text.len(),
                classify_chunk(text),
                None,
                tenant,
            )
        })
        .collect();

    if chunks.is_empty() {
        // Content below the minimum still stores as a single chunk.
        return Ok(vec![Chunk::new(
            document_id.to_string(),
            content.to_string(),
            0,
            content.len(),
            classify_chunk(content),
            None,
            tenant,
        )]);
    }

    Ok(chunks)
}

async fn store_document_with_content(
    state: &ApiState,
    title: String,
    content: &str,
    source_url: Option<String>,
    metadata: Option<Value>,
    tenant: &TenantContext,
) -> Result<Document, AppError> {
    let document = Document::new(
        title,
        source_url,
        content_hash(content),
        metadata,
        tenant,
    );

    let chunks = split_into_chunks(&document.id, content, tenant)?;
    let mut embedded = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let embedding = state
            .embedder
            .embed(&chunk.text, EmbeddingKind::Document)
            .await?;
        embedded.push((chunk, embedding));
    }

    document.store_with_chunks(embedded, &state.db).await
}

/// `POST /documents`
pub async fn create_document(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<StoreDocumentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let content = body
        .content
        .as_deref()
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| ApiError::validation("MISSING_CONTENT", "content is required"))?;
    if content.len() > state.config.max_content_bytes {
        return Err(ApiError::payload_too_large(format!(
            "content exceeds the {} byte limit",
            state.config.max_content_bytes
        )));
    }
    let tenant = resolve_tenant(&headers, &body.tenant)?;
    let title = body
        .title
        .clone()
        .unwrap_or_else(|| content.chars().take(80).collect());

    let document =
        store_document_with_content(&state, title, content, None, body.metadata, &tenant).await?;

    Ok((StatusCode::CREATED, Json(document)))
}

/// `GET /documents`
pub async fn list_documents(
    State(state): State<ApiState>,
    headers: HeaderMap,
    axum::extract::Query(query): axum::extract::Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = resolve_tenant(&headers, &TenantBody::default())?;
    let documents = Document::list_for_tenant(
        &tenant,
        query.limit.unwrap_or(20).clamp(1, 100),
        query.offset.unwrap_or(0),
        &state.db,
    )
    .await?;

    Ok(Json(documents))
}

/// `GET /documents/:id`
pub async fn get_document(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let document: Option<Document> = state.db.get_item(&id).await.map_err(AppError::from)?;
    let document = document.ok_or_else(|| ApiError::not_found(format!("document {id}")))?;
    Ok(Json(document))
}

/// `GET /documents/:id/chunks`
pub async fn get_document_chunks(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let document: Option<Document> = state.db.get_item(&id).await.map_err(AppError::from)?;
    if document.is_none() {
        return Err(ApiError::not_found(format!("document {id}")));
    }
    let chunks = Chunk::for_document(&id, &state.db).await?;
    Ok(Json(chunks))
}

/// `GET /documents/:id/context`
pub async fn get_document_context(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let document: Option<Document> = state.db.get_item(&id).await.map_err(AppError::from)?;
    let document = document.ok_or_else(|| ApiError::not_found(format!("document {id}")))?;
    let context = Document::assemble_context(&id, CONTEXT_MAX_CHARS, &state.db).await?;

    Ok(Json(json!({
        "document_id": document.id,
        "title": document.title,
        "context": context,
    })))
}

/// `PUT /documents/:id`: replace content, re-chunk, re-embed.
pub async fn update_document(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<StoreDocumentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let existing: Option<Document> = state.db.get_item(&id).await.map_err(AppError::from)?;
    let existing = existing.ok_or_else(|| ApiError::not_found(format!("document {id}")))?;

    let content = body
        .content
        .as_deref()
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| ApiError::validation("MISSING_CONTENT", "content is required"))?;
    let tenant = resolve_tenant(&headers, &body.tenant)?;

    Document::delete_with_chunks(&id, &state.db).await?;
    let mut replacement = Document::new(
        body.title.unwrap_or(existing.title),
        existing.source_url,
        content_hash(content),
        body.metadata.or(existing.metadata),
        &tenant,
    );
    replacement.id = id;

    let chunks = split_into_chunks(&replacement.id, content, &tenant)?;
    let mut embedded = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let embedding = state
            .embedder
            .embed(&chunk.text, EmbeddingKind::Document)
            .await?;
        embedded.push((chunk, embedding));
    }
    let stored = replacement.store_with_chunks(embedded, &state.db).await?;

    Ok(Json(stored))
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default, alias = "confirmPermanentDeletion")]
    pub confirm_permanent_deletion: bool,
}

/// `DELETE /documents/:id`: destructive, requires explicit confirmation.
pub async fn delete_document(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<DeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !query.confirm_permanent_deletion {
        return Err(ApiError::validation(
            "CONFIRMATION_REQUIRED",
            "pass confirmPermanentDeletion=true to delete a document permanently",
        ));
    }

    let document: Option<Document> = state.db.get_item(&id).await.map_err(AppError::from)?;
    if document.is_none() {
        return Err(ApiError::not_found(format!("document {id}")));
    }

    Document::delete_with_chunks(&id, &state.db).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /documents/url`: fetch and ingest a page in the background,
/// returning a job id for status polling.
pub async fn ingest_url(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<IngestUrlBody>,
) -> Result<impl IntoResponse, ApiError> {
    let url: url::Url = body
        .url
        .parse()
        .map_err(|_| ApiError::validation("INVALID_URL", "url must be absolute"))?;
    ensure_ingestion_url_allowed(&url)?;
    let tenant = resolve_tenant(&headers, &body.tenant)?;

    let task_id = state
        .tasks
        .create_task("ingest_url", json!({"url": url.to_string()}))
        .await?;

    let job_state = state.clone();
    let job_task_id = task_id.clone();
    tokio::spawn(async move {
        run_url_ingestion(job_state, job_task_id, url, tenant).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"job_id": task_id, "status": "accepted"})),
    ))
}

/// `GET /documents/jobs/:id`
pub async fn url_job_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .tasks
        .get_reconciled(&id, &state.reconciler)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))?;

    Ok(Json(json!({
        "job_id": task.id,
        "status": task.status,
        "result": task.result,
        "error": task.error,
    })))
}

async fn run_url_ingestion(
    state: ApiState,
    task_id: String,
    url: url::Url,
    tenant: TenantContext,
) {
    if let Err(err) = state
        .tasks
        .update_task(&task_id, TaskStatus::Running, None, None)
        .await
    {
        error!(task_id = %task_id, error = %err, "failed to mark url ingestion running");
    }

    // Fetching is the flaky part: run it under the retry executor so failures
    // feed the analyzer and budget exhaustion lands in the DLQ with enough
    // metadata for the processor to replay the task.
    let retry_ctx = resilience::RetryContext::new(&task_id, "documents", "ingest_url")
        .with_max_attempts(3)
        .with_timeout(std::time::Duration::from_secs(30))
        .with_metadata(json!({
            "task_type": "ingest_url",
            "params": {"url": url.to_string()},
        }));

    let fetch_state = state.clone();
    let fetch_url = url.clone();
    let fetch_tenant = tenant.clone();
    let outcome = state
        .retry
        .execute(retry_ctx, move |_ctx| {
            let state = fetch_state.clone();
            let url = fetch_url.clone();
            let tenant = fetch_tenant.clone();
            async move { fetch_and_store(&state, &url, &tenant).await }
        })
        .await;

    match outcome {
        Ok(document) => {
            info!(task_id = %task_id, document_id = %document.id, "url ingestion finished");
            if let Err(err) = state
                .tasks
                .update_task(
                    &task_id,
                    TaskStatus::Completed,
                    Some(json!({"document_id": document.id})),
                    None,
                )
                .await
            {
                error!(task_id = %task_id, error = %err, "failed to complete url ingestion task");
            }
        }
        Err(err) => {
            error!(task_id = %task_id, error = %err, "url ingestion failed");
            if let Err(update_err) = state
                .tasks
                .update_task(&task_id, TaskStatus::Failed, None, Some(err.to_string()))
                .await
            {
                error!(task_id = %task_id, error = %update_err, "failed to fail url ingestion task");
            }
        }
    }
}

/// Reject URL targets the service must never fetch: non-http schemes,
/// localhost and private or link-local ranges.
fn ensure_ingestion_url_allowed(url: &url::Url) -> Result<(), ApiError> {
    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(ApiError::validation(
                "UNSUPPORTED_URL_SCHEME",
                "Unsupported URL scheme for ingestion",
            ));
        }
    }

    let Some(host) = url.host_str() else {
        return Err(ApiError::validation(
            "INVALID_URL",
            "URL is missing a host component",
        ));
    };

    if host.eq_ignore_ascii_case("localhost") {
        return Err(ApiError::validation(
            "INVALID_URL",
            "Ingestion URL host is not allowed",
        ));
    }

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        let is_disallowed = match ip {
            std::net::IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
            std::net::IpAddr::V6(v6) => v6.is_unique_local() || v6.is_unicast_link_local(),
        };

        if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || is_disallowed {
            return Err(ApiError::validation(
                "INVALID_URL",
                "Ingestion URL host is not allowed",
            ));
        }
    }

    Ok(())
}

fn extract_article(html: String, url: &url::Url) -> Result<(String, String), AppError> {
    let config = dom_smoothie::Config {
        text_mode: dom_smoothie::TextMode::Markdown,
        ..Default::default()
    };
    let mut readability = dom_smoothie::Readability::new(html, Some(url.as_str()), Some(config))
        .map_err(|e| AppError::Processing(format!("readability setup failed: {e}")))?;
    let article = readability
        .parse()
        .map_err(|e| AppError::Processing(format!("content extraction failed: {e}")))?;
    Ok((article.text_content.trim().to_string(), article.title))
}

async fn fetch_and_store(
    state: &ApiState,
    url: &url::Url,
    tenant: &TenantContext,
) -> Result<Document, AppError> {
    let response = reqwest::get(url.clone()).await?.error_for_status()?;
    let html = response.text().await?;

    let (text, title) = extract_article(html, url)?;
    if text.is_empty() {
        return Err(AppError::Processing(format!(
            "no readable content at {url}"
        )));
    }

    store_document_with_content(state, title, &text, Some(url.to_string()), None, tenant)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantContext {
        TenantContext::new("acme")
    }

    #[test]
    fn short_content_becomes_a_single_chunk() {
        let chunks = split_into_chunks("doc1", "tiny note", &tenant()).expect("split");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].position_start, 0);
        assert_eq!(chunks[0].position_end, "tiny note".len());
    }

    #[test]
    fn dense_content_chunks_more_aggressively() {
        let sentence = "Dense technical prose with plenty of detail in every line. ";
        let content = sentence.repeat(1 + DENSE_CONTENT_THRESHOLD / sentence.len());
        assert!(content.len() > DENSE_CONTENT_THRESHOLD);

        let chunks = split_into_chunks("doc1", &content, &tenant()).expect("split");
        assert!(chunks
            .iter()
            .all(|chunk| chunk.text.len() <= DENSE_CHUNK_MAX_CHARS));
    }

    #[test]
    fn long_content_produces_ordered_chunks() {
        let paragraphs: Vec<String> = (0..40)
            .map(|n| format!("Paragraph number {n} carries enough words to matter in a split."))
            .collect();
        let content = paragraphs.join("\n\n");

        let chunks = split_into_chunks("doc1", &content, &tenant()).expect("split");
        assert!(chunks.len() > 1, "long content must split");

        let mut previous_end = 0;
        for chunk in &chunks {
            assert!(chunk.position_start >= previous_end);
            assert!(chunk.position_end > chunk.position_start);
            previous_end = chunk.position_end;
        }
    }

    #[test]
    fn chunk_types_are_classified() {
        assert_eq!(classify_chunk("# Heading"), ChunkType::Header);
        assert_eq!(classify_chunk("```rust\nfn main() {}\n```"), ChunkType::Code);
        assert_eq!(classify_chunk("plain prose"), ChunkType::Paragraph);
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let url = url::Url::parse("ftp://example.com").expect("url");
        assert!(ensure_ingestion_url_allowed(&url).is_err());
    }

    #[test]
    fn rejects_localhost_and_private_ranges() {
        let url = url::Url::parse("http://localhost/resource").expect("url");
        assert!(ensure_ingestion_url_allowed(&url).is_err());

        let url = url::Url::parse("http://192.168.1.10/index.html").expect("url");
        assert!(ensure_ingestion_url_allowed(&url).is_err());
    }

    #[test]
    fn allows_public_domains() {
        let url = url::Url::parse("https://sub.example.com/path").expect("url");
        assert!(ensure_ingestion_url_allowed(&url).is_ok());
    }
}
