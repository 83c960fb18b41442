#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod api_state;
pub mod error;
pub mod routes;
pub mod tenant;

use api_state::ApiState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use routes::{
    admin::{dead_letter_stats, list_dead_letters, manual_resolve, manual_retry},
    documents::{
        create_document, delete_document, get_document, get_document_chunks,
        get_document_context, ingest_url, list_documents, update_document, url_job_status,
    },
    health::{live, ready},
    memory::{store_memory, store_memory_async},
    retrieve::{rerank, retrieve, search},
};

/// The public API surface. Probes stay unauthenticated; everything else is
/// tenant-scoped through the `X-*` headers.
pub fn api_routes(state: ApiState) -> Router {
    let body_limit = state.config.max_content_bytes * 2;

    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/memory", post(store_memory))
        .route("/memory/async", post(store_memory_async))
        .route("/retrieve", post(retrieve))
        .route("/search", post(search))
        .route("/rerank", post(rerank))
        .route("/documents", post(create_document).get(list_documents))
        .route("/documents/url", post(ingest_url))
        .route("/documents/jobs/{id}", get(url_job_status))
        .route(
            "/documents/{id}",
            get(get_document)
                .put(update_document)
                .delete(delete_document),
        )
        .route("/documents/{id}/chunks", get(get_document_chunks))
        .route("/documents/{id}/context", get(get_document_context))
        .route("/dlq", get(list_dead_letters))
        .route("/dlq/stats", get(dead_letter_stats))
        .route("/dlq/{id}/retry", post(manual_retry))
        .route("/dlq/{id}/resolve", post(manual_resolve))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
