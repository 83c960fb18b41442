#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod config;
pub mod fts;
pub mod graph;
pub mod item;
pub mod metadata;
pub mod scoring;
pub mod vector;

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument, warn};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::tenant::TenantContext},
    utils::{
        embedding::{EmbeddingClient, EmbeddingKind},
        rerank::Reranker,
    },
};

pub use config::{
    ContentTypeMask, FusionWeights, MetadataFilter, RetrievalConfig, RetrievalStrategy,
    RetrievalTuning,
};
pub use item::{ContentKind, RetrievedItem};
pub use scoring::Source;

use scoring::{adaptive_weights, merge_candidates, sort_merged, Candidate, Merged};

/// One ranked result on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredItem {
    #[serde(flatten)]
    pub item: RetrievedItem,
    pub score: f32,
    pub sources: Vec<Source>,
}

/// Outcome of one sub-query, for diagnostics and failure accounting.
#[derive(Debug, Clone, Serialize)]
pub struct SubQueryReport {
    pub source: Source,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub candidates: usize,
}

#[derive(Debug, Serialize)]
pub struct RetrievalResponse {
    pub strategy_used: RetrievalStrategy,
    pub total: usize,
    pub items: Vec<ScoredItem>,
    pub reports: Vec<SubQueryReport>,
    pub reranked: bool,
    pub latency_ms: u64,
}

enum SubQueryOutcome {
    Ran(Result<Vec<Candidate<RetrievedItem>>, AppError>, Duration),
    Skipped,
}

/// Answer a retrieval request by fanning out to the enabled sub-queries under
/// one deadline, merging per-id weighted scores, and optionally reranking.
#[instrument(skip_all, fields(company_id = %tenant.company_id, strategy = %config.strategy))]
pub async fn retrieve(
    db: &SurrealDbClient,
    embedder: &EmbeddingClient,
    reranker: Option<&dyn Reranker>,
    query: &str,
    tenant: &TenantContext,
    config: RetrievalConfig,
) -> Result<RetrievalResponse, AppError> {
    let started = Instant::now();
    let query = query.trim();
    if query.is_empty() {
        return Err(AppError::Validation("query is required".into()));
    }

    let query_embedding = embedder.embed(query, EmbeddingKind::Query).await?;

    let weights = match config.strategy {
        RetrievalStrategy::SemanticChunks => FusionWeights::semantic_only(),
        RetrievalStrategy::GraphTraversal => FusionWeights::graph_only(),
        RetrievalStrategy::Hybrid => FusionWeights::hybrid(),
        RetrievalStrategy::Adaptive => adaptive_weights(query),
    };

    let run_vector = weights.vector > 0.0;
    let run_fts = weights.fts > 0.0;
    let run_metadata = weights.metadata > 0.0 && !config.filter.is_empty();
    let run_graph = weights.graph > 0.0;

    let deadline = Duration::from_secs(config.tuning.deadline_secs.max(1));

    let (vector_outcome, fts_outcome, metadata_outcome, graph_outcome) = tokio::join!(
        bounded(run_vector, deadline, async {
            vector::vector_candidates(
                &query_embedding,
                tenant,
                config.content_types,
                config.tuning.vector_take,
                db,
            )
            .await
        }),
        bounded(run_fts, deadline, async {
            fts::fts_candidates(query, tenant, config.content_types, config.tuning.fts_take, db)
                .await
        }),
        bounded(run_metadata, deadline, async {
            metadata::metadata_candidates(&config.filter, tenant, config.tuning.metadata_take, db)
                .await
        }),
        bounded(run_graph, deadline, async {
            graph::graph_candidates(&query_embedding, tenant, &config.tuning, db).await
        }),
    );

    let mut reports = Vec::new();
    let mut candidates = Vec::new();
    let mut ran_any = false;
    let mut failed_all = true;

    for (source, outcome) in [
        (Source::Vector, vector_outcome),
        (Source::Fts, fts_outcome),
        (Source::Metadata, metadata_outcome),
        (Source::Graph, graph_outcome),
    ] {
        let (report, mut sub_candidates) = settle(source, outcome);
        if let Some(report) = report {
            ran_any = true;
            if report.ok {
                failed_all = false;
            } else if config.strategy == RetrievalStrategy::GraphTraversal
                && source == Source::Graph
            {
                return Err(AppError::Unavailable("graph_store_unavailable".into()));
            }
            reports.push(report);
        }
        candidates.append(&mut sub_candidates);
    }

    if ran_any && failed_all {
        return Err(AppError::Unavailable("no_backends_available".into()));
    }

    let mut merged = merge_candidates(
        candidates,
        weights,
        |item: &RetrievedItem| item.merge_key(),
        |item: &RetrievedItem| item.created_at,
    );

    let vector_contributed = merged
        .iter()
        .any(|entry| entry.scores.vector.is_some());
    let mut reranked = false;
    if config.rerank && vector_contributed {
        if let Some(reranker) = reranker {
            match apply_rerank(reranker, query, &mut merged, config.rerank_candidates()).await {
                Ok(()) => reranked = true,
                Err(err) => {
                    warn!(error = %err, "rerank failed; keeping merged scores");
                }
            }
        }
    }

    let total = merged.len();
    let items: Vec<ScoredItem> = merged
        .into_iter()
        .skip(config.offset)
        .take(config.limit.max(1))
        .map(|entry| ScoredItem {
            score: entry.fused,
            sources: entry.scores.sources(),
            item: entry.item,
        })
        .collect();

    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    info!(
        total,
        returned = items.len(),
        reranked,
        latency_ms,
        "retrieval finished"
    );

    Ok(RetrievalResponse {
        strategy_used: config.strategy,
        total,
        items,
        reports,
        reranked,
        latency_ms,
    })
}

async fn bounded<F>(enabled: bool, deadline: Duration, fut: F) -> SubQueryOutcome
where
    F: std::future::Future<Output = Result<Vec<Candidate<RetrievedItem>>, AppError>>,
{
    if !enabled {
        return SubQueryOutcome::Skipped;
    }

    let started = Instant::now();
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => SubQueryOutcome::Ran(result, started.elapsed()),
        Err(_) => SubQueryOutcome::Ran(
            Err(AppError::Unavailable("sub-query missed the deadline".into())),
            started.elapsed(),
        ),
    }
}

fn settle(
    source: Source,
    outcome: SubQueryOutcome,
) -> (Option<SubQueryReport>, Vec<Candidate<RetrievedItem>>) {
    match outcome {
        SubQueryOutcome::Skipped => (None, Vec::new()),
        SubQueryOutcome::Ran(Ok(candidates), duration) => (
            Some(SubQueryReport {
                source,
                ok: true,
                error: None,
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                candidates: candidates.len(),
            }),
            candidates,
        ),
        SubQueryOutcome::Ran(Err(err), duration) => {
            warn!(source = ?source, error = %err, "sub-query failed");
            (
                Some(SubQueryReport {
                    source,
                    ok: false,
                    error: Some(err.to_string()),
                    duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    candidates: 0,
                }),
                Vec::new(),
            )
        }
    }
}

/// Rerank the head of the merged list and splice the new ordering back in
/// front of the untouched tail.
async fn apply_rerank(
    reranker: &dyn Reranker,
    query: &str,
    merged: &mut Vec<Merged<RetrievedItem>>,
    candidates: usize,
) -> Result<(), AppError> {
    let head_len = candidates.min(merged.len());
    if head_len == 0 {
        return Ok(());
    }

    let documents: Vec<String> = merged
        .iter()
        .take(head_len)
        .map(|entry| entry.item.content.clone())
        .collect();

    let results = reranker.rerank(query, &documents, head_len).await?;

    let tail = merged.split_off(head_len);
    let head = std::mem::take(merged);

    let mut reordered: Vec<Merged<RetrievedItem>> = Vec::with_capacity(head.len());
    let mut consumed = vec![false; head.len()];
    for result in results {
        if let Some(mut entry) = head.get(result.index).cloned() {
            if consumed[result.index] {
                continue;
            }
            consumed[result.index] = true;
            entry.fused = result.score.clamp(0.0, 1.0);
            reordered.push(entry);
        }
    }
    // Documents the reranker dropped keep their merged score, after the
    // reranked ones.
    for (idx, entry) in head.into_iter().enumerate() {
        if !consumed[idx] {
            reordered.push(entry);
        }
    }

    sort_merged(&mut reordered);
    reordered.extend(tail);
    *merged = reordered;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::types::memory::{Memory, MemoryEmbedding};
    use common::utils::rerank::LexicalReranker;
    use uuid::Uuid;

    fn tenant() -> TenantContext {
        TenantContext::new("acme").with_user("u1")
    }

    const DIM: usize = 64;

    async fn setup() -> (SurrealDbClient, EmbeddingClient) {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("retrieval_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init definitions");
        ensure_runtime_indexes(&db, DIM).await.expect("indexes");
        (db, EmbeddingClient::new_hashed(DIM))
    }

    async fn seed_memory(db: &SurrealDbClient, embedder: &EmbeddingClient, content: &str) -> String {
        let memory = Memory::new(
            &tenant(),
            content.into(),
            common::utils::hashing::content_hash(content),
            vec![],
            None,
            None,
        );
        let embedding = embedder
            .embed(content, EmbeddingKind::Document)
            .await
            .expect("embed");
        db.store_item(memory.clone()).await.expect("store memory");
        MemoryEmbedding::new(&memory, embedding)
            .upsert(db)
            .await
            .expect("store embedding");
        memory.id
    }

    #[tokio::test]
    async fn exact_content_is_top_one_for_semantic_strategy() {
        let (db, embedder) = setup().await;
        let target = seed_memory(&db, &embedder, "the quick brown fox").await;
        seed_memory(&db, &embedder, "astronomy telescope nebula cluster").await;

        let config = RetrievalConfig {
            strategy: RetrievalStrategy::SemanticChunks,
            content_types: ContentTypeMask::Memories,
            ..RetrievalConfig::default()
        };
        let response = retrieve(&db, &embedder, None, "quick brown fox", &tenant(), config)
            .await
            .expect("retrieve");

        assert_eq!(response.strategy_used, RetrievalStrategy::SemanticChunks);
        assert!(!response.items.is_empty());
        assert_eq!(response.items[0].item.id, target);
        assert!(response.items[0].score > 0.0);
        assert!(response.items[0].sources.contains(&Source::Vector));
    }

    #[tokio::test]
    async fn hybrid_merges_vector_and_fts_sources() {
        let (db, embedder) = setup().await;
        let target = seed_memory(&db, &embedder, "tokio cooperative scheduling fairness").await;

        let config = RetrievalConfig {
            strategy: RetrievalStrategy::Hybrid,
            content_types: ContentTypeMask::Memories,
            ..RetrievalConfig::default()
        };
        let response = retrieve(
            &db,
            &embedder,
            None,
            "tokio cooperative scheduling",
            &tenant(),
            config,
        )
        .await
        .expect("retrieve");

        let top = &response.items[0];
        assert_eq!(top.item.id, target);
        assert!(top.sources.contains(&Source::Vector));
        assert!(top.sources.contains(&Source::Fts));
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (db, embedder) = setup().await;
        let result = retrieve(
            &db,
            &embedder,
            None,
            "   ",
            &tenant(),
            RetrievalConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn pagination_applies_offset_and_limit() {
        let (db, embedder) = setup().await;
        for n in 0..5 {
            seed_memory(&db, &embedder, &format!("shared retrieval subject number {n}")).await;
        }

        let mut config = RetrievalConfig {
            strategy: RetrievalStrategy::SemanticChunks,
            content_types: ContentTypeMask::Memories,
            ..RetrievalConfig::default()
        };
        config.limit = 2;
        let first_page = retrieve(
            &db,
            &embedder,
            None,
            "shared retrieval subject",
            &tenant(),
            config.clone(),
        )
        .await
        .expect("retrieve");
        assert_eq!(first_page.items.len(), 2);
        assert_eq!(first_page.total, 5);

        config.offset = 4;
        let last_page = retrieve(
            &db,
            &embedder,
            None,
            "shared retrieval subject",
            &tenant(),
            config,
        )
        .await
        .expect("retrieve");
        assert_eq!(last_page.items.len(), 1);
    }

    #[tokio::test]
    async fn rerank_reorders_with_capability_scores() {
        let (db, embedder) = setup().await;
        seed_memory(&db, &embedder, "completely unrelated cooking recipe").await;
        let target = seed_memory(&db, &embedder, "rust borrow checker lifetimes guide").await;

        let reranker = LexicalReranker;
        let mut config = RetrievalConfig {
            strategy: RetrievalStrategy::SemanticChunks,
            content_types: ContentTypeMask::Memories,
            ..RetrievalConfig::default()
        };
        config.rerank = true;
        let response = retrieve(
            &db,
            &embedder,
            Some(&reranker),
            "rust borrow checker",
            &tenant(),
            config,
        )
        .await
        .expect("retrieve");

        assert!(response.reranked);
        assert_eq!(response.items[0].item.id, target);
    }

    #[tokio::test]
    async fn metadata_filter_contributes_candidates() {
        let (db, embedder) = setup().await;
        let memory = Memory::new(
            &tenant(),
            "tagged deploy note".into(),
            "h-tagged".into(),
            vec!["deploy".into()],
            None,
            None,
        );
        db.store_item(memory.clone()).await.expect("store");
        let embedding = embedder
            .embed("tagged deploy note", EmbeddingKind::Document)
            .await
            .expect("embed");
        MemoryEmbedding::new(&memory, embedding)
            .upsert(&db)
            .await
            .expect("embedding");

        let config = RetrievalConfig {
            strategy: RetrievalStrategy::Hybrid,
            content_types: ContentTypeMask::Memories,
            filter: MetadataFilter {
                tags: vec!["deploy".into()],
                session_id: None,
            },
            ..RetrievalConfig::default()
        };
        let response = retrieve(&db, &embedder, None, "deploy note", &tenant(), config)
            .await
            .expect("retrieve");

        let top = &response.items[0];
        assert!(top.sources.contains(&Source::Metadata));
    }

    #[tokio::test]
    async fn graph_traversal_on_empty_graph_returns_empty() {
        let (db, embedder) = setup().await;

        let config = RetrievalConfig {
            strategy: RetrievalStrategy::GraphTraversal,
            ..RetrievalConfig::default()
        };
        let response = retrieve(&db, &embedder, None, "anything", &tenant(), config)
            .await
            .expect("retrieve");

        assert!(response.items.is_empty());
        assert_eq!(response.reports.len(), 1);
        assert!(response.reports[0].ok);
    }
}
