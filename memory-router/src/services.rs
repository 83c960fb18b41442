use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use common::{
    error::AppError,
    storage::{
        cache::CacheStore,
        db::SurrealDbClient,
        types::{
            enrichment_job::{EnqueueOutcome, EnrichmentJob, EnrichmentPayload},
            memory::{Memory, MemoryEmbedding},
            tenant::TenantContext,
        },
    },
    utils::{
        embedding::{EmbeddingClient, EmbeddingKind},
        triage::{TriageClassifier, TriageDecision, TriageHints},
    },
};

/// Seam between the router's orchestration logic and the stores it writes.
/// The compensation path is exercised in tests through fallible fakes.
#[async_trait]
pub trait RouterServices: Send + Sync {
    async fn embed(&self, content: &str) -> Result<Vec<f32>, AppError>;

    async fn triage(&self, content: &str, hints: &TriageHints)
        -> Result<TriageDecision, AppError>;

    async fn find_duplicate(
        &self,
        tenant: &TenantContext,
        content_hash: &str,
    ) -> Result<Option<String>, AppError>;

    async fn insert_memory(&self, memory: &Memory) -> Result<(), AppError>;

    async fn upsert_vector(&self, memory: &Memory, embedding: Vec<f32>) -> Result<(), AppError>;

    async fn delete_memory(&self, memory_id: &str) -> Result<(), AppError>;

    async fn delete_vector(&self, memory_id: &str) -> Result<(), AppError>;

    async fn cache_put(
        &self,
        tenant: &TenantContext,
        content_hash: &str,
        memory_id: &str,
    ) -> Result<(), AppError>;

    async fn cache_get(
        &self,
        tenant: &TenantContext,
        content_hash: &str,
    ) -> Result<Option<String>, AppError>;

    async fn enqueue_enrichment(
        &self,
        payload: EnrichmentPayload,
        priority: i32,
    ) -> Result<EnqueueOutcome, AppError>;
}

const CACHE_TTL_SECS: i64 = 24 * 3_600;

pub struct DefaultRouterServices {
    db: Arc<SurrealDbClient>,
    cache: CacheStore,
    embedder: Arc<EmbeddingClient>,
    triage: Arc<dyn TriageClassifier>,
    queue_pressure_threshold: usize,
}

impl DefaultRouterServices {
    pub fn new(
        db: Arc<SurrealDbClient>,
        cache: CacheStore,
        embedder: Arc<EmbeddingClient>,
        triage: Arc<dyn TriageClassifier>,
        queue_pressure_threshold: usize,
    ) -> Self {
        Self {
            db,
            cache,
            embedder,
            triage,
            queue_pressure_threshold,
        }
    }

    fn cache_key(tenant: &TenantContext, content_hash: &str) -> String {
        format!("hash:{}:{}", tenant.scope_key(), content_hash)
    }
}

#[async_trait]
impl RouterServices for DefaultRouterServices {
    async fn embed(&self, content: &str) -> Result<Vec<f32>, AppError> {
        self.embedder.embed(content, EmbeddingKind::Document).await
    }

    async fn triage(
        &self,
        content: &str,
        hints: &TriageHints,
    ) -> Result<TriageDecision, AppError> {
        self.triage.triage(content, hints).await
    }

    async fn find_duplicate(
        &self,
        tenant: &TenantContext,
        content_hash: &str,
    ) -> Result<Option<String>, AppError> {
        Ok(Memory::find_by_content_hash(tenant, content_hash, &self.db)
            .await?
            .map(|memory| memory.id))
    }

    async fn insert_memory(&self, memory: &Memory) -> Result<(), AppError> {
        self.db.store_item(memory.clone()).await?;
        Ok(())
    }

    async fn upsert_vector(&self, memory: &Memory, embedding: Vec<f32>) -> Result<(), AppError> {
        MemoryEmbedding::new(memory, embedding).upsert(&self.db).await
    }

    async fn delete_memory(&self, memory_id: &str) -> Result<(), AppError> {
        let _removed: Option<Memory> = self.db.delete_item(memory_id).await?;
        Ok(())
    }

    async fn delete_vector(&self, memory_id: &str) -> Result<(), AppError> {
        MemoryEmbedding::delete(memory_id, &self.db).await
    }

    async fn cache_put(
        &self,
        tenant: &TenantContext,
        content_hash: &str,
        memory_id: &str,
    ) -> Result<(), AppError> {
        self.cache
            .put(
                &Self::cache_key(tenant, content_hash),
                json!(memory_id),
                CACHE_TTL_SECS,
            )
            .await
    }

    async fn cache_get(
        &self,
        tenant: &TenantContext,
        content_hash: &str,
    ) -> Result<Option<String>, AppError> {
        let value = self.cache.get(&Self::cache_key(tenant, content_hash)).await?;
        Ok(value.and_then(|v| v.as_str().map(str::to_owned)))
    }

    async fn enqueue_enrichment(
        &self,
        payload: EnrichmentPayload,
        priority: i32,
    ) -> Result<EnqueueOutcome, AppError> {
        let depth = EnrichmentJob::depth(&self.db).await?;
        if depth >= self.queue_pressure_threshold {
            warn!(
                depth,
                threshold = self.queue_pressure_threshold,
                "enrichment queue under pressure; refusing enqueue"
            );
            return Err(AppError::Unavailable("enrichment_queue_saturated".into()));
        }

        let memory_id = payload.memory_id.clone();
        let outcome = EnrichmentJob::new(payload, priority).enqueue(&self.db).await?;

        if outcome == EnqueueOutcome::Enqueued {
            if let Err(err) = self
                .cache
                .publish("job:enqueued", json!({"job_id": memory_id}))
                .await
            {
                warn!(error = %err, "failed to publish enqueue event");
            }
        }

        Ok(outcome)
    }
}
