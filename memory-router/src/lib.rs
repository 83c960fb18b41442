#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod locks;
pub mod services;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            enrichment_job::{EnrichmentJob, EnrichmentPayload},
            memory::Memory,
            tenant::TenantContext,
        },
    },
    utils::{
        hashing::content_hash,
        triage::{TriageDecision, TriageHints},
    },
};

use locks::KeyedLocks;
pub use services::{DefaultRouterServices, RouterServices};

/// Which stores a write touched, in the order they were taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePath {
    Relational,
    Vector,
    Cache,
    EnrichmentQueued,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreMemoryRequest {
    pub content: String,
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

#[derive(Debug, Clone, Serialize)]
pub struct StoreMemoryOutcome {
    pub memory_id: String,
    pub content_hash: String,
    pub storage_paths: Vec<StoragePath>,
    pub triage_decision: TriageDecision,
    pub duplicate: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreMemoryAsyncOutcome {
    pub memory_id: String,
    pub status: &'static str,
    pub content_hash: String,
    pub storage_paths: Vec<StoragePath>,
    pub latency_ms: u64,
}

/// The single write entry point for memories: dedupe, triage, fan out to the
/// primary stores with compensation, then hand enrichment to the queue.
pub struct MemoryRouter {
    services: Arc<dyn RouterServices>,
    locks: KeyedLocks,
}

impl MemoryRouter {
    pub fn new(services: Arc<dyn RouterServices>) -> Self {
        Self {
            services,
            locks: KeyedLocks::new(),
        }
    }

    #[instrument(skip_all, fields(company_id = %tenant.company_id))]
    pub async fn store_sync(
        &self,
        request: StoreMemoryRequest,
        tenant: TenantContext,
    ) -> Result<StoreMemoryOutcome, AppError> {
        let started = Instant::now();
        let tenant = tenant.validated()?;
        validate_content(&request.content)?;

        let hash = content_hash(&request.content);
        let lock_key = format!("{}:{hash}", tenant.scope_key());
        let _guard = self.locks.acquire(&lock_key).await;

        if let Some(memory_id) = self.lookup_duplicate(&tenant, &hash).await? {
            return Ok(StoreMemoryOutcome {
                memory_id,
                content_hash: hash,
                storage_paths: Vec::new(),
                triage_decision: TriageDecision::StoreOnly,
                duplicate: true,
                latency_ms: elapsed_ms(started),
            });
        }

        let embedding = self.services.embed(&request.content).await?;

        let hints = hints_of(&request);
        let decision = self.services.triage(&request.content, &hints).await?;

        let memory = Memory::new(
            &tenant,
            request.content.clone(),
            hash.clone(),
            request.tags.clone(),
            request.metadata.clone(),
            request.importance,
        );

        let mut storage_paths = self.write_primary_stores(&memory, embedding).await?;

        // Cache and enqueue are best-effort from here on: the memory is
        // durable, failures only delay enrichment or warm reads.
        if self
            .services
            .cache_put(&tenant, &hash, &memory.id)
            .await
            .map_err(|err| warn!(error = %err, "cache write failed"))
            .is_ok()
        {
            storage_paths.push(StoragePath::Cache);
        }

        let wants_enrichment = decision != TriageDecision::StoreOnly
            || request.force_entity_extraction
            || request.force_episodic_storage;
        if wants_enrichment {
            let payload = enrichment_payload(&memory, &request, &tenant, decision);
            match self.services.enqueue_enrichment(payload, priority_of(&request)).await {
                Ok(_) => storage_paths.push(StoragePath::EnrichmentQueued),
                Err(err) => {
                    warn!(error = %err, memory_id = %memory.id, "enrichment enqueue failed; sweeper will repair");
                }
            }
        }

        info!(
            memory_id = %memory.id,
            decision = %decision,
            paths = ?storage_paths,
            "memory stored"
        );

        Ok(StoreMemoryOutcome {
            memory_id: memory.id,
            content_hash: hash,
            storage_paths,
            triage_decision: decision,
            duplicate: false,
            latency_ms: elapsed_ms(started),
        })
    }

    /// Async-first contract: primary stores only, enrichment scheduled off
    /// the request path. Budgeted to stay well under 200 ms.
    #[instrument(skip_all, fields(company_id = %tenant.company_id))]
    pub async fn store_async(
        self: &Arc<Self>,
        request: StoreMemoryRequest,
        tenant: TenantContext,
    ) -> Result<StoreMemoryAsyncOutcome, AppError> {
        let started = Instant::now();
        let tenant = tenant.validated()?;
        validate_content(&request.content)?;

        let hash = content_hash(&request.content);
        let lock_key = format!("{}:{hash}", tenant.scope_key());
        let _guard = self.locks.acquire(&lock_key).await;

        if let Some(memory_id) = self.lookup_duplicate(&tenant, &hash).await? {
            return Ok(StoreMemoryAsyncOutcome {
                memory_id,
                status: "accepted",
                content_hash: hash,
                storage_paths: Vec::new(),
                latency_ms: elapsed_ms(started),
            });
        }

        let embedding = self.services.embed(&request.content).await?;

        let memory = Memory::new(
            &tenant,
            request.content.clone(),
            hash.clone(),
            request.tags.clone(),
            request.metadata.clone(),
            request.importance,
        );

        let storage_paths = self.write_primary_stores(&memory, embedding).await?;

        let router = Arc::clone(self);
        let memory_id = memory.id.clone();
        let deferred_hash = hash.clone();
        tokio::spawn(async move {
            router
                .schedule_deferred_enrichment(memory, request, tenant, deferred_hash)
                .await;
        });

        Ok(StoreMemoryAsyncOutcome {
            memory_id,
            status: "accepted",
            content_hash: hash,
            storage_paths,
            latency_ms: elapsed_ms(started),
        })
    }

    async fn schedule_deferred_enrichment(
        &self,
        memory: Memory,
        request: StoreMemoryRequest,
        tenant: TenantContext,
        hash: String,
    ) {
        if let Err(err) = self.services.cache_put(&tenant, &hash, &memory.id).await {
            warn!(error = %err, "cache write failed");
        }

        let hints = hints_of(&request);
        let decision = match self.services.triage(&request.content, &hints).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, "deferred triage failed; defaulting to extraction");
                TriageDecision::ExtractEntities
            }
        };

        let wants_enrichment = decision != TriageDecision::StoreOnly
            || request.force_entity_extraction
            || request.force_episodic_storage;
        if !wants_enrichment {
            return;
        }

        let payload = enrichment_payload(&memory, &request, &tenant, decision);
        if let Err(err) = self
            .services
            .enqueue_enrichment(payload, priority_of(&request))
            .await
        {
            warn!(error = %err, memory_id = %memory.id, "deferred enqueue failed; sweeper will repair");
        }
    }

    async fn lookup_duplicate(
        &self,
        tenant: &TenantContext,
        hash: &str,
    ) -> Result<Option<String>, AppError> {
        if let Some(hit) = self
            .services
            .cache_get(tenant, hash)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "cache read failed");
                None
            })
        {
            return Ok(Some(hit));
        }

        self.services.find_duplicate(tenant, hash).await
    }

    /// Fan out to the relational row and the vector point. Both must land;
    /// a one-sided failure deletes the side that did land before erroring.
    async fn write_primary_stores(
        &self,
        memory: &Memory,
        embedding: Vec<f32>,
    ) -> Result<Vec<StoragePath>, AppError> {
        let (relational, vector) = tokio::join!(
            self.services.insert_memory(memory),
            self.services.upsert_vector(memory, embedding),
        );

        match (relational, vector) {
            (Ok(()), Ok(())) => Ok(vec![StoragePath::Relational, StoragePath::Vector]),
            (Ok(()), Err(err)) => {
                warn!(memory_id = %memory.id, error = %err, "vector write failed; compensating row");
                if let Err(comp) = self.services.delete_memory(&memory.id).await {
                    warn!(memory_id = %memory.id, error = %comp, "compensation of relational row failed");
                }
                Err(AppError::PartialWrite(format!(
                    "vector store rejected memory {}: {err}",
                    memory.id
                )))
            }
            (Err(err), Ok(())) => {
                warn!(memory_id = %memory.id, error = %err, "relational write failed; compensating vector");
                if let Err(comp) = self.services.delete_vector(&memory.id).await {
                    warn!(memory_id = %memory.id, error = %comp, "compensation of vector point failed");
                }
                Err(err)
            }
            (Err(err), Err(vector_err)) => {
                warn!(
                    memory_id = %memory.id,
                    relational_error = %err,
                    vector_error = %vector_err,
                    "both primary writes failed"
                );
                Err(err)
            }
        }
    }
}

fn validate_content(content: &str) -> Result<(), AppError> {
    if content.trim().is_empty() {
        return Err(AppError::Validation("content is required".into()));
    }
    Ok(())
}

fn hints_of(request: &StoreMemoryRequest) -> TriageHints {
    TriageHints {
        force_entity_extraction: request.force_entity_extraction,
        force_episodic_storage: request.force_episodic_storage,
        pre_identified_entities: request.pre_identified_entities.clone(),
        episode_type: request.episode_type.clone(),
    }
}

fn enrichment_payload(
    memory: &Memory,
    request: &StoreMemoryRequest,
    tenant: &TenantContext,
    decision: TriageDecision,
) -> EnrichmentPayload {
    EnrichmentPayload {
        memory_id: memory.id.clone(),
        content: request.content.clone(),
        tenant: tenant.clone(),
        decision,
        pre_identified_entities: request.pre_identified_entities.clone(),
        episode_type: request.episode_type.clone(),
    }
}

fn priority_of(request: &StoreMemoryRequest) -> i32 {
    // Importance maps onto queue priority: urgent memories enrich first.
    request
        .importance
        .map(|importance| (importance.clamp(0.0, 1.0) * 10.0) as i32)
        .unwrap_or(0)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Re-enqueue enrichment for memories stuck in `pending` with no live job.
/// Covers enqueue failures on the write path; runs from a background timer.
pub async fn repair_pending_enrichment(
    db: &SurrealDbClient,
    older_than_secs: i64,
) -> Result<usize, AppError> {
    let cutoff = chrono::Utc::now() - chrono::Duration::seconds(older_than_secs);

    let mut response = db
        .query(
            "SELECT * FROM memory \
             WHERE enrichment_status = 'pending' AND created_at < $cutoff",
        )
        .bind(("cutoff", surrealdb::sql::Datetime::from(cutoff)))
        .await?;
    let stuck: Vec<Memory> = response.take(0)?;

    let mut repaired = 0;
    for memory in stuck {
        let existing: Option<EnrichmentJob> = db.get_item(&memory.id).await?;
        if existing.is_some() {
            continue;
        }

        let tenant = TenantContext {
            company_id: memory.company_id.clone(),
            app_id: memory.app_id.clone(),
            user_id: memory.user_id.clone(),
            session_id: memory.session_id.clone(),
            thread_id: memory.thread_id.clone(),
        };
        let payload = EnrichmentPayload {
            memory_id: memory.id.clone(),
            content: memory.content.clone(),
            tenant,
            decision: TriageDecision::ExtractEntities,
            pre_identified_entities: Vec::new(),
            episode_type: None,
        };

        EnrichmentJob::new(payload, 0).enqueue(db).await?;
        repaired += 1;
    }

    if repaired > 0 {
        info!(repaired, "re-enqueued stuck enrichment jobs");
    }

    Ok(repaired)
}
