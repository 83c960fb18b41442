mod services;
mod state;

pub use services::{DefaultEnrichmentServices, EnrichmentServices};

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tracing::{debug, info, warn};

use common::{
    error::AppError,
    storage::{
        cache::CacheStore,
        db::SurrealDbClient,
        types::{
            enrichment_job::{EnrichmentJob, JobStatus},
            entity::{Entity, EntityEmbedding},
            episode::Episode,
            memory::{EnrichmentStatus, Memory},
            relationship::Relationship,
        },
    },
};

use self::state::ready;
use state_machines::core::GuardError;

#[derive(Debug, Clone)]
pub struct EnrichmentTuning {
    pub max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_backoff_cap_exponent: u32,
}

impl Default for EnrichmentTuning {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_secs: 1,
            retry_max_delay_secs: 60,
            retry_backoff_cap_exponent: 5,
        }
    }
}

/// Processes one claimed job at a time: extract entities, converge the graph,
/// extract facts, summarize, then settle the job and the memory row.
pub struct EnrichmentPipeline {
    db: Arc<SurrealDbClient>,
    events: CacheStore,
    services: Arc<dyn EnrichmentServices>,
    tuning: EnrichmentTuning,
}

impl EnrichmentPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        events: CacheStore,
        services: Arc<dyn EnrichmentServices>,
        tuning: EnrichmentTuning,
    ) -> Self {
        Self {
            db,
            events,
            services,
            tuning,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(
            job_id = %job.id,
            attempt = job.attempts,
            worker_id = job.worker_id.as_deref().unwrap_or("unknown-worker")
        )
    )]
    pub async fn process_job(&self, job: EnrichmentJob) -> Result<(), AppError> {
        self.publish("job:active", json!({"job_id": job.id, "attempt": job.attempts}))
            .await;

        match self.drive_pipeline(&job).await {
            Ok(()) => {
                EnrichmentJob::mark_completed(&job.id, &self.db).await?;
                Memory::set_enrichment_status(&job.id, EnrichmentStatus::Enriched, &self.db)
                    .await?;
                self.publish(
                    "enrichment:complete",
                    json!({"memory_id": job.payload.memory_id}),
                )
                .await;
                self.publish("job:completed", json!({"job_id": job.id})).await;
                info!(job_id = %job.id, attempt = job.attempts, "enrichment job succeeded");
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                debug!(job_id = %job.id, error = %reason, "enrichment pipeline failed");

                let retryable = !matches!(err, AppError::Validation(_) | AppError::LLMParsing(_))
                    && job.attempts < self.tuning.max_attempts;

                let status = if retryable {
                    let delay = self.retry_delay(job.attempts);
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        retry_in_secs = delay.as_secs(),
                        "enrichment job failed; scheduled retry"
                    );
                    EnrichmentJob::mark_failed(&job.id, &reason, Some(delay), &self.db).await?
                } else {
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        "enrichment job failed permanently"
                    );
                    Memory::set_enrichment_status(&job.id, EnrichmentStatus::Failed, &self.db)
                        .await?;
                    EnrichmentJob::mark_failed(&job.id, &reason, None, &self.db).await?
                };

                self.publish(
                    "job:failed",
                    json!({
                        "job_id": job.id,
                        "attempt": job.attempts,
                        "permanent": status == JobStatus::Failed,
                        "error": reason,
                    }),
                )
                .await;

                Err(AppError::Processing(reason))
            }
        }
    }

    async fn drive_pipeline(&self, job: &EnrichmentJob) -> Result<(), AppError> {
        let payload = &job.payload;
        let tenant = &payload.tenant;
        let machine = ready();

        // The episode node anchors the mention edges, so it is written first
        // with an empty summary and updated once the summary exists.
        Episode::new(
            &payload.memory_id,
            payload.episode_type.clone(),
            String::new(),
            tenant,
        )
        .upsert(&self.db)
        .await?;

        let drafts = self
            .services
            .extract_entities(&payload.content, &payload.pre_identified_entities)
            .await?;
        let machine = machine
            .extract()
            .map_err(|(_, guard)| map_guard_error("extract", &guard))?;
        self.report_progress(&job.id, 30).await;

        let entity_ids = Entity::merge_batch(&payload.memory_id, &drafts, tenant, &self.db).await?;
        for (draft, entity_id) in drafts.iter().zip(entity_ids.iter()) {
            let embedding = self.services.embed_entity(draft).await?;
            EntityEmbedding::new(entity_id, embedding, tenant)
                .upsert(&self.db)
                .await?;
        }
        let machine = machine
            .link()
            .map_err(|(_, guard)| map_guard_error("link", &guard))?;
        self.report_progress(&job.id, 50).await;

        let facts = self
            .services
            .extract_facts(&payload.content, &drafts)
            .await?;
        self.report_progress(&job.id, 70).await;

        let written = Relationship::merge_facts(
            &payload.memory_id,
            &facts,
            &entity_ids,
            tenant,
            &self.db,
        )
        .await?;
        let machine = machine
            .relate()
            .map_err(|(_, guard)| map_guard_error("relate", &guard))?;
        self.report_progress(&job.id, 85).await;

        let summary = self.services.summarize(&payload.content).await?;
        Episode::new(
            &payload.memory_id,
            payload.episode_type.clone(),
            summary,
            tenant,
        )
        .upsert(&self.db)
        .await?;
        let machine = machine
            .summarize()
            .map_err(|(_, guard)| map_guard_error("summarize", &guard))?;
        self.report_progress(&job.id, 95).await;

        let _machine = machine
            .persist()
            .map_err(|(_, guard)| map_guard_error("persist", &guard))?;

        debug!(
            job_id = %job.id,
            entities = entity_ids.len(),
            facts = written,
            "graph writes converged"
        );

        Ok(())
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let capped_attempt = attempt
            .saturating_sub(1)
            .min(self.tuning.retry_backoff_cap_exponent);
        let multiplier = 2_u64.pow(capped_attempt);
        let delay = self.tuning.retry_base_delay_secs.saturating_mul(multiplier);

        Duration::from_secs(delay.min(self.tuning.retry_max_delay_secs))
    }

    async fn report_progress(&self, job_id: &str, progress: u8) {
        if let Err(err) = EnrichmentJob::mark_progress(job_id, progress, &self.db).await {
            warn!(job_id = %job_id, error = %err, "failed to persist job progress");
        }
        self.publish("job:progress", json!({"job_id": job_id, "progress": progress}))
            .await;
    }

    async fn publish(&self, subject: &str, payload: serde_json::Value) {
        if let Err(err) = self.events.publish(subject, payload).await {
            warn!(subject, error = %err, "failed to publish queue event");
        }
    }
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid enrichment pipeline transition during {event}: {guard:?}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::types::{
        enrichment_job::{EnrichmentJob, EnrichmentPayload, JobStatus},
        entity::EntityDraft,
        relationship::{Directionality, FactDraft},
        tenant::TenantContext,
    };
    use common::utils::triage::TriageDecision;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    struct FakeServices {
        fail_facts: AtomicBool,
        fail_entities_with_validation: AtomicBool,
    }

    impl FakeServices {
        fn new() -> Self {
            Self {
                fail_facts: AtomicBool::new(false),
                fail_entities_with_validation: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EnrichmentServices for FakeServices {
        async fn extract_entities(
            &self,
            _content: &str,
            pre_identified: &[String],
        ) -> Result<Vec<EntityDraft>, AppError> {
            if self.fail_entities_with_validation.load(Ordering::SeqCst) {
                return Err(AppError::Validation("content makes no sense".into()));
            }
            let mut names = vec!["Orion".to_string(), "Dana".to_string()];
            names.extend(pre_identified.iter().cloned());
            Ok(names
                .into_iter()
                .map(|name| EntityDraft {
                    name,
                    domain: "general".into(),
                    entity_type: "concept".into(),
                    hierarchy_level: 0,
                    content: "extracted".into(),
                    confidence: 0.8,
                    parent: None,
                })
                .collect())
        }

        async fn extract_facts(
            &self,
            _content: &str,
            entities: &[EntityDraft],
        ) -> Result<Vec<FactDraft>, AppError> {
            if self.fail_facts.load(Ordering::SeqCst) {
                return Err(AppError::Unavailable("llm down".into()));
            }
            if entities.len() < 2 {
                return Ok(Vec::new());
            }
            Ok(vec![FactDraft {
                subject: entities[0].name.clone(),
                predicate: "works_with".into(),
                object: entities[1].name.clone(),
                confidence: 0.7,
                weight: 0.9,
                directionality: Directionality::Bidirectional,
            }])
        }

        async fn summarize(&self, _content: &str) -> Result<String, AppError> {
            Ok("A short episodic summary.".into())
        }

        async fn embed_entity(&self, _draft: &EntityDraft) -> Result<Vec<f32>, AppError> {
            Ok(vec![0.5, 0.5, 0.0])
        }
    }

    fn tenant() -> TenantContext {
        TenantContext::new("acme").with_user("u1")
    }

    fn payload(memory_id: &str) -> EnrichmentPayload {
        EnrichmentPayload {
            memory_id: memory_id.into(),
            content: "Orion is maintained by Dana".into(),
            tenant: tenant(),
            decision: TriageDecision::ExtractEntities,
            pre_identified_entities: Vec::new(),
            episode_type: None,
        }
    }

    async fn setup() -> (Arc<SurrealDbClient>, CacheStore) {
        let database = &Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("pipeline_ns", database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("init definitions");
        let cache = CacheStore::new((*db).clone());
        (db, cache)
    }

    async fn seed_memory_and_claim(db: &Arc<SurrealDbClient>, memory_id: &str) -> EnrichmentJob {
        let memory = Memory::new(
            &tenant(),
            "Orion is maintained by Dana".into(),
            format!("hash-{memory_id}"),
            vec![],
            None,
            None,
        );
        let memory = Memory {
            id: memory_id.to_string(),
            ..memory
        };
        db.store_item(memory).await.expect("store memory");

        EnrichmentJob::new(payload(memory_id), 0)
            .enqueue(db)
            .await
            .expect("enqueue");
        EnrichmentJob::claim_next_ready(db, "test-worker", chrono::Utc::now(), Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("job ready")
    }

    #[tokio::test]
    async fn successful_job_converges_graph_and_settles() {
        let (db, cache) = setup().await;
        let job = seed_memory_and_claim(&db, "m1").await;

        let pipeline = EnrichmentPipeline::new(
            Arc::clone(&db),
            cache,
            Arc::new(FakeServices::new()),
            EnrichmentTuning::default(),
        );

        pipeline.process_job(job).await.expect("job should succeed");

        let entities: Vec<Entity> = db.get_all_stored_items().await.expect("entities");
        assert_eq!(entities.len(), 2);

        let edges: Vec<Relationship> = db.get_all_stored_items().await.expect("edges");
        assert_eq!(edges.len(), 1);

        let episodes: Vec<Episode> = db.get_all_stored_items().await.expect("episodes");
        assert_eq!(episodes.len(), 1);
        assert!(!episodes[0].summary.is_empty());

        let memory: Memory = db.get_item("m1").await.expect("fetch").expect("memory");
        assert_eq!(memory.enrichment_status, EnrichmentStatus::Enriched);

        let settled: EnrichmentJob = db.get_item("m1").await.expect("fetch").expect("job");
        assert_eq!(settled.status, JobStatus::Completed);
        assert_eq!(settled.progress, 100);
    }

    #[tokio::test]
    async fn redelivery_produces_identical_graph_state() {
        let (db, cache) = setup().await;
        let job = seed_memory_and_claim(&db, "m1").await;

        let pipeline = EnrichmentPipeline::new(
            Arc::clone(&db),
            cache,
            Arc::new(FakeServices::new()),
            EnrichmentTuning::default(),
        );

        pipeline
            .process_job(job.clone())
            .await
            .expect("first delivery");

        // Simulate a redelivery of the same job id.
        pipeline.process_job(job).await.expect("second delivery");

        let entities: Vec<Entity> = db.get_all_stored_items().await.expect("entities");
        assert_eq!(entities.len(), 2, "entity nodes must converge");
        for entity in &entities {
            assert_eq!(entity.mention_count, 1, "mentions must not double-count");
        }

        let edges: Vec<Relationship> = db.get_all_stored_items().await.expect("edges");
        assert_eq!(edges.len(), 1, "fact edges must converge");
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry() {
        let (db, cache) = setup().await;
        let job = seed_memory_and_claim(&db, "m1").await;

        let services = Arc::new(FakeServices::new());
        services.fail_facts.store(true, Ordering::SeqCst);

        let pipeline = EnrichmentPipeline::new(
            Arc::clone(&db),
            cache,
            Arc::clone(&services) as Arc<dyn EnrichmentServices>,
            EnrichmentTuning {
                retry_base_delay_secs: 0,
                ..EnrichmentTuning::default()
            },
        );

        let result = pipeline.process_job(job).await;
        assert!(result.is_err());

        let stored: EnrichmentJob = db.get_item("m1").await.expect("fetch").expect("job");
        assert_eq!(stored.status, JobStatus::Delayed);

        // Partial graph state is acceptable: the entity pass already ran and
        // the next delivery re-converges.
        let memory: Memory = db.get_item("m1").await.expect("fetch").expect("memory");
        assert_eq!(memory.enrichment_status, EnrichmentStatus::Pending);
    }

    #[tokio::test]
    async fn validation_failure_is_permanent() {
        let (db, cache) = setup().await;
        let job = seed_memory_and_claim(&db, "m1").await;

        let services = Arc::new(FakeServices::new());
        services
            .fail_entities_with_validation
            .store(true, Ordering::SeqCst);

        let pipeline = EnrichmentPipeline::new(
            Arc::clone(&db),
            cache,
            services as Arc<dyn EnrichmentServices>,
            EnrichmentTuning::default(),
        );

        let result = pipeline.process_job(job).await;
        assert!(result.is_err());

        let stored: EnrichmentJob = db.get_item("m1").await.expect("fetch").expect("job");
        assert_eq!(stored.status, JobStatus::Failed);

        let memory: Memory = db.get_item("m1").await.expect("fetch").expect("memory");
        assert_eq!(memory.enrichment_status, EnrichmentStatus::Failed);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_permanently() {
        let (db, cache) = setup().await;

        // Drive the job to its final attempt.
        let _first = seed_memory_and_claim(&db, "m1").await;
        EnrichmentJob::mark_failed("m1", "boom", Some(Duration::from_secs(0)), &db)
            .await
            .expect("fail once");
        let later = chrono::Utc::now() + chrono::Duration::seconds(1);
        let _second =
            EnrichmentJob::claim_next_ready(&db, "w", later, Duration::from_secs(60))
                .await
                .expect("claim")
                .expect("ready");
        EnrichmentJob::mark_failed("m1", "boom", Some(Duration::from_secs(0)), &db)
            .await
            .expect("fail twice");
        let third = EnrichmentJob::claim_next_ready(
            &db,
            "w",
            later + chrono::Duration::seconds(1),
            Duration::from_secs(60),
        )
        .await
        .expect("claim")
        .expect("ready");
        assert_eq!(third.attempts, 3);

        let services = Arc::new(FakeServices::new());
        services.fail_facts.store(true, Ordering::SeqCst);

        let pipeline = EnrichmentPipeline::new(
            Arc::clone(&db),
            cache,
            services as Arc<dyn EnrichmentServices>,
            EnrichmentTuning::default(),
        );

        let result = pipeline.process_job(third).await;
        assert!(result.is_err());

        let stored: EnrichmentJob = db.get_item("m1").await.expect("fetch").expect("job");
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn retry_delay_is_exponential_and_capped() {
        let (db, cache) = setup().await;
        let pipeline = EnrichmentPipeline::new(
            db,
            cache,
            Arc::new(FakeServices::new()),
            EnrichmentTuning {
                retry_base_delay_secs: 1,
                retry_max_delay_secs: 8,
                retry_backoff_cap_exponent: 5,
                max_attempts: 3,
            },
        );

        assert_eq!(pipeline.retry_delay(1), Duration::from_secs(1));
        assert_eq!(pipeline.retry_delay(2), Duration::from_secs(2));
        assert_eq!(pipeline.retry_delay(3), Duration::from_secs(4));
        assert_eq!(pipeline.retry_delay(4), Duration::from_secs(8));
        assert_eq!(pipeline.retry_delay(10), Duration::from_secs(8));
    }
}
