use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    stored_object,
    utils::triage::TriageDecision,
};

use super::tenant::TenantContext;

pub const DEFAULT_LEASE_SECS: u64 = 60;

/// Everything a worker needs to enrich one memory, carried on the job row so
/// processing never depends on the router still being alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentPayload {
    pub memory_id: String,
    pub content: String,
    pub tenant: TenantContext,
    pub decision: TriageDecision,
    #[serde(default)]
    pub pre_identified_entities: Vec<String>,
    #[serde(default)]
    pub episode_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// Outcome of an enqueue attempt. `Deduplicated` means a job for the memory
/// already exists; at-least-once delivery makes that a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Deduplicated,
}

stored_object!(EnrichmentJob, "enrichment_job", {
    payload: EnrichmentPayload,
    priority: i32,
    status: JobStatus,
    attempts: u32,
    progress: u8,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    lease_expires_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error: Option<String>
});

impl EnrichmentJob {
    pub fn new(payload: EnrichmentPayload, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            // jobId = memoryId: re-enqueueing the same memory deduplicates.
            id: payload.memory_id.clone(),
            created_at: now,
            updated_at: now,
            payload,
            priority,
            status: JobStatus::Queued,
            attempts: 0,
            progress: 0,
            worker_id: None,
            lease_expires_at: None,
            retry_at: None,
            last_error: None,
        }
    }

    /// Insert the job; an existing row for the memory id is a dedup hit, not
    /// an error.
    pub async fn enqueue(self, db: &SurrealDbClient) -> Result<EnqueueOutcome, AppError> {
        match db.store_item(self).await {
            Ok(_) => Ok(EnqueueOutcome::Enqueued),
            Err(err) if err.to_string().contains("already exists") => {
                Ok(EnqueueOutcome::Deduplicated)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically claim the next ready job for `worker_id`.
    ///
    /// Ready means queued, delayed past its retry time, or active with a
    /// lapsed lease (a stalled worker). The claim takes a fresh lease and
    /// bumps the attempt counter in the same statement.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: std::time::Duration,
    ) -> Result<Option<Self>, AppError> {
        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| AppError::Validation(format!("invalid lease duration: {e}")))?;

        let mut response = db
            .query(
                "LET $ready = (
                     SELECT VALUE id FROM enrichment_job
                     WHERE status = 'queued'
                        OR (status = 'delayed' AND retry_at != NONE AND retry_at <= $now)
                        OR (status = 'active' AND lease_expires_at != NONE \
                            AND lease_expires_at <= $now)
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1
                 );
                 UPDATE $ready SET
                     status = 'active',
                     worker_id = $worker_id,
                     attempts += 1,
                     lease_expires_at = $lease_until,
                     retry_at = NONE,
                     updated_at = time::now()
                 RETURN AFTER;",
            )
            .bind(("now", surrealdb::sql::Datetime::from(now)))
            .bind(("worker_id", worker_id.to_owned()))
            .bind(("lease_until", surrealdb::sql::Datetime::from(lease_until)))
            .await?;

        let rows: Vec<Self> = response.take(1)?;
        Ok(rows.into_iter().next())
    }

    pub async fn mark_progress(id: &str, progress: u8, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('enrichment_job', $id) SET \
             progress = $progress, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .bind(("progress", progress.min(100)))
        .await?
        .check()?;

        Ok(())
    }

    pub async fn mark_completed(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('enrichment_job', $id) SET \
             status = 'completed', progress = 100, worker_id = NONE, \
             lease_expires_at = NONE, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .await?
        .check()?;

        Ok(())
    }

    /// Record a failure. Below the attempt ceiling the job is delayed for
    /// `retry_in`; at the ceiling it becomes a permanent failure.
    pub async fn mark_failed(
        id: &str,
        error: &str,
        retry_in: Option<std::time::Duration>,
        db: &SurrealDbClient,
    ) -> Result<JobStatus, AppError> {
        let status = match retry_in {
            Some(_) => JobStatus::Delayed,
            None => JobStatus::Failed,
        };
        let retry_at = retry_in
            .map(|delay| {
                chrono::Duration::from_std(delay)
                    .map(|d| surrealdb::sql::Datetime::from(Utc::now() + d))
                    .map_err(|e| AppError::Validation(format!("invalid retry delay: {e}")))
            })
            .transpose()?;

        db.query(
            "UPDATE type::thing('enrichment_job', $id) SET \
             status = $status, last_error = $error, retry_at = $retry_at, \
             worker_id = NONE, lease_expires_at = NONE, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .bind(("status", status))
        .bind(("error", error.to_owned()))
        .bind(("retry_at", retry_at))
        .await?
        .check()?;

        Ok(status)
    }

    /// Number of jobs not yet settled; the backpressure signal.
    pub async fn depth(db: &SurrealDbClient) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct Row {
            count: u64,
        }

        let mut response = db
            .query(
                "SELECT count() AS count FROM enrichment_job \
                 WHERE status IN ['queued', 'active', 'delayed'] GROUP ALL",
            )
            .await?;
        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.first().map_or(0, |r| r.count as usize))
    }

    /// Drop settled jobs past their retention windows. Completed and failed
    /// jobs are retained for different lengths.
    pub async fn sweep_retention(
        completed_retention_secs: i64,
        failed_retention_secs: i64,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let completed_cutoff = now - chrono::Duration::seconds(completed_retention_secs);
        let failed_cutoff = now - chrono::Duration::seconds(failed_retention_secs);

        db.query(
            "DELETE enrichment_job WHERE status = 'completed' AND updated_at < $completed_cutoff;
             DELETE enrichment_job WHERE status = 'failed' AND updated_at < $failed_cutoff;",
        )
        .bind((
            "completed_cutoff",
            surrealdb::sql::Datetime::from(completed_cutoff),
        ))
        .bind((
            "failed_cutoff",
            surrealdb::sql::Datetime::from(failed_cutoff),
        ))
        .await?
        .check()?;

        Ok(())
    }
}
