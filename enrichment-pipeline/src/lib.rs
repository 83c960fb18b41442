#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod pipeline;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::storage::{
    cache::CacheStore,
    db::SurrealDbClient,
    types::enrichment_job::{EnrichmentJob, DEFAULT_LEASE_SECS},
};
pub use pipeline::{DefaultEnrichmentServices, EnrichmentPipeline, EnrichmentServices};

/// Spreads claims across the pool so the queue drains at a bounded rate.
pub struct RateLimiter {
    min_interval: Duration,
    last_pass: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_second(rate: u32) -> Self {
        let rate = rate.max(1);
        Self {
            min_interval: Duration::from_micros(1_000_000 / u64::from(rate)),
            last_pass: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let wait_until = {
            let mut last = self.last_pass.lock().await;
            let now = Instant::now();
            let next = match *last {
                Some(prev) => (prev + self.min_interval).max(now),
                None => now,
            };
            *last = Some(next);
            next
        };

        tokio::time::sleep_until(wait_until).await;
    }
}

#[derive(Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub rate_per_sec: u32,
    pub lease: Duration,
    pub idle_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_per_sec: 10,
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            idle_backoff: Duration::from_millis(500),
        }
    }
}

/// Run `concurrency` cooperating workers until cancelled. Each worker claims
/// one job at a time; stalled jobs come back through the shared claim query
/// once their lease lapses.
pub async fn run_worker_pool(
    db: Arc<SurrealDbClient>,
    events: CacheStore,
    enrichment_pipeline: Arc<EnrichmentPipeline>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
) {
    let limiter = Arc::new(RateLimiter::per_second(config.rate_per_sec));

    let mut handles = Vec::with_capacity(config.concurrency);
    for _ in 0..config.concurrency.max(1) {
        let db = Arc::clone(&db);
        let events = events.clone();
        let pipeline = Arc::clone(&enrichment_pipeline);
        let limiter = Arc::clone(&limiter);
        let config = config.clone();
        let shutdown = shutdown.clone();

        handles.push(tokio::spawn(async move {
            run_worker_loop(db, events, pipeline, limiter, config, shutdown).await;
        }));
    }

    for handle in handles {
        if let Err(err) = handle.await {
            error!(error = %err, "worker task panicked");
        }
    }
}

async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    events: CacheStore,
    enrichment_pipeline: Arc<EnrichmentPipeline>,
    limiter: Arc<RateLimiter>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
) {
    let worker_id = format!("enrichment-worker-{}", Uuid::new_v4());
    info!(%worker_id, "worker started");

    loop {
        if shutdown.is_cancelled() {
            info!(%worker_id, "worker draining");
            break;
        }

        limiter.acquire().await;

        match EnrichmentJob::claim_next_ready(&db, &worker_id, Utc::now(), config.lease).await {
            Ok(Some(job)) => {
                let job_id = job.id.clone();
                info!(%worker_id, %job_id, attempt = job.attempts, "claimed enrichment job");

                // A reclaim (attempt > 1 with no recorded failure) means the
                // previous worker stalled mid-flight.
                if job.attempts > 1 && job.last_error.is_none() {
                    if let Err(err) = events
                        .publish(
                            "job:stalled",
                            json!({"job_id": job_id, "attempt": job.attempts}),
                        )
                        .await
                    {
                        warn!(error = %err, "failed to publish stall event");
                    }
                }

                if let Err(err) = enrichment_pipeline.process_job(job).await {
                    error!(%worker_id, %job_id, error = %err, "enrichment job failed");
                }
            }
            Ok(None) => {
                sleep(config.idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim enrichment job");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Periodic retention sweep for settled jobs plus cache eviction.
pub async fn run_maintenance_loop(
    db: Arc<SurrealDbClient>,
    cache: CacheStore,
    completed_retention_secs: i64,
    failed_retention_secs: i64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(interval) => {}
        }

        if let Err(err) =
            EnrichmentJob::sweep_retention(completed_retention_secs, failed_retention_secs, &db)
                .await
        {
            warn!(error = %err, "job retention sweep failed");
        }
        if let Err(err) = cache.evict_expired().await {
            warn!(error = %err, "cache eviction failed");
        }
    }
}
