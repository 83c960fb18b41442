use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use common::{
    error::AppError,
    storage::{cache::CacheStore, types::error_pattern::RetryStrategyKind},
};

use crate::{analyzer::RetryAnalyzer, budget::RetryBudgetManager};

/// Per-call knobs the executor honors on top of the learned strategy.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub task_id: String,
    pub service: String,
    pub operation: String,
    /// Local ceiling; the effective cap is the smaller of this and the
    /// recommended strategy's `max_retries`.
    pub max_attempts: u32,
    pub attempt_timeout: Option<Duration>,
    /// Metadata forwarded to the DLQ when the budget exhausts (original task
    /// type and params enable auto-retry).
    pub metadata: Option<Value>,
    /// Accumulated modifications recommended by the analyzer; visible to the
    /// operation on every attempt.
    pub modifications: Map<String, Value>,
}

impl RetryContext {
    pub fn new(task_id: &str, service: &str, operation: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            service: service.to_string(),
            operation: operation.to_string(),
            max_attempts: u32::MAX,
            attempt_timeout: None,
            metadata: None,
            modifications: Map::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The loop gluing analyzer and budget manager around an operation:
/// run, analyze on failure, check budget, back off (with jitter for
/// exponential strategies), apply modifications, repeat.
pub struct RetryExecutor {
    analyzer: Arc<RetryAnalyzer>,
    budget: Arc<RetryBudgetManager>,
    events: CacheStore,
}

impl RetryExecutor {
    pub fn new(
        analyzer: Arc<RetryAnalyzer>,
        budget: Arc<RetryBudgetManager>,
        events: CacheStore,
    ) -> Self {
        Self {
            analyzer,
            budget,
            events,
        }
    }

    pub async fn execute<T, F, Fut>(
        &self,
        mut ctx: RetryContext,
        mut operation: F,
    ) -> Result<T, AppError>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut last_pattern_id: Option<String> = None;

        for attempt in 1u32.. {
            self.emit(
                "retry:attempt",
                json!({"task_id": ctx.task_id, "attempt": attempt}),
            )
            .await;

            let started = Instant::now();
            let outcome = match ctx.attempt_timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, operation(ctx.clone())).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(AppError::Unavailable(format!(
                            "operation timed out after {} ms",
                            timeout.as_millis()
                        ))),
                    }
                }
                None => operation(ctx.clone()).await,
            };
            let execution_time_ms =
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        if let Some(pattern_id) = &last_pattern_id {
                            if let Err(err) = self
                                .analyzer
                                .record_attempt(
                                    pattern_id,
                                    &ctx.task_id,
                                    attempt,
                                    RetryStrategyKind::Exponential,
                                    modifications_value(&ctx),
                                    true,
                                    execution_time_ms,
                                    None,
                                )
                                .await
                            {
                                warn!(error = %err, "failed to record successful attempt");
                            }
                        }
                        self.emit(
                            "retry:success",
                            json!({"task_id": ctx.task_id, "attempt": attempt}),
                        )
                        .await;
                    }
                    self.budget.release_budget(&ctx.task_id).await;
                    return Ok(value);
                }
                Err(error) => {
                    let error_message = error.to_string();
                    let error_type = error_type_of(&error);

                    let recommendation = self
                        .analyzer
                        .analyze_error(&error_message, error_type, &ctx.service, &ctx.operation)
                        .await?;
                    last_pattern_id = recommendation.pattern_id.clone();

                    self.emit(
                        "retry:analysis",
                        json!({
                            "task_id": ctx.task_id,
                            "attempt": attempt,
                            "pattern_id": recommendation.pattern_id,
                            "category": recommendation.category,
                            "confidence": recommendation.confidence,
                        }),
                    )
                    .await;

                    let decision = self
                        .budget
                        .check_budget(
                            &ctx.task_id,
                            &error_message,
                            recommendation.pattern_id.as_deref(),
                            ctx.metadata.as_ref(),
                        )
                        .await?;

                    let effective_cap = recommendation
                        .strategy
                        .max_retries
                        .min(ctx.max_attempts);
                    let out_of_attempts = !recommendation.should_retry
                        || attempt >= effective_cap.max(1)
                        || !decision.allowed;

                    if out_of_attempts {
                        if let Some(pattern_id) = &last_pattern_id {
                            if let Err(err) = self
                                .analyzer
                                .record_attempt(
                                    pattern_id,
                                    &ctx.task_id,
                                    attempt,
                                    recommendation.strategy.kind,
                                    modifications_value(&ctx),
                                    false,
                                    execution_time_ms,
                                    Some(error_message.clone()),
                                )
                                .await
                            {
                                warn!(error = %err, "failed to record failed attempt");
                            }
                        }

                        if !decision.allowed {
                            let reason = decision
                                .reason
                                .unwrap_or_else(|| "budget_exhausted".to_string());
                            return Err(AppError::BudgetExhausted(format!(
                                "task {} exhausted its retry budget ({reason}): {error_message}",
                                ctx.task_id
                            )));
                        }
                        return Err(error);
                    }

                    let backoff = backoff_with_jitter(&recommendation.strategy, attempt);
                    debug!(
                        task_id = %ctx.task_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "backing off before retry"
                    );
                    self.emit(
                        "retry:backoff",
                        json!({
                            "task_id": ctx.task_id,
                            "attempt": attempt,
                            "backoff_ms": backoff.as_millis() as u64,
                        }),
                    )
                    .await;
                    tokio::time::sleep(backoff).await;

                    if let Some(Value::Object(map)) = &recommendation.modifications {
                        for (key, value) in map {
                            ctx.modifications.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }

        unreachable!("retry loop only exits via return")
    }

    async fn emit(&self, subject: &str, payload: Value) {
        if let Err(err) = self.events.publish(subject, payload).await {
            warn!(subject, error = %err, "failed to publish retry event");
        }
    }
}

fn modifications_value(ctx: &RetryContext) -> Option<Value> {
    (!ctx.modifications.is_empty()).then(|| Value::Object(ctx.modifications.clone()))
}

fn error_type_of(error: &AppError) -> &'static str {
    match error {
        AppError::Database(_) => "Database",
        AppError::OpenAI(_) => "OpenAI",
        AppError::NotFound(_) => "NotFound",
        AppError::Validation(_) => "Validation",
        AppError::Conflict(_) => "Conflict",
        AppError::Auth(_) => "Auth",
        AppError::LLMParsing(_) => "LLMParsing",
        AppError::Unavailable(_) => "Unavailable",
        AppError::BudgetExhausted(_) => "BudgetExhausted",
        AppError::Desync(_) => "Desync",
        AppError::PartialWrite(_) => "PartialWrite",
        AppError::Join(_) => "Join",
        AppError::Io(_) => "Io",
        AppError::Reqwest(_) => "Reqwest",
        AppError::Anyhow(_) => "Anyhow",
        AppError::Processing(_) => "Processing",
        AppError::InternalError(_) => "Internal",
    }
}

/// Strategy backoff for this attempt, with ±20% jitter when exponential.
fn backoff_with_jitter(
    strategy: &common::storage::types::error_pattern::RetryStrategy,
    attempt: u32,
) -> Duration {
    let base_ms = strategy.backoff_for_attempt(attempt);
    if base_ms == 0 {
        return Duration::ZERO;
    }

    let ms = if strategy.kind == RetryStrategyKind::Exponential {
        let jitter_range = (base_ms as f64 * 0.2).max(1.0);
        let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        (base_ms as f64 + offset).max(0.0) as u64
    } else {
        base_ms
    };

    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetLimits;
    use common::storage::db::SurrealDbClient;
    use common::storage::types::dead_letter::{DeadLetterEntry, DeadLetterFilter};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    async fn setup(limits: BudgetLimits) -> (RetryExecutor, Arc<SurrealDbClient>) {
        let database = &Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("executor_ns", database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("init definitions");
        let events = CacheStore::new((*db).clone());
        let analyzer = Arc::new(RetryAnalyzer::new(Arc::clone(&db)));
        let budget = Arc::new(RetryBudgetManager::new(
            Arc::clone(&db),
            events.clone(),
            limits,
        ));
        (RetryExecutor::new(analyzer, budget, events), db)
    }

    #[tokio::test]
    async fn first_try_success_skips_the_machinery() {
        let (executor, _db) = setup(BudgetLimits::default()).await;

        let result: i32 = executor
            .execute(RetryContext::new("t1", "store", "read"), |_ctx| async {
                Ok(42)
            })
            .await
            .expect("operation succeeds");
        assert_eq!(result, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_to_success() {
        let (executor, _db) = setup(BudgetLimits::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: &str = executor
            .execute(
                RetryContext::new("t2", "vector", "upsert").with_max_attempts(5),
                move |_ctx| {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(AppError::Unavailable("connection refused".into()))
                        } else {
                            Ok("stored")
                        }
                    }
                },
            )
            .await
            .expect("retry should eventually succeed");

        assert_eq!(result, "stored");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let (executor, _db) = setup(BudgetLimits::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: Result<(), AppError> = executor
            .execute(
                RetryContext::new("t3", "store", "read").with_max_attempts(5),
                move |_ctx| {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(AppError::Auth("permission denied for tenant".into()))
                    }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry for auth errors");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_becomes_budget_exhausted_error() {
        let (executor, db) = setup(BudgetLimits {
            max_attempts: 2,
            max_duration: Duration::from_secs(300),
        })
        .await;

        let result: Result<(), AppError> = executor
            .execute(
                RetryContext::new("t4", "graph", "merge").with_max_attempts(100),
                |_ctx| async { Err(AppError::Unavailable("timeout talking to graph".into())) },
            )
            .await;

        assert!(matches!(result, Err(AppError::BudgetExhausted(_))));

        let entries = DeadLetterEntry::query(&DeadLetterFilter::default(), &db)
            .await
            .expect("query dlq");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, "t4");
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_a_failure() {
        let (executor, _db) = setup(BudgetLimits::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: &str = executor
            .execute(
                RetryContext::new("t5", "llm", "extract")
                    .with_max_attempts(3)
                    .with_timeout(Duration::from_millis(20)),
                move |_ctx| {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            // First attempt hangs past the timeout.
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        Ok("done")
                    }
                },
            )
            .await
            .expect("second attempt should succeed");

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn local_attempt_cap_is_honored() {
        let (executor, _db) = setup(BudgetLimits::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: Result<(), AppError> = executor
            .execute(
                RetryContext::new("t6", "vector", "upsert").with_max_attempts(2),
                move |_ctx| {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(AppError::Unavailable("network unreachable".into()))
                    }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
