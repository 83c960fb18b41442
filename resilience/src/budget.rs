use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{cache::CacheStore, db::SurrealDbClient, types::dead_letter::DeadLetterEntry},
};

/// Hard per-task ceilings, independent of whatever the analyzer recommends.
#[derive(Debug, Clone, Copy)]
pub struct BudgetLimits {
    pub max_attempts: u32,
    pub max_duration: Duration,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_duration: Duration::from_secs(300),
        }
    }
}

/// In-memory ledger for one task's retry consumption.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    pub attempts: u32,
    pub started_at: Instant,
    pub first_attempt_at: chrono::DateTime<Utc>,
    pub last_attempt_at: Instant,
    pub pattern_ids: Vec<String>,
    pub errors: Vec<String>,
}

/// Outcome of a budget check.
#[derive(Debug, Clone)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub attempts_remaining: u32,
    pub time_remaining: Duration,
}

/// Enforces the attempt and wall-time ceilings; exhausted tasks move to the
/// dead-letter queue. The ledger is process-local, the DLQ is the durable
/// coordination point.
pub struct RetryBudgetManager {
    db: Arc<SurrealDbClient>,
    events: CacheStore,
    limits: BudgetLimits,
    budgets: Mutex<HashMap<String, RetryBudget>>,
}

pub const REASON_LIMIT: &str = "retry_limit_exceeded";
pub const REASON_DURATION: &str = "retry_duration_exceeded";

impl RetryBudgetManager {
    pub fn new(db: Arc<SurrealDbClient>, events: CacheStore, limits: BudgetLimits) -> Self {
        Self {
            db,
            events,
            limits,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Check (and consume) budget for one more attempt of `task_id`.
    ///
    /// Creates the ledger on first call. When a ceiling is crossed the task
    /// is transferred to the DLQ and `allowed = false` comes back.
    pub async fn check_budget(
        &self,
        task_id: &str,
        error: &str,
        pattern_id: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<BudgetDecision, AppError> {
        let exhausted = {
            let mut budgets = self.budgets.lock().await;
            let budget = budgets.entry(task_id.to_string()).or_insert_with(|| {
                RetryBudget {
                    attempts: 0,
                    started_at: Instant::now(),
                    first_attempt_at: Utc::now(),
                    last_attempt_at: Instant::now(),
                    pattern_ids: Vec::new(),
                    errors: Vec::new(),
                }
            });

            budget.attempts += 1;
            budget.last_attempt_at = Instant::now();
            budget.errors.push(error.to_string());
            if let Some(pattern_id) = pattern_id {
                if !budget.pattern_ids.iter().any(|id| id == pattern_id) {
                    budget.pattern_ids.push(pattern_id.to_string());
                }
            }

            let elapsed = budget.started_at.elapsed();
            if budget.attempts > self.limits.max_attempts {
                Some((budget.clone(), REASON_LIMIT))
            } else if elapsed > self.limits.max_duration {
                Some((budget.clone(), REASON_DURATION))
            } else {
                let remaining_attempts = self.limits.max_attempts - budget.attempts;
                let remaining_time = self.limits.max_duration.saturating_sub(elapsed);
                return Ok(BudgetDecision {
                    allowed: true,
                    reason: None,
                    attempts_remaining: remaining_attempts,
                    time_remaining: remaining_time,
                });
            }
        };

        // Exhausted: move the task to the DLQ and drop the ledger. The denied
        // check never executes, so it does not count as an attempt.
        let (mut budget, reason) = exhausted.expect("exhausted branch always set");
        budget.attempts = budget.attempts.saturating_sub(1);
        self.transfer_to_dlq(task_id, &budget, reason, metadata)
            .await?;
        self.budgets.lock().await.remove(task_id);

        Ok(BudgetDecision {
            allowed: false,
            reason: Some(reason.to_string()),
            attempts_remaining: 0,
            time_remaining: Duration::ZERO,
        })
    }

    /// Release the ledger after a terminal success.
    pub async fn release_budget(&self, task_id: &str) {
        if self.budgets.lock().await.remove(task_id).is_some() {
            info!(task_id, "retry budget released");
        }
    }

    /// Privileged manual trigger: exhaust a task's budget right now.
    pub async fn force_exhaust_budget(
        &self,
        task_id: &str,
        reason: &str,
        metadata: Option<&Value>,
    ) -> Result<DeadLetterEntry, AppError> {
        let budget = self
            .budgets
            .lock()
            .await
            .remove(task_id)
            .unwrap_or_else(|| RetryBudget {
                attempts: 0,
                started_at: Instant::now(),
                first_attempt_at: Utc::now(),
                last_attempt_at: Instant::now(),
                pattern_ids: Vec::new(),
                errors: Vec::new(),
            });

        self.transfer_to_dlq(task_id, &budget, reason, metadata).await
    }

    pub async fn active_budget(&self, task_id: &str) -> Option<RetryBudget> {
        self.budgets.lock().await.get(task_id).cloned()
    }

    async fn transfer_to_dlq(
        &self,
        task_id: &str,
        budget: &RetryBudget,
        reason: &str,
        metadata: Option<&Value>,
    ) -> Result<DeadLetterEntry, AppError> {
        warn!(
            task_id,
            attempts = budget.attempts,
            reason,
            "retry budget exhausted; transferring task to dead letter queue"
        );

        let full_reason = match budget.errors.last() {
            Some(last_error) => format!("{reason}: {last_error}"),
            None => reason.to_string(),
        };

        let entry = DeadLetterEntry::new(
            task_id.to_string(),
            full_reason,
            budget.attempts,
            u64::try_from(budget.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            budget.errors.clone(),
            budget.pattern_ids.clone(),
            budget.first_attempt_at,
            metadata.cloned(),
        )
        .add(&self.db)
        .await?;

        if let Err(err) = self
            .events
            .publish(
                "retry:exhausted",
                json!({"task_id": task_id, "reason": reason, "dlq_id": entry.id}),
            )
            .await
        {
            warn!(error = %err, "failed to publish exhaustion event");
        }

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::dead_letter::{DeadLetterFilter, DeadLetterStatus};
    use uuid::Uuid;

    async fn setup(limits: BudgetLimits) -> (RetryBudgetManager, Arc<SurrealDbClient>) {
        let database = &Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("budget_ns", database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("init definitions");
        let events = CacheStore::new((*db).clone());
        (
            RetryBudgetManager::new(Arc::clone(&db), events, limits),
            db,
        )
    }

    #[tokio::test]
    async fn eleventh_attempt_is_denied_and_dead_lettered() {
        let (manager, db) = setup(BudgetLimits::default()).await;

        for n in 1..=10 {
            let decision = manager
                .check_budget("t1", "timeout talking to store", None, None)
                .await
                .expect("check");
            assert!(decision.allowed, "attempt {n} should be allowed");
            assert_eq!(decision.attempts_remaining, 10 - n);
        }

        let denied = manager
            .check_budget("t1", "timeout talking to store", None, None)
            .await
            .expect("check");
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some(REASON_LIMIT));

        let entries = DeadLetterEntry::query(
            &DeadLetterFilter {
                status: Some(DeadLetterStatus::Pending),
                ..DeadLetterFilter::default()
            },
            &db,
        )
        .await
        .expect("query dlq");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, "t1");
        assert_eq!(entries[0].attempts, 10);
        assert!(entries[0].reason.starts_with(REASON_LIMIT));
    }

    #[tokio::test]
    async fn duration_ceiling_exhausts_the_budget() {
        let (manager, db) = setup(BudgetLimits {
            max_attempts: 100,
            max_duration: Duration::from_millis(10),
        })
        .await;

        manager
            .check_budget("t2", "first failure", None, None)
            .await
            .expect("check");
        tokio::time::sleep(Duration::from_millis(25)).await;

        let denied = manager
            .check_budget("t2", "second failure", None, None)
            .await
            .expect("check");
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some(REASON_DURATION));

        let entries = DeadLetterEntry::query(&DeadLetterFilter::default(), &db)
            .await
            .expect("query dlq");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].reason.starts_with(REASON_DURATION));
    }

    #[tokio::test]
    async fn release_clears_the_ledger() {
        let (manager, _db) = setup(BudgetLimits::default()).await;

        manager
            .check_budget("t3", "flaky", None, None)
            .await
            .expect("check");
        assert!(manager.active_budget("t3").await.is_some());

        manager.release_budget("t3").await;
        assert!(manager.active_budget("t3").await.is_none());

        // A later failure starts a fresh budget.
        let decision = manager
            .check_budget("t3", "flaky again", None, None)
            .await
            .expect("check");
        assert_eq!(decision.attempts_remaining, 9);
    }

    #[tokio::test]
    async fn budget_records_patterns_and_errors() {
        let (manager, db) = setup(BudgetLimits {
            max_attempts: 2,
            max_duration: Duration::from_secs(300),
        })
        .await;

        manager
            .check_budget("t4", "error one", Some("p1"), None)
            .await
            .expect("check");
        manager
            .check_budget("t4", "error two", Some("p1"), None)
            .await
            .expect("check");
        let denied = manager
            .check_budget("t4", "error three", Some("p2"), None)
            .await
            .expect("check");
        assert!(!denied.allowed);

        let entries = DeadLetterEntry::query(&DeadLetterFilter::default(), &db)
            .await
            .expect("query dlq");
        assert_eq!(entries[0].errors.len(), 3);
        assert_eq!(entries[0].pattern_ids, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn force_exhaust_dead_letters_immediately() {
        let (manager, db) = setup(BudgetLimits::default()).await;

        manager
            .check_budget("t5", "one failure", None, None)
            .await
            .expect("check");
        let entry = manager
            .force_exhaust_budget("t5", "manually_abandoned", None)
            .await
            .expect("force exhaust");
        assert_eq!(entry.task_id, "t5");

        assert!(manager.active_budget("t5").await.is_none());
        let entries = DeadLetterEntry::query(&DeadLetterFilter::default(), &db)
            .await
            .expect("query dlq");
        assert_eq!(entries.len(), 1);
    }
}
