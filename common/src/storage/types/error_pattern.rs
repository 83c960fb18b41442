use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Infrastructure,
    DataQuality,
    ResourceExhaustion,
    Configuration,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// How a retry should pace itself. Backoff entries are per-attempt delays in
/// milliseconds; an exponential strategy also gets jitter applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    pub kind: RetryStrategyKind,
    pub max_retries: u32,
    pub backoff_ms: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyKind {
    Immediate,
    Fixed,
    Exponential,
    None,
}

impl RetryStrategy {
    /// Conservative default for never-seen errors.
    pub fn conservative() -> Self {
        Self {
            kind: RetryStrategyKind::Exponential,
            max_retries: 3,
            backoff_ms: vec![1_000, 2_000, 4_000],
        }
    }

    pub fn none() -> Self {
        Self {
            kind: RetryStrategyKind::None,
            max_retries: 0,
            backoff_ms: Vec::new(),
        }
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> u64 {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff_ms
            .get(idx)
            .or_else(|| self.backoff_ms.last())
            .copied()
            .unwrap_or(0)
    }
}

stored_object!(ErrorPattern, "error_pattern", {
    fingerprint: String,
    service: String,
    operation: String,
    error_type: String,
    normalized_message: String,
    category: ErrorCategory,
    severity: ErrorSeverity,
    retryable: bool,
    strategy: RetryStrategy,
    success_count: u64,
    failure_count: u64,
    success_rate: f64,
    occurrence_count: u64,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    first_seen: DateTime<Utc>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    last_seen: DateTime<Utc>
});

impl ErrorPattern {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fingerprint: String,
        service: String,
        operation: String,
        error_type: String,
        normalized_message: String,
        category: ErrorCategory,
        severity: ErrorSeverity,
        retryable: bool,
        strategy: RetryStrategy,
    ) -> Self {
        let now = Utc::now();
        Self {
            // One row per (fingerprint, service, operation): the id is the
            // fingerprint digest extended by its scope.
            id: crate::utils::hashing::key_digest(&[&fingerprint, &service, &operation]),
            created_at: now,
            updated_at: now,
            fingerprint,
            service,
            operation,
            error_type,
            normalized_message,
            category,
            severity,
            retryable,
            strategy,
            success_count: 0,
            failure_count: 0,
            success_rate: 0.0,
            occurrence_count: 1,
            first_seen: now,
            last_seen: now,
        }
    }

    pub async fn find_exact(
        fingerprint: &str,
        service: &str,
        operation: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM error_pattern \
                 WHERE fingerprint = $fingerprint \
                   AND service = $service \
                   AND operation = $operation \
                 LIMIT 1",
            )
            .bind(("fingerprint", fingerprint.to_owned()))
            .bind(("service", service.to_owned()))
            .bind(("operation", operation.to_owned()))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Fallback match by error type within the same scope: the best-trusted
    /// pattern (success rate, then occurrences) wins.
    pub async fn find_by_type(
        service: &str,
        operation: &str,
        error_type: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM error_pattern \
                 WHERE service = $service \
                   AND operation = $operation \
                   AND error_type = $error_type \
                 ORDER BY success_rate DESC, occurrence_count DESC \
                 LIMIT 1",
            )
            .bind(("service", service.to_owned()))
            .bind(("operation", operation.to_owned()))
            .bind(("error_type", error_type.to_owned()))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    pub async fn upsert(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPSERT type::thing('error_pattern', $id) CONTENT $pattern",
        )
        .bind(("id", self.id.clone()))
        .bind(("pattern", self.clone()))
        .await?
        .check()?;

        Ok(())
    }

    pub async fn record_occurrence(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('error_pattern', $id) SET \
                 occurrence_count += 1, \
                 last_seen = time::now(), \
                 updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .await?
        .check()?;

        Ok(())
    }

    /// Re-derive the aggregate counters from an attempt outcome.
    pub async fn record_outcome(
        id: &str,
        success: bool,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let field = if success {
            "success_count"
        } else {
            "failure_count"
        };
        db.query(format!(
            "UPDATE type::thing('error_pattern', $id) SET \
                 {field} += 1, \
                 success_rate = success_count / math::max([success_count + failure_count, 1]), \
                 updated_at = time::now()"
        ))
        .bind(("id", id.to_owned()))
        .await?
        .check()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pattern(service: &str, operation: &str, error_type: &str) -> ErrorPattern {
        ErrorPattern::new(
            format!("fp-{error_type}"),
            service.into(),
            operation.into(),
            error_type.into(),
            "connection refused".into(),
            ErrorCategory::Transient,
            ErrorSeverity::Medium,
            true,
            RetryStrategy::conservative(),
        )
    }

    async fn setup_db() -> SurrealDbClient {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("pattern_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init definitions");
        db
    }

    #[test]
    fn conservative_strategy_backoff_saturates() {
        let strategy = RetryStrategy::conservative();
        assert_eq!(strategy.backoff_for_attempt(1), 1_000);
        assert_eq!(strategy.backoff_for_attempt(3), 4_000);
        assert_eq!(strategy.backoff_for_attempt(9), 4_000);
    }

    #[tokio::test]
    async fn find_exact_matches_scope() {
        let db = setup_db().await;
        let p = pattern("graph", "merge_entities", "Database");
        p.upsert(&db).await.expect("upsert pattern");

        let hit = ErrorPattern::find_exact(&p.fingerprint, "graph", "merge_entities", &db)
            .await
            .expect("lookup");
        assert_eq!(hit.map(|p| p.id), Some(p.id.clone()));

        let miss = ErrorPattern::find_exact(&p.fingerprint, "graph", "other_op", &db)
            .await
            .expect("lookup");
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn find_by_type_prefers_trusted_patterns() {
        let db = setup_db().await;

        let mut trusted = pattern("vector", "upsert", "Unavailable");
        trusted.fingerprint = "fp-a".into();
        trusted.id = crate::utils::hashing::key_digest(&["fp-a", "vector", "upsert"]);
        trusted.success_rate = 0.9;
        trusted.upsert(&db).await.expect("upsert trusted");

        let mut weak = pattern("vector", "upsert", "Unavailable");
        weak.fingerprint = "fp-b".into();
        weak.id = crate::utils::hashing::key_digest(&["fp-b", "vector", "upsert"]);
        weak.success_rate = 0.1;
        weak.upsert(&db).await.expect("upsert weak");

        let hit = ErrorPattern::find_by_type("vector", "upsert", "Unavailable", &db)
            .await
            .expect("lookup")
            .expect("a pattern should match");
        assert_eq!(hit.fingerprint, "fp-a");
    }

    #[tokio::test]
    async fn record_outcome_updates_derived_rate() {
        let db = setup_db().await;
        let p = pattern("queue", "claim", "Database");
        let id = p.id.clone();
        p.upsert(&db).await.expect("upsert pattern");

        ErrorPattern::record_outcome(&id, true, &db)
            .await
            .expect("success outcome");
        ErrorPattern::record_outcome(&id, false, &db)
            .await
            .expect("failure outcome");

        let updated: ErrorPattern = db
            .get_item(&id)
            .await
            .expect("fetch")
            .expect("pattern exists");
        assert_eq!(updated.success_count, 1);
        assert_eq!(updated.failure_count, 1);
        assert!((updated.success_rate - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn record_occurrence_bumps_counter() {
        let db = setup_db().await;
        let p = pattern("queue", "claim", "Database");
        let id = p.id.clone();
        p.upsert(&db).await.expect("upsert pattern");

        ErrorPattern::record_occurrence(&id, &db)
            .await
            .expect("occurrence");

        let updated: ErrorPattern = db
            .get_item(&id)
            .await
            .expect("fetch")
            .expect("pattern exists");
        assert_eq!(updated.occurrence_count, 2);
    }
}
