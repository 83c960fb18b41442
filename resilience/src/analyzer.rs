use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            error_pattern::{
                ErrorCategory, ErrorPattern, ErrorSeverity, RetryStrategy, RetryStrategyKind,
            },
            retry_attempt::RetryAttempt,
        },
    },
};

use crate::normalize::{fingerprint, normalize_error_message};

/// What the analyzer tells the executor about a failure.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub pattern_id: Option<String>,
    pub should_retry: bool,
    pub strategy: RetryStrategy,
    pub confidence: f64,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub reasoning: String,
    pub modifications: Option<Value>,
}

const NON_RETRYABLE_PHRASES: [&str; 5] = [
    "permission denied",
    "unauthorized",
    "forbidden",
    "not found",
    "authentication failed",
];

/// Learns error patterns: normalizes failures, matches them against stored
/// patterns, and recommends a retry strategy with a confidence estimate.
pub struct RetryAnalyzer {
    db: Arc<SurrealDbClient>,
    // Pattern rows are read on every failure; a process-local cache keyed by
    // the pattern id avoids a query per retry. Invalidated on record_attempt.
    cache: RwLock<HashMap<String, ErrorPattern>>,
}

impl RetryAnalyzer {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn analyze_error(
        &self,
        error_message: &str,
        error_type: &str,
        service: &str,
        operation: &str,
    ) -> Result<Recommendation, AppError> {
        let print = fingerprint(error_message);

        // (a) exact fingerprint within (service, operation)
        if let Some(pattern) = self.lookup_exact(&print, service, operation).await? {
            ErrorPattern::record_occurrence(&pattern.id, &self.db).await?;
            let confidence = exact_confidence(&pattern);
            let reasoning = format!(
                "seen {} times with {:.0}% retry success",
                pattern.occurrence_count,
                pattern.success_rate * 100.0
            );
            return Ok(Recommendation {
                pattern_id: Some(pattern.id.clone()),
                should_retry: pattern.retryable,
                strategy: pattern.strategy.clone(),
                confidence,
                category: pattern.category,
                severity: pattern.severity,
                reasoning,
                modifications: None,
            });
        }

        // (b) same error type within the scope, best-trusted pattern first
        if let Some(pattern) =
            ErrorPattern::find_by_type(service, operation, error_type, &self.db).await?
        {
            let reasoning = format!(
                "matched by error type '{error_type}' via pattern with {:.0}% success",
                pattern.success_rate * 100.0
            );
            return Ok(Recommendation {
                pattern_id: Some(pattern.id.clone()),
                should_retry: pattern.retryable,
                strategy: pattern.strategy.clone(),
                confidence: 0.5,
                category: pattern.category,
                severity: pattern.severity,
                reasoning,
                modifications: None,
            });
        }

        // (c) miss: create a conservative pattern from heuristics
        let normalized = normalize_error_message(error_message);
        let (category, severity) = categorize(&normalized);
        let retryable = is_retryable(&normalized, category);
        let strategy = if retryable {
            RetryStrategy::conservative()
        } else {
            RetryStrategy::none()
        };

        let pattern = ErrorPattern::new(
            print,
            service.to_string(),
            operation.to_string(),
            error_type.to_string(),
            normalized,
            category,
            severity,
            retryable,
            strategy.clone(),
        );
        pattern.upsert(&self.db).await?;
        debug!(pattern_id = %pattern.id, ?category, "created new error pattern");

        Ok(Recommendation {
            pattern_id: Some(pattern.id.clone()),
            should_retry: retryable,
            strategy,
            confidence: 0.3,
            category,
            severity,
            reasoning: "first occurrence; conservative default strategy".to_string(),
            modifications: None,
        })
    }

    /// Append an attempt row and fold its outcome into the pattern counters.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_attempt(
        &self,
        pattern_id: &str,
        task_id: &str,
        attempt_number: u32,
        strategy_kind: RetryStrategyKind,
        modifications: Option<Value>,
        success: bool,
        execution_time_ms: u64,
        error_message: Option<String>,
    ) -> Result<(), AppError> {
        let attempt = RetryAttempt::new(
            pattern_id.to_string(),
            task_id.to_string(),
            attempt_number,
            format!("{strategy_kind:?}").to_lowercase(),
            modifications,
            success,
            execution_time_ms,
            error_message,
        );
        self.db.store_item(attempt).await?;

        ErrorPattern::record_outcome(pattern_id, success, &self.db).await?;

        self.cache.write().await.remove(pattern_id);
        Ok(())
    }

    async fn lookup_exact(
        &self,
        print: &str,
        service: &str,
        operation: &str,
    ) -> Result<Option<ErrorPattern>, AppError> {
        let id = common::utils::hashing::key_digest(&[print, service, operation]);

        if let Some(hit) = self.cache.read().await.get(&id) {
            return Ok(Some(hit.clone()));
        }

        let pattern = ErrorPattern::find_exact(print, service, operation, &self.db).await?;
        if let Some(pattern) = &pattern {
            self.cache
                .write()
                .await
                .insert(pattern.id.clone(), pattern.clone());
        }
        Ok(pattern)
    }
}

fn exact_confidence(pattern: &ErrorPattern) -> f64 {
    let samples = pattern.success_count + pattern.failure_count;
    if samples == 0 {
        return 0.4;
    }
    // More samples push confidence toward the observed rate.
    let sample_weight = (samples as f64 / (samples as f64 + 5.0)).min(0.95);
    0.4 + sample_weight * 0.55
}

fn categorize(normalized: &str) -> (ErrorCategory, ErrorSeverity) {
    let transient_markers = ["timeout", "timed out", "connection", "network", "unavailable", "refused"];
    if transient_markers.iter().any(|m| normalized.contains(m)) {
        return (ErrorCategory::Transient, ErrorSeverity::Medium);
    }

    let resource_markers = ["out of memory", "quota", "rate limit", "too many", "capacity"];
    if resource_markers.iter().any(|m| normalized.contains(m)) {
        return (ErrorCategory::ResourceExhaustion, ErrorSeverity::High);
    }

    let config_markers = ["config", "missing env", "invalid setting", "misconfigured"];
    if config_markers.iter().any(|m| normalized.contains(m)) {
        return (ErrorCategory::Configuration, ErrorSeverity::High);
    }

    let data_markers = ["parse", "invalid", "malformed", "schema", "serialize"];
    if data_markers.iter().any(|m| normalized.contains(m)) {
        return (ErrorCategory::DataQuality, ErrorSeverity::Medium);
    }

    let infra_markers = ["disk", "database", "store", "io error", "internal server"];
    if infra_markers.iter().any(|m| normalized.contains(m)) {
        return (ErrorCategory::Infrastructure, ErrorSeverity::High);
    }

    (ErrorCategory::Unknown, ErrorSeverity::Low)
}

fn is_retryable(normalized: &str, category: ErrorCategory) -> bool {
    if NON_RETRYABLE_PHRASES
        .iter()
        .any(|phrase| normalized.contains(phrase))
    {
        return false;
    }
    !matches!(
        category,
        ErrorCategory::Configuration | ErrorCategory::DataQuality
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup() -> RetryAnalyzer {
        let database = &Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("analyzer_ns", database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("init definitions");
        RetryAnalyzer::new(db)
    }

    #[tokio::test]
    async fn first_occurrence_creates_a_conservative_pattern() {
        let analyzer = setup().await;

        let rec = analyzer
            .analyze_error("connection refused by 10.0.0.1:6379", "Database", "cache", "put")
            .await
            .expect("analyze");

        assert!(rec.should_retry);
        assert_eq!(rec.category, ErrorCategory::Transient);
        assert_eq!(rec.strategy.kind, RetryStrategyKind::Exponential);
        assert!((rec.confidence - 0.3).abs() < 1e-9);
        assert!(rec.pattern_id.is_some());
    }

    #[tokio::test]
    async fn repeat_occurrence_matches_exactly_and_counts() {
        let analyzer = setup().await;

        let first = analyzer
            .analyze_error("timeout after 3000 ms", "Unavailable", "vector", "upsert")
            .await
            .expect("analyze");
        let second = analyzer
            .analyze_error("timeout after 9000 ms", "Unavailable", "vector", "upsert")
            .await
            .expect("analyze");

        assert_eq!(first.pattern_id, second.pattern_id);
        assert!(second.confidence >= first.confidence);
        assert!(second.reasoning.contains("seen"));
    }

    #[tokio::test]
    async fn non_retryable_phrases_disable_retry() {
        let analyzer = setup().await;

        let rec = analyzer
            .analyze_error("permission denied for key", "Auth", "store", "read")
            .await
            .expect("analyze");

        assert!(!rec.should_retry);
        assert_eq!(rec.strategy.kind, RetryStrategyKind::None);
    }

    #[tokio::test]
    async fn scope_separates_patterns() {
        let analyzer = setup().await;

        let a = analyzer
            .analyze_error("timeout after 10 ms", "Unavailable", "vector", "upsert")
            .await
            .expect("analyze");
        let b = analyzer
            .analyze_error("timeout after 10 ms", "Unavailable", "graph", "merge")
            .await
            .expect("analyze");

        assert_ne!(a.pattern_id, b.pattern_id);
    }

    #[tokio::test]
    async fn recorded_attempts_move_the_success_rate() {
        let analyzer = setup().await;

        let rec = analyzer
            .analyze_error("network unreachable", "Unavailable", "queue", "claim")
            .await
            .expect("analyze");
        let pattern_id = rec.pattern_id.expect("pattern id");

        analyzer
            .record_attempt(
                &pattern_id,
                "t1",
                1,
                RetryStrategyKind::Exponential,
                None,
                true,
                12,
                None,
            )
            .await
            .expect("record");

        let again = analyzer
            .analyze_error("network unreachable", "Unavailable", "queue", "claim")
            .await
            .expect("analyze");
        assert!(again.reasoning.contains("100% retry success"));
    }

    #[tokio::test]
    async fn type_fallback_reuses_scope_patterns() {
        let analyzer = setup().await;

        analyzer
            .analyze_error("connection refused", "Unavailable", "vector", "upsert")
            .await
            .expect("analyze");

        // Different message, same error type and scope: falls back to (b).
        let rec = analyzer
            .analyze_error("socket closed unexpectedly mid-write", "Unavailable", "vector", "upsert")
            .await
            .expect("analyze");

        assert!((rec.confidence - 0.5).abs() < 1e-9);
        assert!(rec.reasoning.contains("matched by error type"));
    }
}
