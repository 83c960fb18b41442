use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(RetryAttempt, "retry_attempt", {
    pattern_id: String,
    task_id: String,
    attempt_number: u32,
    strategy_kind: String,
    #[serde(default)]
    modifications: Option<Value>,
    success: bool,
    execution_time_ms: u64,
    #[serde(default)]
    error_message: Option<String>
});

impl RetryAttempt {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pattern_id: String,
        task_id: String,
        attempt_number: u32,
        strategy_kind: String,
        modifications: Option<Value>,
        success: bool,
        execution_time_ms: u64,
        error_message: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            pattern_id,
            task_id,
            attempt_number,
            strategy_kind,
            modifications,
            success,
            execution_time_ms,
            error_message,
        }
    }

    pub async fn for_pattern(
        pattern_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM retry_attempt WHERE pattern_id = $pattern_id \
                 ORDER BY created_at ASC",
            )
            .bind(("pattern_id", pattern_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attempts_are_listed_per_pattern() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("attempt_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");

        for n in 1..=2 {
            let attempt = RetryAttempt::new(
                "p1".into(),
                "t1".into(),
                n,
                "exponential".into(),
                None,
                n == 2,
                15,
                (n == 1).then(|| "timeout".to_string()),
            );
            db.store_item(attempt).await.expect("store attempt");
        }

        let other = RetryAttempt::new(
            "p2".into(),
            "t2".into(),
            1,
            "fixed".into(),
            None,
            false,
            9,
            Some("boom".into()),
        );
        db.store_item(other).await.expect("store attempt");

        let attempts = RetryAttempt::for_pattern("p1", &db).await.expect("list");
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].success);
    }
}
