use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Processing,
    Resolved,
    Archived,
}

impl DeadLetterStatus {
    /// The status machine: `pending → processing → {pending, resolved} →
    /// archived`. Admin actions may also resolve a pending entry directly.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Resolved)
                | (Self::Processing, Self::Pending)
                | (Self::Processing, Self::Resolved)
                | (Self::Resolved, Self::Archived)
        )
    }
}

stored_object!(DeadLetterEntry, "dead_letter", {
    task_id: String,
    reason: String,
    attempts: u32,
    duration_ms: u64,
    errors: Vec<String>,
    pattern_ids: Vec<String>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    first_attempt_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    last_attempt_at: DateTime<Utc>,
    #[serde(default)]
    metadata: Option<Value>,
    status: DeadLetterStatus,
    #[serde(default)]
    resolved_by: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    resolved_at: Option<DateTime<Utc>>
});

#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub status: Option<DeadLetterStatus>,
    pub reason_contains: Option<String>,
    pub task_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetterStats {
    pub pending: u64,
    pub processing: u64,
    pub resolved: u64,
    pub archived: u64,
}

impl DeadLetterEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: String,
        reason: String,
        attempts: u32,
        duration_ms: u64,
        errors: Vec<String>,
        pattern_ids: Vec<String>,
        first_attempt_at: DateTime<Utc>,
        metadata: Option<Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            task_id,
            reason,
            attempts,
            duration_ms,
            errors,
            pattern_ids,
            first_attempt_at,
            last_attempt_at: now,
            metadata,
            status: DeadLetterStatus::Pending,
            resolved_by: None,
            resolution: None,
            resolved_at: None,
        }
    }

    pub async fn add(self, db: &SurrealDbClient) -> Result<Self, AppError> {
        let stored = db.store_item(self).await?;
        stored.ok_or_else(|| AppError::InternalError("dead letter row was not created".into()))
    }

    pub async fn query(
        filter: &DeadLetterFilter,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut clauses: Vec<&str> = Vec::new();
        if filter.status.is_some() {
            clauses.push("status = $status");
        }
        if filter.reason_contains.is_some() {
            clauses.push("string::contains(reason, $reason)");
        }
        if filter.task_id.is_some() {
            clauses.push("task_id = $task_id");
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let sql = format!(
            "SELECT * FROM dead_letter {where_clause} \
             ORDER BY created_at DESC LIMIT $limit START $offset"
        );

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let mut query = db
            .query(sql)
            .bind(("limit", limit as i64))
            .bind(("offset", filter.offset as i64));
        if let Some(status) = filter.status {
            query = query.bind(("status", status));
        }
        if let Some(reason) = &filter.reason_contains {
            query = query.bind(("reason", reason.clone()));
        }
        if let Some(task_id) = &filter.task_id {
            query = query.bind(("task_id", task_id.clone()));
        }

        let mut response = query.await?;
        Ok(response.take(0)?)
    }

    /// Guarded status transition; rejects moves the machine does not allow.
    pub async fn update_status(
        id: &str,
        next: DeadLetterStatus,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let current: Self = db
            .get_item(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dead letter entry {id}")))?;

        if !current.status.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "dead letter entry {id} cannot move {:?} -> {next:?}",
                current.status
            )));
        }

        let mut response = db
            .query(
                "UPDATE type::thing('dead_letter', $id) SET \
                 status = $status, updated_at = time::now() RETURN AFTER",
            )
            .bind(("id", id.to_owned()))
            .bind(("status", next))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("dead letter entry {id}")))
    }

    pub async fn resolve(
        id: &str,
        resolved_by: &str,
        resolution: &str,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let current: Self = db
            .get_item(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dead letter entry {id}")))?;

        if !current.status.can_transition_to(DeadLetterStatus::Resolved) {
            return Err(AppError::Conflict(format!(
                "dead letter entry {id} cannot resolve from {:?}",
                current.status
            )));
        }

        let mut response = db
            .query(
                "UPDATE type::thing('dead_letter', $id) SET \
                 status = $status, \
                 resolved_by = $resolved_by, \
                 resolution = $resolution, \
                 resolved_at = time::now(), \
                 updated_at = time::now() RETURN AFTER",
            )
            .bind(("id", id.to_owned()))
            .bind(("status", DeadLetterStatus::Resolved))
            .bind(("resolved_by", resolved_by.to_owned()))
            .bind(("resolution", resolution.to_owned()))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("dead letter entry {id}")))
    }

    /// Move resolved entries older than the retention window to `archived`.
    pub async fn archive_old_entries(
        older_than_days: i64,
        db: &SurrealDbClient,
    ) -> Result<u64, AppError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);

        let mut response = db
            .query(
                "UPDATE dead_letter SET status = $archived, updated_at = time::now() \
                 WHERE status = $resolved AND resolved_at != NONE AND resolved_at < $cutoff \
                 RETURN AFTER",
            )
            .bind(("archived", DeadLetterStatus::Archived))
            .bind(("resolved", DeadLetterStatus::Resolved))
            .bind(("cutoff", surrealdb::sql::Datetime::from(cutoff)))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.len() as u64)
    }

    pub async fn get_stats(db: &SurrealDbClient) -> Result<DeadLetterStats, AppError> {
        #[derive(Deserialize)]
        struct Row {
            status: DeadLetterStatus,
            count: u64,
        }

        let mut response = db
            .query("SELECT status, count() AS count FROM dead_letter GROUP BY status")
            .await?;
        let rows: Vec<Row> = response.take(0)?;

        let mut stats = DeadLetterStats {
            pending: 0,
            processing: 0,
            resolved: 0,
            archived: 0,
        };
        for row in rows {
            match row.status {
                DeadLetterStatus::Pending => stats.pending = row.count,
                DeadLetterStatus::Processing => stats.processing = row.count,
                DeadLetterStatus::Resolved => stats.resolved = row.count,
                DeadLetterStatus::Archived => stats.archived = row.count,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(task_id: &str, reason: &str) -> DeadLetterEntry {
        DeadLetterEntry::new(
            task_id.into(),
            reason.into(),
            10,
            120_000,
            vec!["timeout talking to store".into()],
            vec!["p1".into()],
            Utc::now(),
            None,
        )
    }

    async fn setup_db() -> SurrealDbClient {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("dlq_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init definitions");
        db
    }

    #[test]
    fn transitions_respect_partial_order() {
        use DeadLetterStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Resolved));
        assert!(Resolved.can_transition_to(Archived));

        assert!(!Resolved.can_transition_to(Pending));
        assert!(!Archived.can_transition_to(Pending));
        assert!(!Archived.can_transition_to(Resolved));
        assert!(!Pending.can_transition_to(Archived));
    }

    #[tokio::test]
    async fn add_and_query_by_status() {
        let db = setup_db().await;
        entry("t1", "retry_limit_exceeded: timeout")
            .add(&db)
            .await
            .expect("add entry");

        let pending = DeadLetterEntry::query(
            &DeadLetterFilter {
                status: Some(DeadLetterStatus::Pending),
                ..DeadLetterFilter::default()
            },
            &db,
        )
        .await
        .expect("query");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "t1");
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let db = setup_db().await;
        let stored = entry("t2", "retry_limit_exceeded")
            .add(&db)
            .await
            .expect("add entry");

        let result =
            DeadLetterEntry::update_status(&stored.id, DeadLetterStatus::Archived, &db).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn resolve_records_actor_and_timestamp() {
        let db = setup_db().await;
        let stored = entry("t3", "retry_duration_exceeded")
            .add(&db)
            .await
            .expect("add entry");

        let resolved = DeadLetterEntry::resolve(&stored.id, "oncall", "requeued manually", &db)
            .await
            .expect("resolve");
        assert_eq!(resolved.status, DeadLetterStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("oncall"));
        assert!(resolved.resolved_at.is_some());

        // A resolved entry cannot drop back to pending.
        let result =
            DeadLetterEntry::update_status(&stored.id, DeadLetterStatus::Pending, &db).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn archive_moves_only_old_resolved_entries() {
        let db = setup_db().await;
        let stored = entry("t4", "retry_limit_exceeded")
            .add(&db)
            .await
            .expect("add entry");
        DeadLetterEntry::resolve(&stored.id, "oncall", "done", &db)
            .await
            .expect("resolve");

        // Resolved just now: a 30 day window must not archive it.
        let archived = DeadLetterEntry::archive_old_entries(30, &db)
            .await
            .expect("archive");
        assert_eq!(archived, 0);

        // A zero-day window archives anything resolved in the past.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let archived = DeadLetterEntry::archive_old_entries(0, &db)
            .await
            .expect("archive");
        assert_eq!(archived, 1);

        let stats = DeadLetterEntry::get_stats(&db).await.expect("stats");
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.resolved, 0);
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let db = setup_db().await;
        entry("t5", "a").add(&db).await.expect("add");
        entry("t6", "b").add(&db).await.expect("add");
        let third = entry("t7", "c").add(&db).await.expect("add");
        DeadLetterEntry::resolve(&third.id, "admin", "ok", &db)
            .await
            .expect("resolve");

        let stats = DeadLetterEntry::get_stats(&db).await.expect("stats");
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.resolved, 1);
    }
}
