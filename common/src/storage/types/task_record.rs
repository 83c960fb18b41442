use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// Precedence used by status-based reconciliation: completed beats
    /// failed/timeout beats running beats pending.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Completed => 3,
            Self::Failed | Self::Timeout => 2,
            Self::Running => 1,
            Self::Pending => 0,
        }
    }
}

stored_object!(TaskRecord, "task", {
    status: TaskStatus,
    version: u64,
    task_type: String,
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    completed_at: Option<DateTime<Utc>>
});

impl TaskRecord {
    pub fn new(task_type: String, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            status: TaskStatus::Pending,
            version: 1,
            task_type,
            params,
            result: None,
            error: None,
            completed_at: None,
        }
    }

    /// Persist a mutation, bumping the version server-side and returning the
    /// stored row. The version is the optimistic-concurrency token: callers
    /// copy it back into their hot state.
    ///
    /// Terminal tasks never move again: the update statement itself filters
    /// on the non-terminal statuses, so the guard holds even for processes
    /// that have no hot copy of the task.
    pub async fn persist_mutation(
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let completed_at = status
            .is_terminal()
            .then(|| surrealdb::sql::Datetime::from(Utc::now()));

        let mut response = db
            .query(
                "UPDATE type::thing('task', $id) SET \
                     status = $status, \
                     version += 1, \
                     result = $result, \
                     error = $error, \
                     completed_at = $completed_at ?? completed_at, \
                     updated_at = time::now() \
                 WHERE status IN ['pending', 'running'] \
                 RETURN AFTER",
            )
            .bind(("id", id.to_owned()))
            .bind(("status", status))
            .bind(("result", result))
            .bind(("error", error))
            .bind(("completed_at", completed_at))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        if let Some(row) = rows.into_iter().next() {
            return Ok(row);
        }

        // No row matched: either the task is unknown or it is terminal.
        let existing: Option<Self> = db.get_item(id).await?;
        match existing {
            Some(existing) => Err(AppError::Conflict(format!(
                "task {id} is terminal ({:?}) and cannot change",
                existing.status
            ))),
            None => Err(AppError::NotFound(format!("task {id}"))),
        }
    }

    /// Replace the stored row wholesale. Used by the reconciler when the hot
    /// copy is authoritative.
    pub async fn overwrite(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query("UPSERT type::thing('task', $id) CONTENT $task")
            .bind(("id", self.id.clone()))
            .bind(("task", self.clone()))
            .await?
            .check()?;

        Ok(())
    }
}
