#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod reconciler;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        cache::CacheStore,
        db::SurrealDbClient,
        types::task_record::{TaskRecord, TaskStatus},
    },
};

pub use reconciler::{ReconcileAction, ReconcileStrategy, StateReconciler};

/// Tracks long-running task state: a hot in-process copy mirrored by the
/// durable `task` table. Mutations are serialized per task id and always
/// land in the repository first, then the hot map, then the event channel.
pub struct TaskManager {
    db: Arc<SurrealDbClient>,
    events: CacheStore,
    hot: Mutex<HashMap<String, TaskRecord>>,
    mutation_locks: memory_locks::KeyedLocks,
}

impl TaskManager {
    pub fn new(db: Arc<SurrealDbClient>, events: CacheStore) -> Self {
        Self {
            db,
            events,
            hot: Mutex::new(HashMap::new()),
            mutation_locks: memory_locks::KeyedLocks::new(),
        }
    }

    /// Create a task in both layers and return its id.
    pub async fn create_task(&self, task_type: &str, params: Value) -> Result<String, AppError> {
        let record = TaskRecord::new(task_type.to_string(), params);
        let id = record.id.clone();

        self.db.store_item(record.clone()).await?;
        self.hot.lock().await.insert(id.clone(), record);

        self.emit("task:created", &id, TaskStatus::Pending).await;
        Ok(id)
    }

    /// Mutate a task: repository first (version bump), then hot copy.
    ///
    /// The hot-map check below is only a fast path; the authoritative
    /// terminal guard lives in the update statement itself
    /// (`TaskRecord::persist_mutation`), so it also holds when this process
    /// has never seen the task.
    pub async fn update_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<TaskRecord, AppError> {
        let _guard = self.mutation_locks.acquire(id).await;

        let current = self.hot.lock().await.get(id).cloned();
        if let Some(current) = current {
            if current.status.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "task {id} is terminal ({:?}) and cannot change",
                    current.status
                )));
            }
        }

        let stored = TaskRecord::persist_mutation(id, status, result, error, &self.db).await?;
        self.hot
            .lock()
            .await
            .insert(id.to_string(), stored.clone());

        self.emit("task:updated", id, status).await;
        Ok(stored)
    }

    /// The hot copy, if this process has seen the task.
    pub async fn get_hot(&self, id: &str) -> Option<TaskRecord> {
        self.hot.lock().await.get(id).cloned()
    }

    /// Repository copy.
    pub async fn get_stored(&self, id: &str) -> Result<Option<TaskRecord>, AppError> {
        Ok(self.db.get_item(id).await?)
    }

    /// Read through the reconciler: detects divergence between the copies
    /// and synchronizes them before answering.
    pub async fn get_reconciled(
        &self,
        id: &str,
        reconciler: &StateReconciler,
    ) -> Result<Option<TaskRecord>, AppError> {
        let hot = self.get_hot(id).await;
        let outcome = reconciler.reconcile(id, hot, &self.db).await?;

        if let Some(record) = &outcome {
            self.hot
                .lock()
                .await
                .insert(id.to_string(), record.clone());
        } else {
            self.hot.lock().await.remove(id);
        }

        Ok(outcome)
    }

    /// Replace the hot copy without touching the repository. Only the
    /// reconciler and tests should need this.
    pub async fn put_hot(&self, record: TaskRecord) {
        self.hot.lock().await.insert(record.id.clone(), record);
    }

    async fn emit(&self, subject: &str, id: &str, status: TaskStatus) {
        if let Err(err) = self
            .events
            .publish(subject, json!({"task_id": id, "status": status}))
            .await
        {
            warn!(error = %err, "failed to publish task event");
        } else {
            info!(task_id = %id, ?status, subject, "task state event");
        }
    }
}

/// Per-key async locks, local to this crate to serialize task mutations.
mod memory_locks {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

    #[derive(Default)]
    pub struct KeyedLocks {
        entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    }

    impl KeyedLocks {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
            let lock = {
                let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                Arc::clone(
                    entries
                        .entry(key.to_string())
                        .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
                )
            };
            lock.lock_owned().await
        }
    }
}
