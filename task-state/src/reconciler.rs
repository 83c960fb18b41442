use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::task_record::TaskRecord},
};

/// Which side wins when the hot copy and the repository disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStrategy {
    RepositoryFirst,
    MemoryFirst,
    VersionBased,
    StatusBased,
}

/// What the reconciler did for an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    InSync,
    MemoryUpdated,
    /// The hot copy's view was dropped to match the repository's absence;
    /// nothing was deleted from the repository.
    MemoryCleared,
    RepositoryUpdated,
    RepositoryDeleted,
}

/// Field-level diff carried on desynchronization errors and logs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateDiff {
    pub status_differs: bool,
    pub version_differs: bool,
    pub result_presence_differs: bool,
    pub error_presence_differs: bool,
    pub completed_at_presence_differs: bool,
}

impl StateDiff {
    fn of(memory: &TaskRecord, repository: &TaskRecord) -> Self {
        Self {
            status_differs: memory.status != repository.status,
            version_differs: memory.version != repository.version,
            result_presence_differs: memory.result.is_some() != repository.result.is_some(),
            error_presence_differs: memory.error.is_some() != repository.error.is_some(),
            completed_at_presence_differs: memory.completed_at.is_some()
                != repository.completed_at.is_some(),
        }
    }

    fn any(&self) -> bool {
        self.status_differs
            || self.version_differs
            || self.result_presence_differs
            || self.error_presence_differs
            || self.completed_at_presence_differs
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileMetrics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Detects divergence between the in-process task map and the repository and
/// synchronizes them under the configured strategy.
pub struct StateReconciler {
    strategy: ReconcileStrategy,
    metrics: Mutex<ReconcileMetrics>,
}

impl StateReconciler {
    pub fn new(strategy: ReconcileStrategy) -> Self {
        Self {
            strategy,
            metrics: Mutex::new(ReconcileMetrics::default()),
        }
    }

    pub fn metrics(&self) -> ReconcileMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reconcile one task id given the hot copy this process holds.
    /// Returns the authoritative record (or `None` when both sides agree the
    /// task does not exist).
    pub async fn reconcile(
        &self,
        id: &str,
        memory: Option<TaskRecord>,
        db: &SurrealDbClient,
    ) -> Result<Option<TaskRecord>, AppError> {
        let started = Instant::now();
        let outcome = self.reconcile_inner(id, memory, db).await;
        self.record(started, outcome.is_ok());
        outcome.map(|(record, action)| {
            if action != ReconcileAction::InSync {
                info!(task_id = %id, ?action, "task state reconciled");
            }
            record
        })
    }

    async fn reconcile_inner(
        &self,
        id: &str,
        memory: Option<TaskRecord>,
        db: &SurrealDbClient,
    ) -> Result<(Option<TaskRecord>, ReconcileAction), AppError> {
        let repository: Option<TaskRecord> = db.get_item(id).await.map_err(|err| {
            AppError::Desync(format!("repository read failed for task {id}: {err}"))
        })?;

        match (memory, repository) {
            (None, None) => Ok((None, ReconcileAction::InSync)),
            (None, Some(repository)) => match self.strategy {
                ReconcileStrategy::MemoryFirst => {
                    // Memory is authoritative even when absent: the stale
                    // repository row goes away.
                    let _removed: Option<TaskRecord> =
                        db.delete_item(id).await.map_err(|err| {
                            AppError::Desync(format!(
                                "failed to delete stale task {id} from repository: {err}"
                            ))
                        })?;
                    Ok((None, ReconcileAction::RepositoryDeleted))
                }
                _ => {
                    // The repository knows a task this process never saw:
                    // adopt it.
                    Ok((Some(repository), ReconcileAction::MemoryUpdated))
                }
            },
            (Some(memory), None) => match self.strategy {
                ReconcileStrategy::MemoryFirst => {
                    memory.overwrite(db).await.map_err(|err| {
                        AppError::Desync(format!(
                            "failed to restore task {id} into repository: {err}"
                        ))
                    })?;
                    Ok((Some(memory), ReconcileAction::RepositoryUpdated))
                }
                _ => Ok((None, ReconcileAction::MemoryCleared)),
            },
            (Some(memory), Some(repository)) => {
                let diff = StateDiff::of(&memory, &repository);
                if !diff.any() {
                    return Ok((Some(repository), ReconcileAction::InSync));
                }

                let repository_wins = match self.strategy {
                    ReconcileStrategy::RepositoryFirst => true,
                    ReconcileStrategy::MemoryFirst => false,
                    ReconcileStrategy::VersionBased => repository.version >= memory.version,
                    ReconcileStrategy::StatusBased => {
                        let by_status = repository
                            .status
                            .precedence()
                            .cmp(&memory.status.precedence());
                        match by_status {
                            std::cmp::Ordering::Greater => true,
                            std::cmp::Ordering::Less => false,
                            std::cmp::Ordering::Equal => repository.version >= memory.version,
                        }
                    }
                };

                if repository_wins {
                    warn!(task_id = %id, diff = ?diff, "hot copy diverged; repository wins");
                    Ok((Some(repository), ReconcileAction::MemoryUpdated))
                } else {
                    warn!(task_id = %id, diff = ?diff, "repository diverged; hot copy wins");
                    memory.overwrite(db).await.map_err(|err| {
                        AppError::Desync(format!(
                            "failed to write authoritative task {id} to repository: {err} \
                             (diff: {diff:?})"
                        ))
                    })?;
                    Ok((Some(memory), ReconcileAction::RepositoryUpdated))
                }
            }
        }
    }

    fn record(&self, started: Instant, ok: bool) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.total += 1;
        if ok {
            metrics.succeeded += 1;
        } else {
            metrics.failed += 1;
        }
        let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;
        let n = metrics.total as f64;
        metrics.average_duration_ms = metrics.average_duration_ms + (duration_ms - metrics.average_duration_ms) / n;
        metrics.last_run_at = Some(Utc::now());
    }
}
