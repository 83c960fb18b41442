use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        cache::CacheStore,
        db::SurrealDbClient,
        types::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterStatus},
    },
};
use task_state::TaskManager;

#[derive(Debug, Clone)]
pub struct DlqProcessorConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub transient_patterns: Vec<String>,
    pub auto_retry: bool,
    pub archive_after_days: i64,
}

impl Default for DlqProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 10,
            transient_patterns: vec!["timeout".into(), "network".into(), "connection".into()],
            auto_retry: true,
            archive_after_days: 30,
        }
    }
}

/// Background poller over pending dead-letter entries: auto-retries the
/// transient ones through the task manager and flags the rest for humans.
pub struct DlqProcessor {
    db: Arc<SurrealDbClient>,
    events: CacheStore,
    tasks: Arc<TaskManager>,
    config: DlqProcessorConfig,
}

impl DlqProcessor {
    pub fn new(
        db: Arc<SurrealDbClient>,
        events: CacheStore,
        tasks: Arc<TaskManager>,
        config: DlqProcessorConfig,
    ) -> Self {
        Self {
            db,
            events,
            tasks,
            config,
        }
    }

    /// Poll until cancelled. A slower timer runs the archival sweep.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticks_since_archive: u64 = 0;
        let archive_every = (3_600 / self.config.poll_interval.as_secs().max(1)).max(1);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = sleep(self.config.poll_interval) => {}
            }

            if let Err(err) = self.process_batch().await {
                warn!(error = %err, "dead letter batch processing failed");
            }

            ticks_since_archive += 1;
            if ticks_since_archive >= archive_every {
                ticks_since_archive = 0;
                match DeadLetterEntry::archive_old_entries(self.config.archive_after_days, &self.db)
                    .await
                {
                    Ok(archived) if archived > 0 => {
                        info!(archived, "archived resolved dead letter entries");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "dead letter archival failed"),
                }
            }
        }
    }

    /// One polling tick: examine up to `batch_size` pending entries.
    pub async fn process_batch(&self) -> Result<usize, AppError> {
        let pending = DeadLetterEntry::query(
            &DeadLetterFilter {
                status: Some(DeadLetterStatus::Pending),
                limit: self.config.batch_size,
                ..DeadLetterFilter::default()
            },
            &self.db,
        )
        .await?;

        let mut processed = 0;
        for entry in pending {
            match self.process_entry(&entry).await {
                Ok(()) => processed += 1,
                Err(err) => {
                    warn!(entry_id = %entry.id, error = %err, "failed to process dead letter entry");
                }
            }
        }

        Ok(processed)
    }

    async fn process_entry(&self, entry: &DeadLetterEntry) -> Result<(), AppError> {
        let transient = self.is_transient(&entry.reason);
        let replayable = replay_params(entry.metadata.as_ref());

        if self.config.auto_retry && transient {
            if let Some((task_type, params)) = replayable {
                return self.auto_retry(entry, &task_type, params).await;
            }
        }

        // Everything else waits for a human; the entry stays pending.
        self.emit(
            "dlq:manual_review_required",
            json!({
                "entry_id": entry.id,
                "task_id": entry.task_id,
                "reason": entry.reason,
                "attempts": entry.attempts,
                "errors": entry.errors,
                "transient": transient,
            }),
        )
        .await;

        Ok(())
    }

    async fn auto_retry(
        &self,
        entry: &DeadLetterEntry,
        task_type: &str,
        params: Value,
    ) -> Result<(), AppError> {
        DeadLetterEntry::update_status(&entry.id, DeadLetterStatus::Processing, &self.db).await?;

        match self.tasks.create_task(task_type, params).await {
            Ok(task_id) => {
                DeadLetterEntry::resolve(
                    &entry.id,
                    "dlq-processor",
                    &format!("auto-retried as task {task_id}"),
                    &self.db,
                )
                .await?;
                self.emit(
                    "dlq:auto_retried",
                    json!({"entry_id": entry.id, "task_id": task_id}),
                )
                .await;
                info!(entry_id = %entry.id, new_task_id = %task_id, "dead letter entry auto-retried");
                Ok(())
            }
            Err(err) => {
                // Task creation failed: back to pending for the next tick.
                DeadLetterEntry::update_status(&entry.id, DeadLetterStatus::Pending, &self.db)
                    .await?;
                self.emit(
                    "dlq:retry_failed",
                    json!({"entry_id": entry.id, "error": err.to_string()}),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Re-run a pending entry on explicit human approval, transient or not.
    pub async fn manual_retry(&self, entry_id: &str, approved_by: &str) -> Result<String, AppError> {
        let entry: DeadLetterEntry = self
            .db
            .get_item(entry_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dead letter entry {entry_id}")))?;

        let Some((task_type, params)) = replay_params(entry.metadata.as_ref()) else {
            return Err(AppError::Validation(format!(
                "dead letter entry {entry_id} carries no replayable task metadata"
            )));
        };

        DeadLetterEntry::update_status(entry_id, DeadLetterStatus::Processing, &self.db).await?;

        match self.tasks.create_task(&task_type, params).await {
            Ok(task_id) => {
                DeadLetterEntry::resolve(
                    entry_id,
                    approved_by,
                    &format!("manually retried as task {task_id}"),
                    &self.db,
                )
                .await?;
                Ok(task_id)
            }
            Err(err) => {
                DeadLetterEntry::update_status(entry_id, DeadLetterStatus::Pending, &self.db)
                    .await?;
                Err(err)
            }
        }
    }

    /// Close a pending entry without re-running anything.
    pub async fn manual_resolve(
        &self,
        entry_id: &str,
        resolved_by: &str,
        resolution: &str,
    ) -> Result<DeadLetterEntry, AppError> {
        DeadLetterEntry::resolve(entry_id, resolved_by, resolution, &self.db).await
    }

    fn is_transient(&self, reason: &str) -> bool {
        let lowered = reason.to_lowercase();
        self.config
            .transient_patterns
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()))
    }

    async fn emit(&self, subject: &str, payload: Value) {
        if let Err(err) = self.events.publish(subject, payload).await {
            warn!(subject, error = %err, "failed to publish dlq event");
        }
    }
}

/// `{task_type, params}` from the entry metadata, when present.
fn replay_params(metadata: Option<&Value>) -> Option<(String, Value)> {
    let metadata = metadata?;
    let task_type = metadata.get("task_type")?.as_str()?.to_string();
    let params = metadata.get("params").cloned().unwrap_or(Value::Null);
    Some((task_type, params))
}
