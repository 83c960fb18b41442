use futures::{Stream, StreamExt};
use serde_json::Value;
use surrealdb::Notification;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(CacheEntry, "cache_entry", {
    value: Value,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    expires_at: DateTime<Utc>
});

mod bus_event {
    use crate::stored_object;
    use serde_json::Value;

    stored_object!(BusEvent, "event", {
        subject: String,
        payload: Value
    });
}

pub use bus_event::BusEvent;

/// Key-value cache plus pub-sub, both hosted on the shared engine.
///
/// Cache entries carry an expiry and are filtered on read; a periodic sweep
/// deletes lapsed rows. Events are plain rows consumed through a live query,
/// which gives every process a broadcast channel without extra infrastructure.
#[derive(Clone)]
pub struct CacheStore {
    db: SurrealDbClient,
}

impl CacheStore {
    pub fn new(db: SurrealDbClient) -> Self {
        Self { db }
    }

    /// Store a value under `key` for `ttl_secs` seconds, replacing any
    /// previous entry.
    pub async fn put(&self, key: &str, value: Value, ttl_secs: i64) -> Result<(), AppError> {
        let now = Utc::now();
        let entry = CacheEntry {
            id: key.to_string(),
            created_at: now,
            updated_at: now,
            value,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
        };

        self.db
            .query("UPSERT type::thing('cache_entry', $id) CONTENT $entry")
            .bind(("id", entry.id.clone()))
            .bind(("entry", entry))
            .await?
            .check()?;

        Ok(())
    }

    /// Fetch a value, treating lapsed entries as absent.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, AppError> {
        let entry: Option<CacheEntry> = self.db.get_item(key).await?;

        Ok(entry.and_then(|entry| (entry.expires_at > Utc::now()).then_some(entry.value)))
    }

    pub async fn delete(&self, key: &str) -> Result<(), AppError> {
        let _removed: Option<CacheEntry> = self.db.delete_item(key).await?;
        Ok(())
    }

    /// Delete lapsed entries. Called from the background sweeper.
    pub async fn evict_expired(&self) -> Result<(), AppError> {
        self.db
            .query("DELETE cache_entry WHERE expires_at < time::now()")
            .await?
            .check()?;
        Ok(())
    }

    /// Publish an event on `subject`. Best-effort: callers that must not fail
    /// on a publish error log and continue.
    pub async fn publish(&self, subject: &str, payload: Value) -> Result<(), AppError> {
        let now = Utc::now();
        let event = BusEvent {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            subject: subject.to_string(),
            payload,
        };

        self.db.store_item(event).await?;

        Ok(())
    }

    /// Subscribe to events whose subject starts with `subject_prefix`.
    pub async fn subscribe(
        &self,
        subject_prefix: &str,
    ) -> Result<impl Stream<Item = BusEvent>, AppError> {
        let prefix = subject_prefix.to_string();
        let stream = self.db.listen::<BusEvent>().await?;

        Ok(stream.filter_map(move |notification| {
            let prefix = prefix.clone();
            async move {
                match notification {
                    Ok(Notification { data, .. }) if data.subject.starts_with(&prefix) => {
                        Some(data)
                    }
                    _ => None,
                }
            }
        }))
    }
}
