use crate::error::AppError;

use super::types::StoredObject;
use futures::Stream;
use std::{ops::Deref, sync::Arc};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Notification, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

impl SurrealDbClient {
    /// Connect, sign in and select the namespace/database for this deployment.
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Define the non-vector schema pieces: unique idempotency index and the
    /// secondary indexes the queue, DLQ and retry subsystems filter on.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_memory_idempotency ON memory \
                 FIELDS company_id, app_id, user_id, content_hash UNIQUE;
                 DEFINE INDEX IF NOT EXISTS idx_memory_tenant ON memory FIELDS company_id, app_id;
                 DEFINE INDEX IF NOT EXISTS idx_job_status ON enrichment_job FIELDS status;
                 DEFINE INDEX IF NOT EXISTS idx_job_created ON enrichment_job FIELDS created_at;
                 DEFINE INDEX IF NOT EXISTS idx_dlq_status ON dead_letter FIELDS status;
                 DEFINE INDEX IF NOT EXISTS idx_dlq_reason ON dead_letter FIELDS reason;
                 DEFINE INDEX IF NOT EXISTS idx_dlq_task ON dead_letter FIELDS task_id;
                 DEFINE INDEX IF NOT EXISTS idx_dlq_created ON dead_letter FIELDS created_at;
                 DEFINE INDEX IF NOT EXISTS idx_pattern_fingerprint ON error_pattern \
                 FIELDS fingerprint, service, operation;
                 DEFINE INDEX IF NOT EXISTS idx_task_status ON task FIELDS status;
                 DEFINE INDEX IF NOT EXISTS idx_chunk_document ON chunk FIELDS document_id;
                 DEFINE INDEX IF NOT EXISTS idx_cache_expiry ON cache_entry FIELDS expires_at;",
            )
            .await?;

        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve all objects from a certain table
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    /// Operation to retrieve a single object by its ID
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    /// Operation to delete a single object by its ID
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    /// Operation to listen to a table for updates via a live query
    pub async fn listen<T>(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification<T>, Error>>, Error>
    where
        T: for<'de> StoredObject + std::marker::Unpin,
    {
        self.client.select(T::table_name()).live().await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
