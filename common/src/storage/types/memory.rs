use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::tenant::TenantContext;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Enriched,
    Failed,
}

stored_object!(Memory, "memory", {
    company_id: String,
    app_id: String,
    user_id: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    content: String,
    content_hash: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    importance: Option<f32>,
    enrichment_status: EnrichmentStatus
});

mod embedding_row {
    use crate::stored_object;

    stored_object!(MemoryEmbedding, "memory_embedding", {
        memory_id: String,
        embedding: Vec<f32>,
        company_id: String,
        app_id: String,
        user_id: String
    });
}

pub use embedding_row::MemoryEmbedding;

/// Vector search hit with the hydrated memory row.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryVectorResult {
    pub memory: Memory,
    pub score: f32,
}

impl Memory {
    pub fn new(
        tenant: &TenantContext,
        content: String,
        content_hash: String,
        tags: Vec<String>,
        metadata: Option<Value>,
        importance: Option<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            company_id: tenant.company_id.clone(),
            app_id: tenant.app_id.clone(),
            user_id: tenant.user_id.clone(),
            session_id: tenant.session_id.clone(),
            thread_id: tenant.thread_id.clone(),
            content,
            content_hash,
            tags,
            metadata,
            importance,
            enrichment_status: EnrichmentStatus::Pending,
        }
    }

    /// Look up an existing memory by its idempotency key.
    pub async fn find_by_content_hash(
        tenant: &TenantContext,
        content_hash: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM memory \
                 WHERE company_id = $company_id \
                   AND app_id = $app_id \
                   AND user_id = $user_id \
                   AND content_hash = $content_hash \
                 LIMIT 1",
            )
            .bind(("company_id", tenant.company_id.clone()))
            .bind(("app_id", tenant.app_id.clone()))
            .bind(("user_id", tenant.user_id.clone()))
            .bind(("content_hash", content_hash.to_owned()))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    pub async fn set_enrichment_status(
        id: &str,
        status: EnrichmentStatus,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('memory', $id) \
             SET enrichment_status = $status, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .bind(("status", status))
        .await?
        .check()?;

        Ok(())
    }

    /// Vector search over memories via the embedding table, hydrating rows
    /// and similarity scores.
    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        tenant: &TenantContext,
        db: &SurrealDbClient,
    ) -> Result<Vec<MemoryVectorResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(default)]
            memory: Option<Memory>,
            score: f32,
        }

        let sql = format!(
            "SELECT \
                 (SELECT * FROM type::thing('memory', memory_id))[0] AS memory, \
                 vector::similarity::cosine(embedding, $embedding) AS score \
             FROM memory_embedding \
             WHERE company_id = $company_id \
               AND app_id = $app_id \
               AND embedding <|{take},100|> $embedding \
             ORDER BY score DESC \
             LIMIT {take}",
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("company_id", tenant.company_id.clone()))
            .bind(("app_id", tenant.app_id.clone()))
            .await?;

        response = response.check()?;

        let rows: Vec<Row> = response.take(0)?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                r.memory.map(|memory| MemoryVectorResult {
                    memory,
                    score: r.score,
                })
            })
            .collect())
    }
}

impl MemoryEmbedding {
    pub fn new(memory: &Memory, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            // Keyed by the memory id so re-writes converge to one point.
            id: memory.id.clone(),
            created_at: now,
            updated_at: now,
            memory_id: memory.id.clone(),
            embedding,
            company_id: memory.company_id.clone(),
            app_id: memory.app_id.clone(),
            user_id: memory.user_id.clone(),
        }
    }

    pub async fn upsert(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query("UPSERT type::thing('memory_embedding', $id) CONTENT $row")
            .bind(("id", self.id.clone()))
            .bind(("row", self.clone()))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn delete(memory_id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _removed: Option<Self> = db.delete_item(memory_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::indexes::ensure_runtime_indexes;

    fn tenant() -> TenantContext {
        TenantContext::new("acme").with_user("u1")
    }

    async fn setup_db() -> SurrealDbClient {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("memory_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init definitions");
        db
    }

    #[tokio::test]
    async fn test_new_carries_tenant_and_pending_status() {
        let memory = Memory::new(&tenant(), "hello".into(), "h1".into(), vec![], None, None);

        assert_eq!(memory.company_id, "acme");
        assert_eq!(memory.user_id, "u1");
        assert_eq!(memory.enrichment_status, EnrichmentStatus::Pending);
        assert!(!memory.id.is_empty());
    }

    #[tokio::test]
    async fn test_find_by_content_hash_scopes_by_tenant() {
        let db = setup_db().await;
        let memory = Memory::new(&tenant(), "hello".into(), "h1".into(), vec![], None, None);
        db.store_item(memory.clone()).await.expect("store memory");

        let found = Memory::find_by_content_hash(&tenant(), "h1", &db)
            .await
            .expect("lookup should succeed");
        assert_eq!(found.map(|m| m.id), Some(memory.id));

        let other_tenant = TenantContext::new("globex").with_user("u1");
        let missed = Memory::find_by_content_hash(&other_tenant, "h1", &db)
            .await
            .expect("lookup should succeed");
        assert!(missed.is_none(), "other tenants must not see the row");
    }

    #[tokio::test]
    async fn test_set_enrichment_status() {
        let db = setup_db().await;
        let memory = Memory::new(&tenant(), "hello".into(), "h2".into(), vec![], None, None);
        db.store_item(memory.clone()).await.expect("store memory");

        Memory::set_enrichment_status(&memory.id, EnrichmentStatus::Enriched, &db)
            .await
            .expect("status update should succeed");

        let updated: Memory = db
            .get_item(&memory.id)
            .await
            .expect("fetch")
            .expect("memory exists");
        assert_eq!(updated.enrichment_status, EnrichmentStatus::Enriched);
    }

    #[tokio::test]
    async fn test_vector_search_finds_stored_memory() {
        let db = setup_db().await;
        ensure_runtime_indexes(&db, 3).await.expect("indexes");

        let memory = Memory::new(&tenant(), "quick fox".into(), "h3".into(), vec![], None, None);
        db.store_item(memory.clone()).await.expect("store memory");
        MemoryEmbedding::new(&memory, vec![0.9, 0.1, 0.0])
            .upsert(&db)
            .await
            .expect("store embedding");

        let results = Memory::vector_search(3, vec![0.9, 0.1, 0.0], &tenant(), &db)
            .await
            .expect("vector search");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.id, memory.id);
        assert!(results[0].score > 0.9);
    }

    #[tokio::test]
    async fn test_embedding_delete_removes_point() {
        let db = setup_db().await;
        ensure_runtime_indexes(&db, 3).await.expect("indexes");

        let memory = Memory::new(&tenant(), "temp".into(), "h4".into(), vec![], None, None);
        MemoryEmbedding::new(&memory, vec![0.1, 0.2, 0.3])
            .upsert(&db)
            .await
            .expect("store embedding");

        MemoryEmbedding::delete(&memory.id, &db)
            .await
            .expect("delete embedding");

        let remaining: Vec<MemoryEmbedding> =
            db.get_all_stored_items().await.expect("select embeddings");
        assert!(remaining.is_empty());
    }
}
