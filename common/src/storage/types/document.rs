use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::{
    chunk::{validate_chunk_positions, Chunk, ChunkEmbedding},
    tenant::TenantContext,
};

stored_object!(Document, "document", {
    title: String,
    #[serde(default)]
    source_url: Option<String>,
    content_hash: String,
    chunk_count: usize,
    #[serde(default)]
    metadata: Option<Value>,
    company_id: String,
    app_id: String,
    user_id: String
});

impl Document {
    pub fn new(
        title: String,
        source_url: Option<String>,
        content_hash: String,
        metadata: Option<Value>,
        tenant: &TenantContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            title,
            source_url,
            content_hash,
            chunk_count: 0,
            metadata,
            company_id: tenant.company_id.clone(),
            app_id: tenant.app_id.clone(),
            user_id: tenant.user_id.clone(),
        }
    }

    /// Store a document together with its chunks and their embeddings in one
    /// transaction, after validating the chunk byte ranges.
    pub async fn store_with_chunks(
        mut self,
        chunks: Vec<(Chunk, Vec<f32>)>,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let chunk_rows: Vec<Chunk> = chunks.iter().map(|(chunk, _)| chunk.clone()).collect();
        validate_chunk_positions(&chunk_rows)?;

        for (chunk, _) in &chunks {
            if chunk.document_id != self.id {
                return Err(AppError::Validation(format!(
                    "chunk {} does not belong to document {}",
                    chunk.id, self.id
                )));
            }
        }

        self.chunk_count = chunks.len();

        let mut statements = String::from("BEGIN TRANSACTION;");
        statements.push_str("CREATE type::thing('document', $document_id) CONTENT $document;");
        for idx in 0..self.chunk_count {
            statements.push_str(&format!(
                "CREATE type::thing('chunk', $chunk_id_{idx}) CONTENT $chunk_{idx};\
                 CREATE type::thing('chunk_embedding', $emb_id_{idx}) CONTENT $emb_{idx};"
            ));
        }
        statements.push_str("COMMIT TRANSACTION;");

        let mut query = db
            .query(statements)
            .bind(("document_id", self.id.clone()))
            .bind(("document", self.clone()));

        for (idx, (chunk, embedding)) in chunks.into_iter().enumerate() {
            let emb = ChunkEmbedding::new(&chunk, embedding);
            query = query
                .bind((format!("chunk_id_{idx}"), chunk.id.clone()))
                .bind((format!("chunk_{idx}"), chunk))
                .bind((format!("emb_id_{idx}"), emb.id.clone()))
                .bind((format!("emb_{idx}"), emb));
        }

        query.await?.check()?;

        Ok(self)
    }

    /// Delete the document and every derived row in one transaction.
    pub async fn delete_with_chunks(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "BEGIN TRANSACTION;
             DELETE chunk_embedding WHERE chunk_id IN \
                 (SELECT VALUE record::id(id) FROM chunk WHERE document_id = $document_id);
             DELETE chunk WHERE document_id = $document_id;
             DELETE type::thing('document', $document_id);
             COMMIT TRANSACTION;",
        )
        .bind(("document_id", id.to_owned()))
        .await?
        .check()?;

        Ok(())
    }

    pub async fn list_for_tenant(
        tenant: &TenantContext,
        limit: usize,
        offset: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM document \
                 WHERE company_id = $company_id AND app_id = $app_id \
                 ORDER BY created_at DESC \
                 LIMIT $limit START $offset",
            )
            .bind(("company_id", tenant.company_id.clone()))
            .bind(("app_id", tenant.app_id.clone()))
            .bind(("limit", limit as i64))
            .bind(("offset", offset as i64))
            .await?;

        Ok(response.take(0)?)
    }

    /// Concatenated chunk text in document order, used by the context route.
    pub async fn assemble_context(
        id: &str,
        max_chars: usize,
        db: &SurrealDbClient,
    ) -> Result<String, AppError> {
        let chunks = Chunk::for_document(id, db).await?;
        let mut context = String::new();
        for chunk in chunks {
            if !context.is_empty() {
                context.push_str("\n\n");
            }
            context.push_str(&chunk.text);
            if context.len() >= max_chars {
                context.truncate(max_chars);
                break;
            }
        }
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::indexes::ensure_runtime_indexes;
    use crate::storage::types::chunk::ChunkType;

    fn tenant() -> TenantContext {
        TenantContext::new("acme").with_user("u1")
    }

    async fn setup_db() -> SurrealDbClient {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("document_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init definitions");
        ensure_runtime_indexes(&db, 3).await.expect("indexes");
        db
    }

    fn make_chunks(document: &Document, texts: &[&str]) -> Vec<(Chunk, Vec<f32>)> {
        let mut cursor = 0;
        texts
            .iter()
            .map(|text| {
                let start = cursor;
                cursor += text.len();
                (
                    Chunk::new(
                        document.id.clone(),
                        (*text).to_string(),
                        start,
                        cursor,
                        ChunkType::Paragraph,
                        None,
                        &tenant(),
                    ),
                    vec![0.1, 0.2, 0.3],
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn store_with_chunks_persists_everything() {
        let db = setup_db().await;
        let document = Document::new("Guide".into(), None, "h1".into(), None, &tenant());
        let chunks = make_chunks(&document, &["first part", "second part"]);

        let stored = document
            .store_with_chunks(chunks, &db)
            .await
            .expect("store document");
        assert_eq!(stored.chunk_count, 2);

        let fetched: Option<Document> = db.get_item(&stored.id).await.expect("fetch");
        assert!(fetched.is_some());

        let chunk_rows = Chunk::for_document(&stored.id, &db).await.expect("chunks");
        assert_eq!(chunk_rows.len(), 2);
        assert!(chunk_rows[0].position_start < chunk_rows[1].position_start);
    }

    #[tokio::test]
    async fn store_rejects_overlapping_chunks() {
        let db = setup_db().await;
        let document = Document::new("Bad".into(), None, "h2".into(), None, &tenant());

        let c1 = Chunk::new(
            document.id.clone(),
            "aaaa".into(),
            0,
            10,
            ChunkType::Paragraph,
            None,
            &tenant(),
        );
        let c2 = Chunk::new(
            document.id.clone(),
            "bbbb".into(),
            5,
            15,
            ChunkType::Paragraph,
            None,
            &tenant(),
        );

        let result = document
            .store_with_chunks(vec![(c1, vec![0.0; 3]), (c2, vec![0.0; 3])], &db)
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn delete_removes_document_chunks_and_embeddings() {
        let db = setup_db().await;
        let document = Document::new("Gone".into(), None, "h3".into(), None, &tenant());
        let chunks = make_chunks(&document, &["only part"]);
        let stored = document
            .store_with_chunks(chunks, &db)
            .await
            .expect("store document");

        Document::delete_with_chunks(&stored.id, &db)
            .await
            .expect("delete document");

        let document_row: Option<Document> = db.get_item(&stored.id).await.expect("fetch");
        assert!(document_row.is_none());

        let chunk_rows = Chunk::for_document(&stored.id, &db).await.expect("chunks");
        assert!(chunk_rows.is_empty());

        let embeddings: Vec<ChunkEmbedding> =
            db.get_all_stored_items().await.expect("embeddings");
        assert!(embeddings.is_empty());
    }

    #[tokio::test]
    async fn assemble_context_concatenates_in_order() {
        let db = setup_db().await;
        let document = Document::new("Ctx".into(), None, "h4".into(), None, &tenant());
        let chunks = make_chunks(&document, &["alpha", "beta"]);
        let stored = document
            .store_with_chunks(chunks, &db)
            .await
            .expect("store document");

        let context = Document::assemble_context(&stored.id, 1_000, &db)
            .await
            .expect("context");
        assert_eq!(context, "alpha\n\nbeta");
    }
}
