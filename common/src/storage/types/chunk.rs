use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::tenant::TenantContext;

/// Coarse shape of a chunk, used as a retrieval hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Paragraph,
    Code,
    Header,
}

stored_object!(Chunk, "chunk", {
    document_id: String,
    text: String,
    position_start: usize,
    position_end: usize,
    token_count: usize,
    chunk_type: ChunkType,
    #[serde(default)]
    page: Option<u32>,
    company_id: String,
    app_id: String,
    user_id: String
});

mod embedding_row {
    use crate::stored_object;

    stored_object!(ChunkEmbedding, "chunk_embedding", {
        chunk_id: String,
        embedding: Vec<f32>,
        company_id: String,
        app_id: String,
        user_id: String
    });
}

pub use embedding_row::ChunkEmbedding;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkVectorResult {
    pub chunk: Chunk,
    pub score: f32,
}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: String,
        text: String,
        position_start: usize,
        position_end: usize,
        chunk_type: ChunkType,
        page: Option<u32>,
        tenant: &TenantContext,
    ) -> Self {
        let now = Utc::now();
        // Rough token estimate; 4 chars/token is the corpus-wide average.
        let token_count = text.len().div_ceil(4);
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            document_id,
            text,
            position_start,
            position_end,
            token_count,
            chunk_type,
            page,
            company_id: tenant.company_id.clone(),
            app_id: tenant.app_id.clone(),
            user_id: tenant.user_id.clone(),
        }
    }

    /// Ordered chunks of a document.
    pub async fn for_document(
        document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM chunk WHERE document_id = $document_id \
                 ORDER BY position_start ASC",
            )
            .bind(("document_id", document_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        tenant: &TenantContext,
        db: &SurrealDbClient,
    ) -> Result<Vec<ChunkVectorResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(default)]
            chunk: Option<Chunk>,
            score: f32,
        }

        let sql = format!(
            "SELECT \
                 (SELECT * FROM type::thing('chunk', chunk_id))[0] AS chunk, \
                 vector::similarity::cosine(embedding, $embedding) AS score \
             FROM chunk_embedding \
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
                r.chunk.map(|chunk| ChunkVectorResult {
                    chunk,
                    score: r.score,
                })
            })
            .collect())
    }
}

impl ChunkEmbedding {
    pub fn new(chunk: &Chunk, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: chunk.id.clone(),
            created_at: now,
            updated_at: now,
            chunk_id: chunk.id.clone(),
            embedding,
            company_id: chunk.company_id.clone(),
            app_id: chunk.app_id.clone(),
            user_id: chunk.user_id.clone(),
        }
    }
}

/// Chunk positions must be monotonic and non-overlapping within a document.
pub fn validate_chunk_positions(chunks: &[Chunk]) -> Result<(), AppError> {
    let mut previous_end: Option<usize> = None;
    for chunk in chunks {
        if chunk.position_end <= chunk.position_start {
            return Err(AppError::Validation(format!(
                "chunk {} has an empty or inverted byte range",
                chunk.id
            )));
        }
        if let Some(end) = previous_end {
            if chunk.position_start < end {
                return Err(AppError::Validation(format!(
                    "chunk {} overlaps the previous chunk",
                    chunk.id
                )));
            }
        }
        previous_end = Some(chunk.position_end);
    }
    Ok(())
}
