use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{chunk::Chunk, entity::Entity, memory::Memory, tenant::TenantContext},
    },
};

use crate::{
    config::ContentTypeMask,
    item::RetrievedItem,
    scoring::{Candidate, Source},
};

/// Top-K cosine search in each collection the mask requests.
pub async fn vector_candidates(
    query_embedding: &[f32],
    tenant: &TenantContext,
    mask: ContentTypeMask,
    take: usize,
    db: &SurrealDbClient,
) -> Result<Vec<Candidate<RetrievedItem>>, AppError> {
    let mut candidates = Vec::new();

    if mask.includes_memories() {
        let hits = Memory::vector_search(take, query_embedding.to_vec(), tenant, db).await?;
        candidates.extend(hits.into_iter().map(|hit| Candidate {
            item: RetrievedItem::from_memory(hit.memory),
            source: Source::Vector,
            score: hit.score.clamp(0.0, 1.0),
        }));
    }

    if mask.includes_documents() {
        let hits = Chunk::vector_search(take, query_embedding.to_vec(), tenant, db).await?;
        candidates.extend(hits.into_iter().map(|hit| Candidate {
            item: RetrievedItem::from_chunk(hit.chunk),
            source: Source::Vector,
            score: hit.score.clamp(0.0, 1.0),
        }));
    }

    if mask.includes_entities() {
        let hits = Entity::vector_search(take, query_embedding.to_vec(), tenant, db).await?;
        candidates.extend(hits.into_iter().map(|hit| Candidate {
            item: RetrievedItem::from_entity(hit.entity),
            source: Source::Vector,
            score: hit.score.clamp(0.0, 1.0),
        }));
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::types::memory::MemoryEmbedding;
    use uuid::Uuid;

    fn tenant() -> TenantContext {
        TenantContext::new("acme").with_user("u1")
    }

    #[tokio::test]
    async fn respects_the_content_mask() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("vector_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init definitions");
        ensure_runtime_indexes(&db, 3).await.expect("indexes");

        let memory = Memory::new(&tenant(), "fox".into(), "h1".into(), vec![], None, None);
        db.store_item(memory.clone()).await.expect("store memory");
        MemoryEmbedding::new(&memory, vec![1.0, 0.0, 0.0])
            .upsert(&db)
            .await
            .expect("store embedding");

        let memory_hits = vector_candidates(
            &[1.0, 0.0, 0.0],
            &tenant(),
            ContentTypeMask::Memories,
            5,
            &db,
        )
        .await
        .expect("search");
        assert_eq!(memory_hits.len(), 1);

        let entity_hits = vector_candidates(
            &[1.0, 0.0, 0.0],
            &tenant(),
            ContentTypeMask::Entities,
            5,
            &db,
        )
        .await
        .expect("search");
        assert!(entity_hits.is_empty());
    }
}
