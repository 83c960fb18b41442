use std::collections::HashMap;

use serde::Deserialize;
use surrealdb::sql::Thing;
use tracing::debug;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::Chunk, entity::Entity, memory::Memory, tenant::TenantContext, StoredObject,
        },
    },
};

use crate::{
    config::ContentTypeMask,
    item::RetrievedItem,
    scoring::{min_max_normalize, Candidate, Source},
};

#[derive(Debug, Deserialize)]
struct FtsScoreRow {
    id: Thing,
    fts_score: Option<f32>,
}

/// BM25 full-text candidates from each collection the mask requests.
/// Scores are normalized into [0,1] per collection before merging.
pub async fn fts_candidates(
    query: &str,
    tenant: &TenantContext,
    mask: ContentTypeMask,
    take: usize,
    db: &SurrealDbClient,
) -> Result<Vec<Candidate<RetrievedItem>>, AppError> {
    let mut candidates = Vec::new();

    if mask.includes_memories() {
        let rows = find_scored::<Memory>(
            take,
            query,
            db,
            "memory",
            "(content @0@ $terms)",
            "IF search::score(0) != NONE THEN search::score(0) ELSE 0 END",
            tenant,
        )
        .await?;
        push_normalized(&mut candidates, rows, RetrievedItem::from_memory);
    }

    if mask.includes_documents() {
        let rows = find_scored::<Chunk>(
            take,
            query,
            db,
            "chunk",
            "(text @0@ $terms)",
            "IF search::score(0) != NONE THEN search::score(0) ELSE 0 END",
            tenant,
        )
        .await?;
        push_normalized(&mut candidates, rows, RetrievedItem::from_chunk);
    }

    if mask.includes_entities() {
        let rows = find_scored::<Entity>(
            take,
            query,
            db,
            "entity",
            "(name @0@ $terms OR content @1@ $terms)",
            "(IF search::score(0) != NONE THEN search::score(0) ELSE 0 END) + \
             (IF search::score(1) != NONE THEN search::score(1) ELSE 0 END)",
            tenant,
        )
        .await?;
        push_normalized(&mut candidates, rows, RetrievedItem::from_entity);
    }

    Ok(candidates)
}

/// Two-step FTS: rank ids with the engine's scorer, then hydrate full rows.
async fn find_scored<T>(
    take: usize,
    query: &str,
    db: &SurrealDbClient,
    table: &str,
    filter_clause: &str,
    score_clause: &str,
    tenant: &TenantContext,
) -> Result<Vec<(T, f32)>, AppError>
where
    T: for<'de> serde::Deserialize<'de> + StoredObject,
{
    let sql = format!(
        "SELECT id, {score_clause} AS fts_score \
         FROM {table} \
         WHERE {filter_clause} \
           AND company_id = $company_id \
           AND app_id = $app_id \
         ORDER BY fts_score DESC \
         LIMIT $limit"
    );

    debug!(table, limit = take, "executing FTS sub-query");

    let mut response = db
        .query(sql)
        .bind(("terms", query.to_owned()))
        .bind(("company_id", tenant.company_id.clone()))
        .bind(("app_id", tenant.app_id.clone()))
        .bind(("limit", take as i64))
        .await?;

    let score_rows: Vec<FtsScoreRow> = response.take(0)?;

    if score_rows.is_empty() {
        return Ok(Vec::new());
    }

    let thing_ids: Vec<Thing> = score_rows.iter().map(|row| row.id.clone()).collect();

    let mut items_response = db
        .query("SELECT * FROM type::table($table) WHERE id IN $things")
        .bind(("table", table.to_owned()))
        .bind(("things", thing_ids))
        .await?;

    let items: Vec<T> = items_response.take(0)?;

    let mut item_map: HashMap<String, T> = items
        .into_iter()
        .map(|item| (item.get_id().to_owned(), item))
        .collect();

    let mut results = Vec::with_capacity(score_rows.len());
    for row in score_rows {
        let raw_id = row.id.id.to_raw();
        if let Some(item) = item_map.remove(&raw_id) {
            results.push((item, row.fts_score.unwrap_or_default()));
        }
    }

    Ok(results)
}

fn push_normalized<T>(
    candidates: &mut Vec<Candidate<RetrievedItem>>,
    rows: Vec<(T, f32)>,
    into_item: fn(T) -> RetrievedItem,
) {
    let scores: Vec<f32> = rows.iter().map(|(_, score)| *score).collect();
    let normalized = min_max_normalize(&scores);

    for ((row, _), score) in rows.into_iter().zip(normalized) {
        candidates.push(Candidate {
            item: into_item(row),
            source: Source::Fts,
            score,
        });
    }
}
