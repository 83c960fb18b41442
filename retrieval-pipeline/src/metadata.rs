use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{memory::Memory, tenant::TenantContext},
    },
};

use crate::{
    config::MetadataFilter,
    item::RetrievedItem,
    scoring::{Candidate, Source},
};

/// Exact-match filter path over memories: tags and session scope.
/// Every match scores 1.0; fusion weights decide how much that is worth.
pub async fn metadata_candidates(
    filter: &MetadataFilter,
    tenant: &TenantContext,
    take: usize,
    db: &SurrealDbClient,
) -> Result<Vec<Candidate<RetrievedItem>>, AppError> {
    if filter.is_empty() {
        return Ok(Vec::new());
    }

    let mut clauses = vec![
        "company_id = $company_id".to_string(),
        "app_id = $app_id".to_string(),
    ];
    if !filter.tags.is_empty() {
        clauses.push("tags CONTAINSANY $tags".to_string());
    }
    if filter.session_id.is_some() {
        clauses.push("session_id = $session_id".to_string());
    }

    let sql = format!(
        "SELECT * FROM memory WHERE {} ORDER BY created_at DESC LIMIT $limit",
        clauses.join(" AND ")
    );

    let mut query = db
        .query(sql)
        .bind(("company_id", tenant.company_id.clone()))
        .bind(("app_id", tenant.app_id.clone()))
        .bind(("limit", take as i64));
    if !filter.tags.is_empty() {
        query = query.bind(("tags", filter.tags.clone()));
    }
    if let Some(session_id) = &filter.session_id {
        query = query.bind(("session_id", session_id.clone()));
    }

    let mut response = query.await?;
    let rows: Vec<Memory> = response.take(0)?;

    Ok(rows
        .into_iter()
        .map(|memory| Candidate {
            item: RetrievedItem::from_memory(memory),
            source: Source::Metadata,
            score: 1.0,
        })
        .collect())
}
