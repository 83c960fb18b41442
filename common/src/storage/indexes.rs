use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{error::AppError, storage::db::SurrealDbClient};

const FTS_ANALYZER_NAME: &str = "app_en_fts_analyzer";

#[derive(Clone, Copy)]
struct HnswIndexSpec {
    index_name: &'static str,
    table: &'static str,
    options: &'static str,
}

const fn hnsw_index_specs() -> [HnswIndexSpec; 3] {
    [
        HnswIndexSpec {
            index_name: "idx_embedding_memory",
            table: "memory_embedding",
            options: "DIST COSINE TYPE F32 EFC 100 M 8",
        },
        HnswIndexSpec {
            index_name: "idx_embedding_chunk",
            table: "chunk_embedding",
            options: "DIST COSINE TYPE F32 EFC 100 M 8",
        },
        HnswIndexSpec {
            index_name: "idx_embedding_entity",
            table: "entity_embedding",
            options: "DIST COSINE TYPE F32 EFC 100 M 8",
        },
    ]
}

#[derive(Clone, Copy)]
struct FtsIndexSpec {
    index_name: &'static str,
    table: &'static str,
    field: &'static str,
}

const fn fts_index_specs() -> [FtsIndexSpec; 5] {
    [
        FtsIndexSpec {
            index_name: "memory_fts_content_idx",
            table: "memory",
            field: "content",
        },
        FtsIndexSpec {
            index_name: "chunk_fts_text_idx",
            table: "chunk",
            field: "text",
        },
        FtsIndexSpec {
            index_name: "entity_fts_name_idx",
            table: "entity",
            field: "name",
        },
        FtsIndexSpec {
            index_name: "entity_fts_content_idx",
            table: "entity",
            field: "content",
        },
        FtsIndexSpec {
            index_name: "document_fts_title_idx",
            table: "document",
            field: "title",
        },
    ]
}

impl HnswIndexSpec {
    fn definition_if_not_exists(&self, dimension: usize) -> String {
        format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} \
             FIELDS embedding HNSW DIMENSION {dimension} {options};",
            index = self.index_name,
            table = self.table,
            dimension = dimension,
            options = self.options,
        )
    }

    fn definition_overwrite(&self, dimension: usize) -> String {
        format!(
            "DEFINE INDEX OVERWRITE {index} ON TABLE {table} \
             FIELDS embedding HNSW DIMENSION {dimension} {options};",
            index = self.index_name,
            table = self.table,
            dimension = dimension,
            options = self.options,
        )
    }
}

impl FtsIndexSpec {
    fn definition(&self) -> String {
        format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} FIELDS {field} \
             SEARCH ANALYZER {analyzer} BM25;",
            index = self.index_name,
            table = self.table,
            field = self.field,
            analyzer = FTS_ANALYZER_NAME,
        )
    }
}

/// Build runtime Surreal indexes (FTS + HNSW).
/// Idempotent: safe to call multiple times and will overwrite HNSW definitions
/// when the embedding dimension changes.
pub async fn ensure_runtime_indexes(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<(), AppError> {
    ensure_runtime_indexes_inner(db, embedding_dimension)
        .await
        .map_err(|err| AppError::InternalError(err.to_string()))
}

async fn ensure_runtime_indexes_inner(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<()> {
    create_fts_analyzer(db).await?;

    // FTS indexes are created sequentially; concurrent definitions clash in Surreal.
    for spec in fts_index_specs() {
        if index_exists(db, spec.table, spec.index_name).await? {
            continue;
        }
        db.client
            .query(spec.definition())
            .await
            .with_context(|| format!("creating index {} on {}", spec.index_name, spec.table))?
            .check()
            .with_context(|| format!("index definition failed for {}", spec.index_name))?;
    }

    for spec in hnsw_index_specs() {
        match existing_hnsw_dimension(db, &spec).await? {
            None => {
                db.client
                    .query(spec.definition_if_not_exists(embedding_dimension))
                    .await
                    .with_context(|| format!("creating HNSW index {}", spec.index_name))?
                    .check()
                    .with_context(|| format!("HNSW definition failed for {}", spec.index_name))?;
            }
            Some(current) if current == embedding_dimension => {}
            Some(current) => {
                info!(
                    index = spec.index_name,
                    table = spec.table,
                    existing_dimension = current,
                    target_dimension = embedding_dimension,
                    "Overwriting HNSW index to match new embedding dimension"
                );
                db.client
                    .query(spec.definition_overwrite(embedding_dimension))
                    .await
                    .with_context(|| format!("overwriting HNSW index {}", spec.index_name))?
                    .check()
                    .with_context(|| format!("HNSW overwrite failed for {}", spec.index_name))?;
            }
        }
    }

    Ok(())
}

async fn existing_hnsw_dimension(
    db: &SurrealDbClient,
    spec: &HnswIndexSpec,
) -> Result<Option<usize>> {
    let Some(indexes) = table_index_definitions(db, spec.table).await? else {
        return Ok(None);
    };

    let Some(definition) = indexes
        .get(spec.index_name)
        .and_then(|details| details.get("Strand"))
        .and_then(|v| v.as_str())
    else {
        return Ok(None);
    };

    Ok(extract_dimension(definition).and_then(|d| usize::try_from(d).ok()))
}

fn extract_dimension(definition: &str) -> Option<u64> {
    definition
        .split("DIMENSION")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.trim_end_matches(';').parse::<u64>().ok())
}

async fn create_fts_analyzer(db: &SurrealDbClient) -> Result<()> {
    // Prefer snowball stemming; fall back to ascii-only when the filter is
    // unavailable in the running Surreal build.
    let snowball_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {analyzer}
            TOKENIZERS class
            FILTERS lowercase, ascii, snowball(english);",
        analyzer = FTS_ANALYZER_NAME
    );

    match db.client.query(snowball_query).await {
        Ok(res) => {
            if res.check().is_ok() {
                return Ok(());
            }
        }
        Err(err) => {
            warn!(
                error = %err,
                "Snowball analyzer creation errored; attempting ascii fallback definition"
            );
        }
    }

    let fallback_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {analyzer}
            TOKENIZERS class
            FILTERS lowercase, ascii;",
        analyzer = FTS_ANALYZER_NAME
    );

    db.client
        .query(fallback_query)
        .await
        .context("creating fallback FTS analyzer")?
        .check()
        .context("failed to create fallback FTS analyzer")?;

    Ok(())
}

async fn table_index_definitions(
    db: &SurrealDbClient,
    table: &str,
) -> Result<Option<Map<String, Value>>> {
    let info_query = format!("INFO FOR TABLE {table};");
    let mut response = db
        .client
        .query(info_query)
        .await
        .with_context(|| format!("fetching table info for {table}"))?;

    let info: surrealdb::Value = response
        .take(0)
        .context("failed to take table info response")?;

    let info_json: Value =
        serde_json::to_value(info).context("serializing table info to JSON for parsing")?;

    Ok(info_json
        .get("Object")
        .and_then(|o| o.get("indexes"))
        .and_then(|i| i.get("Object"))
        .and_then(|i| i.as_object())
        .cloned())
}

async fn index_exists(db: &SurrealDbClient, table: &str, index_name: &str) -> Result<bool> {
    let Some(indexes) = table_index_definitions(db, table).await? else {
        return Ok(false);
    };

    Ok(indexes.contains_key(index_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn extract_dimension_parses_value() {
        let definition = "DEFINE INDEX idx_embedding_memory ON TABLE memory_embedding \
                          FIELDS embedding HNSW DIMENSION 1024 DIST COSINE TYPE F32 EFC 100 M 8;";
        assert_eq!(extract_dimension(definition), Some(1024));
    }

    #[tokio::test]
    async fn ensure_runtime_indexes_is_idempotent() {
        let namespace = "indexes_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        db.ensure_initialized()
            .await
            .expect("base definitions should succeed");

        ensure_runtime_indexes(&db, 1024)
            .await
            .expect("initial index creation");

        ensure_runtime_indexes(&db, 1024)
            .await
            .expect("second index creation");
    }

    #[tokio::test]
    async fn ensure_hnsw_index_overwrites_dimension() {
        let namespace = "indexes_dim";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        db.ensure_initialized()
            .await
            .expect("base definitions should succeed");

        ensure_runtime_indexes(&db, 1024)
            .await
            .expect("initial index creation");

        ensure_runtime_indexes(&db, 128)
            .await
            .expect("overwritten index creation");
    }
}
