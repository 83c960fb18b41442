use crate::{
    error::AppError, storage::db::SurrealDbClient, stored_object, utils::hashing::key_digest,
};

use super::tenant::TenantContext;

stored_object!(Entity, "entity", {
    name: String,
    domain: String,
    entity_type: String,
    hierarchy_level: u32,
    content: String,
    #[serde(default)]
    parent_id: Option<String>,
    confidence: f32,
    mention_count: u32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    first_seen: DateTime<Utc>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    last_seen: DateTime<Utc>,
    company_id: String,
    app_id: String,
    user_id: String
});

/// An extracted entity before it is merged into the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDraft {
    pub name: String,
    pub domain: String,
    pub entity_type: String,
    pub hierarchy_level: u32,
    pub content: String,
    pub confidence: f32,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntityVectorResult {
    pub entity: Entity,
    pub score: f32,
}

mod embedding_row {
    use crate::stored_object;

    stored_object!(EntityEmbedding, "entity_embedding", {
        entity_id: String,
        embedding: Vec<f32>,
        company_id: String,
        app_id: String,
        user_id: String
    });
}

pub use embedding_row::EntityEmbedding;

impl Entity {
    /// Graph record ids are digests of the natural key so that redelivered
    /// enrichment writes converge onto the same node.
    pub fn deterministic_id(tenant: &TenantContext, name: &str) -> String {
        key_digest(&[
            &tenant.company_id,
            &tenant.app_id,
            &name.trim().to_lowercase(),
        ])
    }

    /// Merge a batch of extracted entities into the graph in one transaction
    /// and link the originating episode to each of them.
    ///
    /// Convergent: node UPSERTs key on the deterministic id, confidence only
    /// ever rises, `first_seen` is written once, and `mention_count` bumps
    /// only when the episode link did not exist yet.
    pub async fn merge_batch(
        episode_id: &str,
        drafts: &[EntityDraft],
        tenant: &TenantContext,
        db: &SurrealDbClient,
    ) -> Result<Vec<String>, AppError> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let mut statements = String::from("BEGIN TRANSACTION;");
        for idx in 0..drafts.len() {
            statements.push_str(&format!(
                "UPSERT type::thing('entity', $entity_id_{idx}) SET \
                     name = $name_{idx}, \
                     domain = $domain_{idx}, \
                     entity_type = $entity_type_{idx}, \
                     hierarchy_level = $level_{idx}, \
                     content = $content_{idx}, \
                     parent_id = $parent_{idx}, \
                     confidence = math::max([confidence ?? 0, $confidence_{idx}]), \
                     mention_count = mention_count ?? 0, \
                     first_seen = first_seen ?? time::now(), \
                     last_seen = time::now(), \
                     company_id = $company_id, \
                     app_id = $app_id, \
                     user_id = $user_id, \
                     created_at = created_at ?? time::now(), \
                     updated_at = time::now();\
                 LET $edge_{idx} = (SELECT * FROM type::thing('mentions', $edge_id_{idx}));\
                 IF array::len($edge_{idx}) = 0 {{\
                     LET $episode_rec = type::thing('episode', $episode_id);\
                     LET $entity_rec = type::thing('entity', $entity_id_{idx});\
                     LET $mention_rec = type::thing('mentions', $edge_id_{idx});\
                     RELATE $episode_rec->$mention_rec->$entity_rec SET \
                         company_id = $company_id, app_id = $app_id, user_id = $user_id;\
                     UPDATE type::thing('entity', $entity_id_{idx}) SET \
                         mention_count += 1, updated_at = time::now();\
                 }};"
            ));
        }
        statements.push_str("COMMIT TRANSACTION;");

        let mut query = db
            .query(statements)
            .bind(("episode_id", episode_id.to_owned()))
            .bind(("company_id", tenant.company_id.clone()))
            .bind(("app_id", tenant.app_id.clone()))
            .bind(("user_id", tenant.user_id.clone()));

        let mut entity_ids = Vec::with_capacity(drafts.len());
        for (idx, draft) in drafts.iter().enumerate() {
            let entity_id = Self::deterministic_id(tenant, &draft.name);
            let edge_id = key_digest(&[episode_id, &entity_id, "mentions"]);
            let parent_id = draft
                .parent
                .as_ref()
                .map(|parent| Self::deterministic_id(tenant, parent));

            query = query
                .bind((format!("entity_id_{idx}"), entity_id.clone()))
                .bind((format!("edge_id_{idx}"), edge_id))
                .bind((format!("name_{idx}"), draft.name.clone()))
                .bind((format!("domain_{idx}"), draft.domain.clone()))
                .bind((format!("entity_type_{idx}"), draft.entity_type.clone()))
                .bind((format!("level_{idx}"), draft.hierarchy_level))
                .bind((format!("content_{idx}"), draft.content.clone()))
                .bind((format!("parent_{idx}"), parent_id))
                .bind((format!("confidence_{idx}"), draft.confidence));

            entity_ids.push(entity_id);
        }

        query.await?.check()?;

        Ok(entity_ids)
    }

    pub async fn get_by_name(
        tenant: &TenantContext,
        name: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let id = Self::deterministic_id(tenant, name);
        Ok(db.get_item(&id).await?)
    }

    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        tenant: &TenantContext,
        db: &SurrealDbClient,
    ) -> Result<Vec<EntityVectorResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(default)]
            entity: Option<Entity>,
            score: f32,
        }

        let sql = format!(
            "SELECT \
                 (SELECT * FROM type::thing('entity', entity_id))[0] AS entity, \
                 vector::similarity::cosine(embedding, $embedding) AS score \
             FROM entity_embedding \
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
                r.entity.map(|entity| EntityVectorResult {
                    entity,
                    score: r.score,
                })
            })
            .collect())
    }
}

impl EntityEmbedding {
    pub fn new(entity_id: &str, embedding: Vec<f32>, tenant: &TenantContext) -> Self {
        let now = Utc::now();
        Self {
            id: entity_id.to_string(),
            created_at: now,
            updated_at: now,
            entity_id: entity_id.to_string(),
            embedding,
            company_id: tenant.company_id.clone(),
            app_id: tenant.app_id.clone(),
            user_id: tenant.user_id.clone(),
        }
    }

    pub async fn upsert(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query("UPSERT type::thing('entity_embedding', $id) CONTENT $row")
            .bind(("id", self.id.clone()))
            .bind(("row", self.clone()))
            .await?
            .check()?;

        Ok(())
    }
}
