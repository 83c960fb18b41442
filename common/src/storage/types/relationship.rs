use serde::{Deserialize, Serialize};

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::entity::Entity},
    utils::hashing::key_digest,
};

use super::tenant::TenantContext;

/// Which way a fact reads. `Directed` facts only hold source→target;
/// `Bidirectional` facts hold both ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directionality {
    Directed,
    Bidirectional,
}

/// An extracted `(subject, predicate, object)` fact before the graph merge.
#[derive(Debug, Clone, PartialEq)]
pub struct FactDraft {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f32,
    pub weight: f32,
    pub directionality: Directionality,
}

use super::StoredObject;
use surrealdb::sql::Thing;

/// A `relates_to` graph edge. Identity is (source, target, predicate) within
/// a tenant, so the record id is a digest of exactly those parts.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Relationship {
    #[serde(deserialize_with = "deserialize_edge_id")]
    pub id: String,
    #[serde(rename = "in", deserialize_with = "deserialize_edge_id")]
    pub in_: String,
    #[serde(deserialize_with = "deserialize_edge_id")]
    pub out: String,
    pub predicate: String,
    pub weight: f32,
    pub confidence: f32,
    pub directionality: Directionality,
    pub source_memory_id: String,
    pub company_id: String,
    pub app_id: String,
    pub user_id: String,
}

fn deserialize_edge_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct EdgeIdVisitor;

    impl<'de> serde::de::Visitor<'de> for EdgeIdVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or a Thing")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value)
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'de>,
        {
            let thing = Thing::deserialize(serde::de::value::MapAccessDeserializer::new(map))?;
            Ok(thing.id.to_raw())
        }
    }

    deserializer.deserialize_any(EdgeIdVisitor)
}

impl StoredObject for Relationship {
    fn table_name() -> &'static str {
        "relates_to"
    }

    fn get_id(&self) -> &str {
        &self.id
    }
}

impl Relationship {
    pub fn deterministic_id(
        tenant: &TenantContext,
        source_entity_id: &str,
        target_entity_id: &str,
        predicate: &str,
    ) -> String {
        key_digest(&[
            &tenant.company_id,
            &tenant.app_id,
            source_entity_id,
            target_entity_id,
            &predicate.trim().to_lowercase(),
        ])
    }

    /// Merge extracted facts into the graph in one transaction.
    ///
    /// Both endpoints are matched by name within the tenant; facts whose
    /// endpoints were not part of the entity pass are skipped rather than
    /// creating dangling nodes. Convergent: the edge id is a digest of
    /// (source, target, predicate), provenance is written once and
    /// confidence only rises.
    pub async fn merge_facts(
        source_memory_id: &str,
        facts: &[FactDraft],
        known_entities: &[String],
        tenant: &TenantContext,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        let resolvable: Vec<&FactDraft> = facts
            .iter()
            .filter(|fact| {
                let subject_id = Entity::deterministic_id(tenant, &fact.subject);
                let object_id = Entity::deterministic_id(tenant, &fact.object);
                known_entities.contains(&subject_id) && known_entities.contains(&object_id)
            })
            .collect();

        if resolvable.is_empty() {
            return Ok(0);
        }

        let mut statements = String::from("BEGIN TRANSACTION;");
        for idx in 0..resolvable.len() {
            statements.push_str(&format!(
                "LET $prev_{idx} = \
                     (SELECT VALUE confidence FROM type::thing('relates_to', $rel_id_{idx}))[0] ?? 0;\
                 DELETE type::thing('relates_to', $rel_id_{idx});\
                 LET $in_{idx} = type::thing('entity', $source_id_{idx});\
                 LET $out_{idx} = type::thing('entity', $target_id_{idx});\
                 LET $edge_{idx} = type::thing('relates_to', $rel_id_{idx});\
                 RELATE $in_{idx}->$edge_{idx}->$out_{idx} SET \
                     predicate = $predicate_{idx}, \
                     weight = $weight_{idx}, \
                     confidence = math::max([$prev_{idx}, $confidence_{idx}]), \
                     directionality = $direction_{idx}, \
                     source_memory_id = $source_memory_id, \
                     company_id = $company_id, \
                     app_id = $app_id, \
                     user_id = $user_id;"
            ));
        }
        statements.push_str("COMMIT TRANSACTION;");

        let mut query = db
            .query(statements)
            .bind(("source_memory_id", source_memory_id.to_owned()))
            .bind(("company_id", tenant.company_id.clone()))
            .bind(("app_id", tenant.app_id.clone()))
            .bind(("user_id", tenant.user_id.clone()));

        for (idx, fact) in resolvable.iter().enumerate() {
            let source_id = Entity::deterministic_id(tenant, &fact.subject);
            let target_id = Entity::deterministic_id(tenant, &fact.object);
            let rel_id = Self::deterministic_id(tenant, &source_id, &target_id, &fact.predicate);

            query = query
                .bind((format!("rel_id_{idx}"), rel_id))
                .bind((format!("source_id_{idx}"), source_id))
                .bind((format!("target_id_{idx}"), target_id))
                .bind((format!("predicate_{idx}"), fact.predicate.clone()))
                .bind((format!("weight_{idx}"), fact.weight.clamp(0.0, 1.0)))
                .bind((format!("confidence_{idx}"), fact.confidence))
                .bind((format!("direction_{idx}"), fact.directionality));
        }

        query.await?.check()?;

        Ok(resolvable.len())
    }

    /// Neighbors of an entity over `relates_to`, both directions.
    pub async fn neighbors_of(
        entity_id: &str,
        tenant: &TenantContext,
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<(Entity, f32)>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM relates_to \
                 WHERE company_id = $company_id AND app_id = $app_id \
                   AND (in = type::thing('entity', $entity_id) \
                        OR out = type::thing('entity', $entity_id)) \
                 LIMIT $limit",
            )
            .bind(("company_id", tenant.company_id.clone()))
            .bind(("app_id", tenant.app_id.clone()))
            .bind(("entity_id", entity_id.to_owned()))
            .bind(("limit", limit as i64))
            .await?;

        let relationships: Vec<Relationship> = response.take(0)?;

        let mut neighbors = Vec::new();
        for relationship in relationships {
            let neighbor_id = if relationship.in_ == entity_id {
                relationship.out.clone()
            } else {
                relationship.in_.clone()
            };
            let entity: Option<Entity> = db.get_item(&neighbor_id).await?;
            if let Some(entity) = entity {
                neighbors.push((entity, relationship.weight.max(relationship.confidence)));
            }
        }

        Ok(neighbors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::entity::EntityDraft;
    use uuid::Uuid;

    fn tenant() -> TenantContext {
        TenantContext::new("acme").with_user("u1")
    }

    fn draft(name: &str) -> EntityDraft {
        EntityDraft {
            name: name.into(),
            domain: "general".into(),
            entity_type: "concept".into(),
            hierarchy_level: 0,
            content: format!("about {name}"),
            confidence: 0.5,
            parent: None,
        }
    }

    fn fact(subject: &str, predicate: &str, object: &str) -> FactDraft {
        FactDraft {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            confidence: 0.7,
            weight: 0.8,
            directionality: Directionality::Directed,
        }
    }

    async fn setup_with_entities(names: &[&str]) -> (SurrealDbClient, Vec<String>) {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("rel_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init definitions");

        let drafts: Vec<EntityDraft> = names.iter().map(|n| draft(n)).collect();
        let ids = Entity::merge_batch("ep1", &drafts, &tenant(), &db)
            .await
            .expect("seed entities");
        (db, ids)
    }

    #[tokio::test]
    async fn merge_facts_creates_edges_between_known_entities() {
        let (db, ids) = setup_with_entities(&["Orion", "Dana"]).await;

        let written = Relationship::merge_facts(
            "m1",
            &[fact("Orion", "maintained_by", "Dana")],
            &ids,
            &tenant(),
            &db,
        )
        .await
        .expect("merge facts");
        assert_eq!(written, 1);

        let edges: Vec<Relationship> = db.get_all_stored_items().await.expect("edges");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].predicate, "maintained_by");
        assert_eq!(edges[0].source_memory_id, "m1");
    }

    #[tokio::test]
    async fn merge_facts_skips_unknown_endpoints() {
        let (db, ids) = setup_with_entities(&["Orion"]).await;

        let written = Relationship::merge_facts(
            "m1",
            &[fact("Orion", "maintained_by", "Ghost")],
            &ids,
            &tenant(),
            &db,
        )
        .await
        .expect("merge facts");
        assert_eq!(written, 0);

        let edges: Vec<Relationship> = db.get_all_stored_items().await.expect("edges");
        assert!(edges.is_empty());
    }

    #[tokio::test]
    async fn merge_facts_redelivery_converges_to_one_edge() {
        let (db, ids) = setup_with_entities(&["Orion", "Dana"]).await;
        let facts = vec![fact("Orion", "maintained_by", "Dana")];

        Relationship::merge_facts("m1", &facts, &ids, &tenant(), &db)
            .await
            .expect("first delivery");
        Relationship::merge_facts("m1", &facts, &ids, &tenant(), &db)
            .await
            .expect("second delivery");

        let edges: Vec<Relationship> = db.get_all_stored_items().await.expect("edges");
        assert_eq!(edges.len(), 1);
    }

    #[tokio::test]
    async fn confidence_is_monotonic_across_merges() {
        let (db, ids) = setup_with_entities(&["Orion", "Dana"]).await;

        let mut high = fact("Orion", "maintained_by", "Dana");
        high.confidence = 0.9;
        Relationship::merge_facts("m1", &[high], &ids, &tenant(), &db)
            .await
            .expect("high confidence");

        let mut low = fact("Orion", "maintained_by", "Dana");
        low.confidence = 0.3;
        Relationship::merge_facts("m2", &[low], &ids, &tenant(), &db)
            .await
            .expect("low confidence");

        let edges: Vec<Relationship> = db.get_all_stored_items().await.expect("edges");
        assert_eq!(edges.len(), 1);
        assert!((edges[0].confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn neighbors_resolve_in_both_directions() {
        let (db, ids) = setup_with_entities(&["Orion", "Dana"]).await;
        Relationship::merge_facts(
            "m1",
            &[fact("Orion", "maintained_by", "Dana")],
            &ids,
            &tenant(),
            &db,
        )
        .await
        .expect("merge facts");

        let orion_id = Entity::deterministic_id(&tenant(), "Orion");
        let dana_id = Entity::deterministic_id(&tenant(), "Dana");

        let from_orion = Relationship::neighbors_of(&orion_id, &tenant(), 10, &db)
            .await
            .expect("neighbors");
        assert_eq!(from_orion.len(), 1);
        assert_eq!(from_orion[0].0.name, "Dana");

        let from_dana = Relationship::neighbors_of(&dana_id, &tenant(), 10, &db)
            .await
            .expect("neighbors");
        assert_eq!(from_dana.len(), 1);
        assert_eq!(from_dana[0].0.name, "Orion");
    }
}
