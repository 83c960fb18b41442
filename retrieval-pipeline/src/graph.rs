use std::collections::HashSet;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{entity::Entity, relationship::Relationship, tenant::TenantContext},
    },
};

use crate::{
    config::RetrievalTuning,
    item::RetrievedItem,
    scoring::{Candidate, Source},
};

/// Graph expansion: seed from the entities closest to the query embedding,
/// then walk `graph_hops` rings of `relates_to` neighbors. Each hop decays
/// the inherited score, so distant neighbors rank below their seeds.
pub async fn graph_candidates(
    query_embedding: &[f32],
    tenant: &TenantContext,
    tuning: &RetrievalTuning,
    db: &SurrealDbClient,
) -> Result<Vec<Candidate<RetrievedItem>>, AppError> {
    let seeds = Entity::vector_search(
        tuning.graph_seed_limit,
        query_embedding.to_vec(),
        tenant,
        db,
    )
    .await?;

    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut candidates: Vec<Candidate<RetrievedItem>> = Vec::new();
    // (entity, score) pairs of the ring currently being expanded.
    let mut frontier: Vec<(Entity, f32)> = Vec::new();

    for seed in seeds {
        if visited.insert(seed.entity.id.clone()) {
            let score = seed.score.clamp(0.0, 1.0);
            candidates.push(Candidate {
                item: RetrievedItem::from_entity(seed.entity.clone()),
                source: Source::Graph,
                score,
            });
            frontier.push((seed.entity, score));
        }
    }

    for _hop in 0..tuning.graph_hops {
        let mut next_frontier = Vec::new();

        for (entity, score) in &frontier {
            let neighbors = Relationship::neighbors_of(
                &entity.id,
                tenant,
                tuning.graph_neighbor_limit,
                db,
            )
            .await?;

            for (neighbor, edge_strength) in neighbors {
                if !visited.insert(neighbor.id.clone()) {
                    continue;
                }
                let inherited =
                    (score * tuning.graph_score_decay * edge_strength.max(0.1)).clamp(0.0, 1.0);
                candidates.push(Candidate {
                    item: RetrievedItem::from_entity(neighbor.clone()),
                    source: Source::Graph,
                    score: inherited,
                });
                next_frontier.push((neighbor, inherited));
            }
        }

        if next_frontier.is_empty() {
            break;
        }
        frontier = next_frontier;
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::types::{
        entity::{EntityDraft, EntityEmbedding},
        relationship::{Directionality, FactDraft},
    };
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
            confidence: 0.9,
            parent: None,
        }
    }

    async fn setup_graph() -> (SurrealDbClient, Vec<String>) {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("graph_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init definitions");
        ensure_runtime_indexes(&db, 3).await.expect("indexes");

        // Chain: Orion -> Dana -> Platform. Seeding near Orion should pull
        // both rings in.
        let ids = Entity::merge_batch(
            "ep1",
            &[draft("Orion"), draft("Dana"), draft("Platform")],
            &tenant(),
            &db,
        )
        .await
        .expect("seed entities");

        EntityEmbedding::new(&ids[0], vec![1.0, 0.0, 0.0], &tenant())
            .upsert(&db)
            .await
            .expect("embed Orion");

        Relationship::merge_facts(
            "m1",
            &[
                FactDraft {
                    subject: "Orion".into(),
                    predicate: "maintained_by".into(),
                    object: "Dana".into(),
                    confidence: 0.9,
                    weight: 0.9,
                    directionality: Directionality::Directed,
                },
                FactDraft {
                    subject: "Dana".into(),
                    predicate: "member_of".into(),
                    object: "Platform".into(),
                    confidence: 0.9,
                    weight: 0.9,
                    directionality: Directionality::Directed,
                },
            ],
            &ids,
            &tenant(),
            &db,
        )
        .await
        .expect("seed facts");

        (db, ids)
    }

    #[tokio::test]
    async fn expands_two_hops_from_the_seed() {
        let (db, _ids) = setup_graph().await;

        let results = graph_candidates(
            &[1.0, 0.0, 0.0],
            &tenant(),
            &RetrievalTuning::default(),
            &db,
        )
        .await
        .expect("graph expansion");

        let names: Vec<&str> = results.iter().map(|c| c.item.title.as_str()).collect();
        assert!(names.contains(&"Orion"));
        assert!(names.contains(&"Dana"));
        assert!(names.contains(&"Platform"), "second hop should be reached");
    }

    #[tokio::test]
    async fn hop_scores_decay() {
        let (db, _ids) = setup_graph().await;

        let results = graph_candidates(
            &[1.0, 0.0, 0.0],
            &tenant(),
            &RetrievalTuning::default(),
            &db,
        )
        .await
        .expect("graph expansion");

        let score_of = |name: &str| {
            results
                .iter()
                .find(|c| c.item.title == name)
                .map(|c| c.score)
                .expect("entity present")
        };

        assert!(score_of("Orion") > score_of("Dana"));
        assert!(score_of("Dana") > score_of("Platform"));
    }

    #[tokio::test]
    async fn one_hop_config_stops_early() {
        let (db, _ids) = setup_graph().await;

        let tuning = RetrievalTuning {
            graph_hops: 1,
            ..RetrievalTuning::default()
        };
        let results = graph_candidates(&[1.0, 0.0, 0.0], &tenant(), &tuning, &db)
            .await
            .expect("graph expansion");

        let names: Vec<&str> = results.iter().map(|c| c.item.title.as_str()).collect();
        assert!(names.contains(&"Dana"));
        assert!(!names.contains(&"Platform"));
    }

    #[tokio::test]
    async fn empty_graph_returns_no_candidates() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("graph_empty_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init definitions");
        ensure_runtime_indexes(&db, 3).await.expect("indexes");

        let results = graph_candidates(
            &[1.0, 0.0, 0.0],
            &tenant(),
            &RetrievalTuning::default(),
            &db,
        )
        .await
        .expect("graph expansion");
        assert!(results.is_empty());
    }
}
