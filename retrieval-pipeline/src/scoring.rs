use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::FusionWeights;

/// The sub-queries a result id can arrive from, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Vector,
    Fts,
    Metadata,
    Graph,
}

const SOURCE_ORDER: [Source; 4] = [Source::Vector, Source::Fts, Source::Metadata, Source::Graph];

/// Holds optional subscores gathered from the different retrieval signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scores {
    pub vector: Option<f32>,
    pub fts: Option<f32>,
    pub metadata: Option<f32>,
    pub graph: Option<f32>,
}

impl Scores {
    fn get(&self, source: Source) -> Option<f32> {
        match source {
            Source::Vector => self.vector,
            Source::Fts => self.fts,
            Source::Metadata => self.metadata,
            Source::Graph => self.graph,
        }
    }

    fn set_max(&mut self, source: Source, score: f32) {
        let slot = match source {
            Source::Vector => &mut self.vector,
            Source::Fts => &mut self.fts,
            Source::Metadata => &mut self.metadata,
            Source::Graph => &mut self.graph,
        };
        *slot = Some(slot.map_or(score, |existing| existing.max(score)));
    }

    /// Ordered subset of sources that actually contributed.
    pub fn sources(&self) -> Vec<Source> {
        SOURCE_ORDER
            .into_iter()
            .filter(|source| self.get(*source).is_some())
            .collect()
    }
}

/// A merge candidate: one row from one sub-query.
#[derive(Debug, Clone)]
pub struct Candidate<T> {
    pub item: T,
    pub source: Source,
    pub score: f32,
}

/// A merged result with its fused score.
#[derive(Debug, Clone)]
pub struct Merged<T> {
    pub item: T,
    pub scores: Scores,
    pub fused: f32,
    pub recency: DateTime<Utc>,
}

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

pub fn fuse_scores(scores: &Scores, weights: FusionWeights) -> f32 {
    let vector = scores.vector.unwrap_or(0.0);
    let fts = scores.fts.unwrap_or(0.0);
    let metadata = scores.metadata.unwrap_or(0.0);
    let graph = scores.graph.unwrap_or(0.0);

    clamp_unit(
        vector * weights.vector
            + fts * weights.fts
            + metadata * weights.metadata
            + graph * weights.graph,
    )
}

pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for s in scores {
        if !s.is_finite() {
            continue;
        }
        if *s < min {
            min = *s;
        }
        if *s > max {
            max = *s;
        }
    }

    if !min.is_finite() || !max.is_finite() {
        return scores.iter().map(|_| 0.0).collect();
    }

    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                clamp_unit((score - min) / (max - min))
            } else {
                0.0
            }
        })
        .collect()
}

/// Merge candidates by key: `Σ w_i · score_i` over contributing signals.
/// A key arriving twice from one signal keeps its best score.
pub fn merge_candidates<T, K, R>(
    candidates: Vec<Candidate<T>>,
    weights: FusionWeights,
    key_of: K,
    recency_of: R,
) -> Vec<Merged<T>>
where
    K: Fn(&T) -> String,
    R: Fn(&T) -> DateTime<Utc>,
{
    let mut merged: HashMap<String, Merged<T>> = HashMap::new();

    for candidate in candidates {
        let key = key_of(&candidate.item);
        match merged.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry
                    .get_mut()
                    .scores
                    .set_max(candidate.source, candidate.score);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let recency = recency_of(&candidate.item);
                let mut scores = Scores::default();
                scores.set_max(candidate.source, candidate.score);
                entry.insert(Merged {
                    item: candidate.item,
                    scores,
                    fused: 0.0,
                    recency,
                });
            }
        }
    }

    let mut results: Vec<Merged<T>> = merged
        .into_values()
        .map(|mut entry| {
            entry.fused = fuse_scores(&entry.scores, weights);
            entry
        })
        .collect();

    sort_merged(&mut results);
    results
}

/// Fused score descending; ties broken by contributing source count, then by
/// recency.
pub fn sort_merged<T>(results: &mut [Merged<T>]) {
    results.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.scores.sources().len().cmp(&a.scores.sources().len()))
            .then_with(|| b.recency.cmp(&a.recency))
    });
}

/// Per-query weights for the adaptive strategy, from cheap query features:
/// quoted phrases favor lexical match, named-entity-looking tokens favor the
/// graph, long prose favors the vector signal.
pub fn adaptive_weights(query: &str) -> FusionWeights {
    let has_quotes = query.contains('"');
    let token_count = query.split_whitespace().count();
    let capitalized = query
        .split_whitespace()
        .filter(|token| token.chars().next().is_some_and(char::is_uppercase))
        .count();

    if has_quotes {
        return FusionWeights {
            vector: 0.30,
            fts: 0.50,
            metadata: 0.10,
            graph: 0.10,
        };
    }

    if capitalized >= 2 {
        return FusionWeights {
            vector: 0.40,
            fts: 0.20,
            metadata: 0.10,
            graph: 0.30,
        };
    }

    if token_count <= 3 {
        return FusionWeights {
            vector: 0.45,
            fts: 0.40,
            metadata: 0.15,
            graph: 0.0,
        };
    }

    FusionWeights {
        vector: 0.60,
        fts: 0.20,
        metadata: 0.10,
        graph: 0.10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Item {
        id: String,
        at: DateTime<Utc>,
    }

    fn item(id: &str) -> Item {
        Item {
            id: id.into(),
            at: Utc::now(),
        }
    }

    fn merge(candidates: Vec<Candidate<Item>>, weights: FusionWeights) -> Vec<Merged<Item>> {
        merge_candidates(
            candidates,
            weights,
            |item: &Item| item.id.clone(),
            |item: &Item| item.at,
        )
    }

    #[test]
    fn multi_signal_ids_sum_their_weighted_scores() {
        let weights = FusionWeights::hybrid();
        let results = merge(
            vec![
                Candidate {
                    item: item("a"),
                    source: Source::Vector,
                    score: 0.8,
                },
                Candidate {
                    item: item("a"),
                    source: Source::Fts,
                    score: 0.5,
                },
                Candidate {
                    item: item("b"),
                    source: Source::Vector,
                    score: 0.9,
                },
            ],
            weights,
        );

        let a = results.iter().find(|r| r.item.id == "a").expect("a merged");
        let expected = 0.8 * 0.55 + 0.5 * 0.30;
        assert!((a.fused - expected).abs() < 1e-6);
        assert_eq!(a.scores.sources(), vec![Source::Vector, Source::Fts]);
    }

    #[test]
    fn source_count_breaks_score_ties() {
        // Weights that make both fused scores identical.
        let weights = FusionWeights {
            vector: 0.5,
            fts: 0.5,
            metadata: 0.0,
            graph: 0.0,
        };
        let results = merge(
            vec![
                Candidate {
                    item: item("single"),
                    source: Source::Vector,
                    score: 0.8,
                },
                Candidate {
                    item: item("double"),
                    source: Source::Vector,
                    score: 0.4,
                },
                Candidate {
                    item: item("double"),
                    source: Source::Fts,
                    score: 0.4,
                },
            ],
            weights,
        );

        assert_eq!(results[0].item.id, "double");
    }

    #[test]
    fn repeated_source_keeps_best_score() {
        let results = merge(
            vec![
                Candidate {
                    item: item("a"),
                    source: Source::Vector,
                    score: 0.3,
                },
                Candidate {
                    item: item("a"),
                    source: Source::Vector,
                    score: 0.7,
                },
            ],
            FusionWeights::semantic_only(),
        );

        assert!((results[0].fused - 0.7).abs() < 1e-6);
    }

    #[test]
    fn sources_are_reported_in_canonical_order() {
        let results = merge(
            vec![
                Candidate {
                    item: item("a"),
                    source: Source::Graph,
                    score: 0.2,
                },
                Candidate {
                    item: item("a"),
                    source: Source::Vector,
                    score: 0.2,
                },
            ],
            FusionWeights {
                vector: 0.5,
                fts: 0.0,
                metadata: 0.0,
                graph: 0.5,
            },
        );

        assert_eq!(results[0].scores.sources(), vec![Source::Vector, Source::Graph]);
    }

    #[test]
    fn normalization_handles_constant_scores() {
        assert_eq!(min_max_normalize(&[0.4, 0.4]), vec![1.0, 1.0]);
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn adaptive_weights_react_to_query_shape() {
        let quoted = adaptive_weights("find \"exact phrase\" mentions");
        assert!(quoted.fts > quoted.vector);

        let entity_heavy = adaptive_weights("Orion Gateway and Dana Petrov");
        assert!(entity_heavy.graph > 0.0);

        let short = adaptive_weights("quick fox");
        assert!((short.graph - 0.0).abs() < f32::EPSILON);

        let prose = adaptive_weights(
            "how does the enrichment worker recover from a stalled lease without duplicating graph writes",
        );
        assert!(prose.vector >= 0.6);
    }
}
