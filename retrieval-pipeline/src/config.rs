use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    SemanticChunks,
    GraphTraversal,
    Hybrid,
    Adaptive,
}

impl Default for RetrievalStrategy {
    fn default() -> Self {
        Self::Hybrid
    }
}

impl std::str::FromStr for RetrievalStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "semantic_chunks" => Ok(Self::SemanticChunks),
            "graph_traversal" => Ok(Self::GraphTraversal),
            "hybrid" => Ok(Self::Hybrid),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown retrieval strategy '{other}'")),
        }
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SemanticChunks => "semantic_chunks",
            Self::GraphTraversal => "graph_traversal",
            Self::Hybrid => "hybrid",
            Self::Adaptive => "adaptive",
        };
        f.write_str(label)
    }
}

/// Which content collections a query fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentTypeMask {
    Memories,
    Documents,
    Entities,
    All,
}

impl Default for ContentTypeMask {
    fn default() -> Self {
        Self::All
    }
}

impl ContentTypeMask {
    pub fn includes_memories(self) -> bool {
        matches!(self, Self::Memories | Self::All)
    }

    pub fn includes_documents(self) -> bool {
        matches!(self, Self::Documents | Self::All)
    }

    pub fn includes_entities(self) -> bool {
        matches!(self, Self::Entities | Self::All)
    }
}

/// Structured filters applied alongside the free-text query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataFilter {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.session_id.is_none()
    }
}

/// Tunable parameters that govern each retrieval stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTuning {
    pub vector_take: usize,
    pub fts_take: usize,
    pub metadata_take: usize,
    pub graph_seed_limit: usize,
    pub graph_hops: usize,
    pub graph_neighbor_limit: usize,
    pub graph_score_decay: f32,
    pub deadline_secs: u64,
    pub rerank_max_candidates: usize,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            vector_take: 20,
            fts_take: 20,
            metadata_take: 20,
            graph_seed_limit: 5,
            graph_hops: 2,
            graph_neighbor_limit: 6,
            graph_score_decay: 0.75,
            deadline_secs: 30,
            rerank_max_candidates: 50,
        }
    }
}

/// Per-signal fusion weights. Hybrid leans on the vector signal, with
/// full-text and metadata as complements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusionWeights {
    pub vector: f32,
    pub fts: f32,
    pub metadata: f32,
    pub graph: f32,
}

impl FusionWeights {
    pub const fn hybrid() -> Self {
        Self {
            vector: 0.55,
            fts: 0.30,
            metadata: 0.15,
            graph: 0.0,
        }
    }

    pub const fn semantic_only() -> Self {
        Self {
            vector: 1.0,
            fts: 0.0,
            metadata: 0.0,
            graph: 0.0,
        }
    }

    pub const fn graph_only() -> Self {
        Self {
            vector: 0.0,
            fts: 0.0,
            metadata: 0.0,
            graph: 1.0,
        }
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self::hybrid()
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub strategy: RetrievalStrategy,
    pub content_types: ContentTypeMask,
    pub filter: MetadataFilter,
    pub limit: usize,
    pub offset: usize,
    pub rerank: bool,
    pub tuning: RetrievalTuning,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            strategy: RetrievalStrategy::default(),
            content_types: ContentTypeMask::default(),
            filter: MetadataFilter::default(),
            limit: 10,
            offset: 0,
            rerank: false,
            tuning: RetrievalTuning::default(),
        }
    }
}

impl RetrievalConfig {
    pub fn with_strategy(strategy: RetrievalStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// How many candidates reranking may see: twice the page, capped.
    pub fn rerank_candidates(&self) -> usize {
        (self.limit * 2).clamp(1, self.tuning.rerank_max_candidates)
    }
}
