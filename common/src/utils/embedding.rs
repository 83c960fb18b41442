use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_openai::types::CreateEmbeddingRequestArgs;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use crate::{
    error::AppError,
    utils::{
        circuit::CircuitBreaker,
        config::{AppConfig, EmbeddingBackend},
        hashing::content_hash,
    },
};

const EMBEDDING_CACHE_CAPACITY: usize = 10_000;
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Whether an embedding is for stored content or an incoming query. Some
/// models are asymmetric; the distinction also keys the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    Document,
    Query,
}

impl EmbeddingKind {
    const fn cache_prefix(self) -> &'static str {
        match self {
            Self::Document => "d",
            Self::Query => "q",
        }
    }
}

enum Backend {
    OpenAi {
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        model: String,
    },
    /// Deterministic token-bucket embeddings for tests and offline runs.
    Hashed,
}

struct EmbeddingCache {
    entries: HashMap<String, Arc<Vec<f32>>>,
    order: VecDeque<String>,
}

impl EmbeddingCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, value: Arc<Vec<f32>>) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > EMBEDDING_CACHE_CAPACITY {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// The embedding capability: `embed(text, kind)` with a circuit breaker,
/// bounded retries and a content-keyed cache in front of the provider.
pub struct EmbeddingClient {
    backend: Backend,
    dimension: usize,
    breaker: CircuitBreaker,
    cache: Mutex<EmbeddingCache>,
}

impl EmbeddingClient {
    pub fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<async_openai::Client<async_openai::config::OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        let backend = match config.embedding_backend {
            EmbeddingBackend::Openai => {
                let client = openai_client.ok_or_else(|| {
                    AppError::Validation(
                        "openai embedding backend requires an OpenAI client".into(),
                    )
                })?;
                Backend::OpenAi {
                    client,
                    model: config.embedding_model.clone(),
                }
            }
            EmbeddingBackend::Hashed => Backend::Hashed,
        };

        Ok(Self {
            backend,
            dimension: config.embedding_dimension,
            breaker: CircuitBreaker::new(
                "embedding",
                BREAKER_FAILURE_THRESHOLD,
                BREAKER_COOLDOWN,
            ),
            cache: Mutex::new(EmbeddingCache::new()),
        })
    }

    /// Deterministic embedder for tests.
    pub fn new_hashed(dimension: usize) -> Self {
        Self {
            backend: Backend::Hashed,
            dimension,
            breaker: CircuitBreaker::new(
                "embedding",
                BREAKER_FAILURE_THRESHOLD,
                BREAKER_COOLDOWN,
            ),
            cache: Mutex::new(EmbeddingCache::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn is_available(&self) -> bool {
        !self.breaker.is_open()
    }

    pub async fn embed(&self, input: &str, kind: EmbeddingKind) -> Result<Vec<f32>, AppError> {
        let cache_key = format!("{}:{}", kind.cache_prefix(), content_hash(input));

        if let Some(hit) = self.cache.lock().await.get(&cache_key) {
            debug!(kind = ?kind, "embedding cache hit");
            return Ok(hit.as_ref().clone());
        }

        self.breaker.check()?;

        let embedding = match &self.backend {
            Backend::OpenAi { client, model } => {
                let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
                let result = Retry::spawn(retry_strategy, || {
                    openai_embed(client, model, self.dimension, input)
                })
                .await;

                match result {
                    Ok(embedding) => {
                        self.breaker.on_success();
                        embedding
                    }
                    Err(err) => {
                        self.breaker.on_failure();
                        return Err(err);
                    }
                }
            }
            Backend::Hashed => hashed_embedding(input, self.dimension),
        };

        if embedding.len() != self.dimension {
            return Err(AppError::InternalError(format!(
                "embedding has dimension {} but {} is configured",
                embedding.len(),
                self.dimension
            )));
        }

        self.cache
            .lock()
            .await
            .insert(cache_key, Arc::new(embedding.clone()));

        Ok(embedding)
    }
}

async fn openai_embed(
    client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    model: &str,
    dimensions: usize,
    input: &str,
) -> Result<Vec<f32>, AppError> {
    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .dimensions(dimensions as u32)
        .input([input])
        .build()?;

    let response = client.embeddings().create(request).await?;

    let embedding: Vec<f32> = response
        .data
        .first()
        .ok_or_else(|| AppError::LLMParsing("No embedding data received".into()))?
        .embedding
        .clone();

    Ok(embedding)
}

/// Token-bucket embedding: every token votes for a bucket chosen by its
/// digest, the result is l2-normalized. Stable across runs and platforms.
fn hashed_embedding(input: &str, dimension: usize) -> Vec<f32> {
    let mut buckets = vec![0.0_f32; dimension.max(1)];

    for token in input.split_whitespace() {
        let mut hasher = Sha256::new();
        hasher.update(token.to_lowercase().as_bytes());
        let digest = hasher.finalize();
        let raw = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
            digest[7],
        ]);
        let bucket = (raw % buckets.len() as u64) as usize;
        if let Some(slot) = buckets.get_mut(bucket) {
            *slot += 1.0;
        }
    }

    let norm = buckets.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut buckets {
            *value /= norm;
        }
    }

    buckets
}
