use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{
    error::AppError,
    utils::{circuit::CircuitBreaker, config::AppConfig},
};

const BREAKER_FAILURE_THRESHOLD: u32 = 3;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
const RERANK_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// One reranked document: its position in the submitted list plus the
/// relevance score the model assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankResult {
    pub index: usize,
    pub score: f32,
}

/// The rerank capability. Implementations must return results sorted by
/// descending score, truncated to `top_k`.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankResult>, AppError>;
}

/// Remote reranker speaking the common `{query, documents, top_n}` wire shape.
pub struct HttpReranker {
    endpoint: String,
    api_key: Option<String>,
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

#[derive(Deserialize)]
struct HttpRerankRow {
    index: usize,
    relevance_score: f32,
}

#[derive(Deserialize)]
struct HttpRerankResponse {
    results: Vec<HttpRerankRow>,
}

impl HttpReranker {
    pub fn new(endpoint: String, api_key: Option<String>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(RERANK_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            endpoint,
            api_key,
            http,
            breaker: CircuitBreaker::new("rerank", BREAKER_FAILURE_THRESHOLD, BREAKER_COOLDOWN),
        })
    }

    /// Build a reranker when one is configured; `None` disables reranking.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<dyn Reranker>>, AppError> {
        match &config.rerank_endpoint {
            Some(endpoint) => {
                let reranker = Self::new(endpoint.clone(), config.rerank_api_key.clone())?;
                Ok(Some(Arc::new(reranker)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankResult>, AppError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        self.breaker.check()?;

        let mut request = self.http.post(&self.endpoint).json(&json!({
            "query": query,
            "documents": documents,
            "top_n": top_k,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(err) => {
                self.breaker.on_failure();
                return Err(err.into());
            }
        };

        let parsed: HttpRerankResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(err) => {
                self.breaker.on_failure();
                return Err(err.into());
            }
        };

        self.breaker.on_success();

        let mut results: Vec<RerankResult> = parsed
            .results
            .into_iter()
            .filter(|row| row.index < documents.len())
            .map(|row| RerankResult {
                index: row.index,
                score: row.relevance_score,
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);

        Ok(results)
    }
}

/// Token-overlap reranker used in tests and as an offline fallback.
pub struct LexicalReranker;

#[async_trait]
impl Reranker for LexicalReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankResult>, AppError> {
        let query_tokens: HashSet<String> = tokenize(query);

        let mut results: Vec<RerankResult> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let doc_tokens = tokenize(doc);
                let overlap = query_tokens.intersection(&doc_tokens).count();
                let score = if query_tokens.is_empty() {
                    0.0
                } else {
                    overlap as f32 / query_tokens.len() as f32
                };
                RerankResult { index, score }
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);

        Ok(results)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}
