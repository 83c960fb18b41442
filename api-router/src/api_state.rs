use std::sync::Arc;

use common::{
    storage::{cache::CacheStore, db::SurrealDbClient},
    utils::{config::AppConfig, embedding::EmbeddingClient, rerank::Reranker},
};
use memory_router::MemoryRouter;
use resilience::{DlqProcessor, RetryExecutor};
use task_state::{StateReconciler, TaskManager};

/// Everything the API surface needs, owned by the application root and
/// cloned into the router.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub cache: CacheStore,
    pub config: AppConfig,
    pub memory_router: Arc<MemoryRouter>,
    pub embedder: Arc<EmbeddingClient>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub tasks: Arc<TaskManager>,
    pub reconciler: Arc<StateReconciler>,
    pub dlq: Arc<DlqProcessor>,
    pub retry: Arc<RetryExecutor>,
}
