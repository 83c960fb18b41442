use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Openai,
    Hashed,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStrategyKind {
    RepositoryFirst,
    MemoryFirst,
    VersionBased,
    StatusBased,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,

    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    #[serde(default)]
    pub rerank_endpoint: Option<String>,
    #[serde(default)]
    pub rerank_api_key: Option<String>,

    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_worker_rate_per_sec")]
    pub worker_rate_per_sec: u32,
    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,
    #[serde(default = "default_job_max_attempts")]
    pub job_max_attempts: u32,
    #[serde(default = "default_job_backoff_base_secs")]
    pub job_backoff_base_secs: u64,
    #[serde(default = "default_queue_pressure_threshold")]
    pub queue_pressure_threshold: usize,
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: i64,
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: i64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_max_duration_secs")]
    pub retry_max_duration_secs: u64,

    #[serde(default = "default_dlq_poll_secs")]
    pub dlq_poll_secs: u64,
    #[serde(default = "default_dlq_batch_size")]
    pub dlq_batch_size: usize,
    #[serde(default = "default_dlq_transient_patterns")]
    pub dlq_transient_patterns: Vec<String>,
    #[serde(default = "default_dlq_archive_after_days")]
    pub dlq_archive_after_days: i64,
    #[serde(default = "default_dlq_auto_retry")]
    pub dlq_auto_retry: bool,

    #[serde(default = "default_retrieval_deadline_secs")]
    pub retrieval_deadline_secs: u64,

    #[serde(default = "default_reconcile_strategy")]
    pub reconcile_strategy: ReconcileStrategyKind,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::Openai
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    1024
}

fn default_max_content_bytes() -> usize {
    100 * 1024
}

fn default_worker_concurrency() -> usize {
    5
}

fn default_worker_rate_per_sec() -> u32 {
    10
}

fn default_job_lease_secs() -> u64 {
    60
}

fn default_job_max_attempts() -> u32 {
    3
}

fn default_job_backoff_base_secs() -> u64 {
    1
}

fn default_queue_pressure_threshold() -> usize {
    1_000
}

fn default_completed_retention_secs() -> i64 {
    3_600
}

fn default_failed_retention_secs() -> i64 {
    7 * 24 * 3_600
}

fn default_retry_max_attempts() -> u32 {
    10
}

fn default_retry_max_duration_secs() -> u64 {
    300
}

fn default_dlq_poll_secs() -> u64 {
    60
}

fn default_dlq_batch_size() -> usize {
    10
}

fn default_dlq_transient_patterns() -> Vec<String> {
    vec!["timeout".into(), "network".into(), "connection".into()]
}

fn default_dlq_archive_after_days() -> i64 {
    30
}

fn default_dlq_auto_retry() -> bool {
    true
}

fn default_retrieval_deadline_secs() -> u64 {
    30
}

fn default_reconcile_strategy() -> ReconcileStrategyKind {
    ReconcileStrategyKind::VersionBased
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: "test-key".into(),
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "test".into(),
            surrealdb_database: "test".into(),
            http_port: 0,
            openai_base_url: default_base_url(),
            embedding_backend: EmbeddingBackend::Hashed,
            embedding_model: default_embedding_model(),
            embedding_dimension: 8,
            rerank_endpoint: None,
            rerank_api_key: None,
            max_content_bytes: default_max_content_bytes(),
            worker_concurrency: 1,
            worker_rate_per_sec: default_worker_rate_per_sec(),
            job_lease_secs: default_job_lease_secs(),
            job_max_attempts: default_job_max_attempts(),
            job_backoff_base_secs: 0,
            queue_pressure_threshold: default_queue_pressure_threshold(),
            completed_retention_secs: default_completed_retention_secs(),
            failed_retention_secs: default_failed_retention_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_max_duration_secs: default_retry_max_duration_secs(),
            dlq_poll_secs: 1,
            dlq_batch_size: default_dlq_batch_size(),
            dlq_transient_patterns: default_dlq_transient_patterns(),
            dlq_archive_after_days: default_dlq_archive_after_days(),
            dlq_auto_retry: true,
            retrieval_deadline_secs: default_retrieval_deadline_secs(),
            reconcile_strategy: default_reconcile_strategy(),
        }
    }
}
