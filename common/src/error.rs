use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Retry budget exhausted: {0}")]
    BudgetExhausted(String),
    #[error("State desynchronization: {0}")]
    Desync(String),
    #[error("Partial write: {0}")]
    PartialWrite(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether a retry of the failed operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::OpenAI(_) | Self::Unavailable(_) | Self::Reqwest(_)
        )
    }
}
