use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const ANONYMOUS_USER: &str = "anonymous";

/// The `(company, app, user)` triple that scopes every record.
///
/// `company_id` is mandatory; a missing user collapses to the shared
/// anonymous bucket so downstream filters always have a concrete value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    #[serde(alias = "companyId")]
    pub company_id: String,
    #[serde(alias = "appId", default = "default_app_id")]
    pub app_id: String,
    #[serde(alias = "userId", default = "default_user_id")]
    pub user_id: String,
    #[serde(alias = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(alias = "threadId", default)]
    pub thread_id: Option<String>,
}

fn default_app_id() -> String {
    "default".to_string()
}

fn default_user_id() -> String {
    ANONYMOUS_USER.to_string()
}

impl TenantContext {
    pub fn new(company_id: impl Into<String>) -> Self {
        Self {
            company_id: company_id.into(),
            app_id: default_app_id(),
            user_id: default_user_id(),
            session_id: None,
            thread_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Reject tenants without a company scope and default absent users.
    pub fn validated(mut self) -> Result<Self, AppError> {
        if self.company_id.trim().is_empty() {
            return Err(AppError::Validation("company_id is required".into()));
        }
        if self.user_id.trim().is_empty() {
            self.user_id = default_user_id();
        }
        if self.app_id.trim().is_empty() {
            self.app_id = default_app_id();
        }
        Ok(self)
    }

    /// Stable string used in idempotency keys and deterministic graph ids.
    pub fn scope_key(&self) -> String {
        format!("{}/{}/{}", self.company_id, self.app_id, self.user_id)
    }
}
