use axum::http::HeaderMap;
use serde::Deserialize;

use common::storage::types::tenant::TenantContext;

use crate::error::ApiError;

/// Tenant fields a request body may carry. Headers are canonical; the body
/// only fills in what the headers left absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantBody {
    #[serde(default, alias = "companyId")]
    pub company_id: Option<String>,
    #[serde(default, alias = "appId")]
    pub app_id: Option<String>,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "threadId")]
    pub thread_id: Option<String>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Build the tenant context from the `X-*` headers with body fallback.
/// `company_id` is mandatory from either source.
pub fn resolve_tenant(headers: &HeaderMap, body: &TenantBody) -> Result<TenantContext, ApiError> {
    let company_id = header_value(headers, "x-company-id")
        .or_else(|| body.company_id.clone())
        .ok_or_else(|| {
            ApiError::validation("MISSING_COMPANY_ID", "companyId is required")
        })?;

    let mut tenant = TenantContext::new(company_id);
    if let Some(app_id) = header_value(headers, "x-app-id").or_else(|| body.app_id.clone()) {
        tenant.app_id = app_id;
    }
    if let Some(user_id) = header_value(headers, "x-user-id").or_else(|| body.user_id.clone()) {
        tenant.user_id = user_id;
    }
    tenant.session_id =
        header_value(headers, "x-session-id").or_else(|| body.session_id.clone());
    tenant.thread_id = header_value(headers, "x-thread-id").or_else(|| body.thread_id.clone());

    tenant
        .validated()
        .map_err(|_| ApiError::validation("MISSING_COMPANY_ID", "companyId is required"))
}

/// Platform/telemetry headers captured on interactions.
#[derive(Debug, Clone, Default)]
pub struct PlatformHeaders {
    pub platform: Option<String>,
    pub platform_version: Option<String>,
    pub model_used: Option<String>,
    pub model_provider: Option<String>,
    pub domain: Option<String>,
}

impl PlatformHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            platform: header_value(headers, "x-platform"),
            platform_version: header_value(headers, "x-platform-version"),
            model_used: header_value(headers, "x-model-used"),
            model_provider: header_value(headers, "x-model-provider"),
            domain: header_value(headers, "x-domain"),
        }
    }
}
