use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::AppError, storage::db::SurrealDbClient, stored_object, utils::hashing::user_hash,
};

use super::tenant::TenantContext;

stored_object!(Interaction, "interaction", {
    platform: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    user_text: String,
    assistant_text: String,
    #[serde(default)]
    tool_calls: Option<Value>,
    #[serde(default)]
    tokens_in: Option<u32>,
    #[serde(default)]
    tokens_out: Option<u32>,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    latency_ms: Option<u64>,
    #[serde(default)]
    stored_memory_ids: Vec<String>,
    #[serde(default)]
    retrieved_memory_ids: Vec<String>,
    #[serde(default)]
    entity_ids: Vec<String>,
    company_id: String,
    app_id: String,
    // Only the one-way hash of the user id is persisted.
    user_hash: String
});

impl Interaction {
    pub fn new(
        platform: String,
        user_text: String,
        assistant_text: String,
        tool_calls: Option<Value>,
        tenant: &TenantContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            platform,
            session_id: tenant.session_id.clone(),
            thread_id: tenant.thread_id.clone(),
            parent_id: None,
            user_text,
            assistant_text,
            tool_calls,
            tokens_in: None,
            tokens_out: None,
            cost_usd: None,
            latency_ms: None,
            stored_memory_ids: Vec::new(),
            retrieved_memory_ids: Vec::new(),
            entity_ids: Vec::new(),
            company_id: tenant.company_id.clone(),
            app_id: tenant.app_id.clone(),
            user_hash: user_hash(&tenant.user_id),
        }
    }

    pub async fn record(self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.store_item(self).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_only_the_user_hash() {
        let tenant = TenantContext::new("acme").with_user("alice@example.com");
        let interaction = Interaction::new(
            "cli".into(),
            "hello".into(),
            "hi there".into(),
            None,
            &tenant,
        );

        assert!(!interaction.user_hash.contains("alice"));
        assert_eq!(interaction.user_hash.len(), 64);

        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("interaction_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");

        interaction.record(&db).await.expect("record interaction");

        let rows: Vec<Interaction> = db.get_all_stored_items().await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].platform, "cli");
    }
}
