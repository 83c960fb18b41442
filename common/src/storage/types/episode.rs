use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::tenant::TenantContext;

stored_object!(Episode, "episode", {
    memory_id: String,
    #[serde(default)]
    episode_type: Option<String>,
    summary: String,
    company_id: String,
    app_id: String,
    user_id: String
});

impl Episode {
    pub fn new(
        memory_id: &str,
        episode_type: Option<String>,
        summary: String,
        tenant: &TenantContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            // One episode per memory: redelivered enrichment upserts in place.
            id: memory_id.to_string(),
            created_at: now,
            updated_at: now,
            memory_id: memory_id.to_string(),
            episode_type,
            summary,
            company_id: tenant.company_id.clone(),
            app_id: tenant.app_id.clone(),
            user_id: tenant.user_id.clone(),
        }
    }

    pub async fn upsert(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPSERT type::thing('episode', $id) SET \
                 memory_id = $memory_id, \
                 episode_type = $episode_type, \
                 summary = $summary, \
                 company_id = $company_id, \
                 app_id = $app_id, \
                 user_id = $user_id, \
                 created_at = created_at ?? time::now(), \
                 updated_at = time::now()",
        )
        .bind(("id", self.id.clone()))
        .bind(("memory_id", self.memory_id.clone()))
        .bind(("episode_type", self.episode_type.clone()))
        .bind(("summary", self.summary.clone()))
        .bind(("company_id", self.company_id.clone()))
        .bind(("app_id", self.app_id.clone()))
        .bind(("user_id", self.user_id.clone()))
        .await?
        .check()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantContext {
        TenantContext::new("acme")
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_memory() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("episode_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");

        Episode::new("m1", None, "first summary".into(), &tenant())
            .upsert(&db)
            .await
            .expect("first upsert");
        Episode::new("m1", Some("meeting".into()), "revised summary".into(), &tenant())
            .upsert(&db)
            .await
            .expect("second upsert");

        let episodes: Vec<Episode> = db.get_all_stored_items().await.expect("episodes");
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].summary, "revised summary");
        assert_eq!(episodes[0].episode_type.as_deref(), Some("meeting"));
    }
}
