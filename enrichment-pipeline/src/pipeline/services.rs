use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use serde::Deserialize;

use common::{
    error::AppError,
    storage::types::{
        entity::EntityDraft,
        relationship::{Directionality, FactDraft},
    },
    utils::embedding::{EmbeddingClient, EmbeddingKind},
};

use crate::utils::llm_instructions::{
    entity_extraction_schema, fact_extraction_schema, ENTITY_EXTRACTION_SYSTEM_MESSAGE,
    FACT_EXTRACTION_SYSTEM_MESSAGE, SUMMARY_SYSTEM_MESSAGE,
};

/// The LLM-backed capabilities a worker needs. Swappable so tests run the
/// whole pipeline with deterministic fakes.
#[async_trait]
pub trait EnrichmentServices: Send + Sync {
    async fn extract_entities(
        &self,
        content: &str,
        pre_identified: &[String],
    ) -> Result<Vec<EntityDraft>, AppError>;

    async fn extract_facts(
        &self,
        content: &str,
        entities: &[EntityDraft],
    ) -> Result<Vec<FactDraft>, AppError>;

    async fn summarize(&self, content: &str) -> Result<String, AppError>;

    async fn embed_entity(&self, draft: &EntityDraft) -> Result<Vec<f32>, AppError>;
}

pub struct DefaultEnrichmentServices {
    openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    model: String,
    embedder: Arc<EmbeddingClient>,
}

#[derive(Deserialize)]
struct LLMEntity {
    name: String,
    domain: String,
    entity_type: String,
    hierarchy_level: u32,
    description: String,
    confidence: f32,
    parent: Option<String>,
}

#[derive(Deserialize)]
struct LLMEntityResponse {
    entities: Vec<LLMEntity>,
}

#[derive(Deserialize)]
struct LLMFact {
    subject: String,
    predicate: String,
    object: String,
    confidence: f32,
    weight: f32,
    bidirectional: bool,
}

#[derive(Deserialize)]
struct LLMFactResponse {
    facts: Vec<LLMFact>,
}

impl DefaultEnrichmentServices {
    pub fn new(
        openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        model: String,
        embedder: Arc<EmbeddingClient>,
    ) -> Self {
        Self {
            openai_client,
            model,
            embedder,
        }
    }

    async fn structured_completion<T>(
        &self,
        system_message: &str,
        user_message: String,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<T, AppError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: schema_name.into(),
                schema: Some(schema),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_message).into(),
                ChatCompletionRequestUserMessage::from(user_message).into(),
            ])
            .response_format(response_format)
            .build()?;

        let response = self.openai_client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or(AppError::LLMParsing(
                "No content found in LLM response".into(),
            ))?;

        serde_json::from_str::<T>(content)
            .map_err(|e| AppError::LLMParsing(format!("Failed to parse {schema_name}: {e}")))
    }
}

#[async_trait]
impl EnrichmentServices for DefaultEnrichmentServices {
    async fn extract_entities(
        &self,
        content: &str,
        pre_identified: &[String],
    ) -> Result<Vec<EntityDraft>, AppError> {
        let user_message = if pre_identified.is_empty() {
            format!("Content:\n{content}")
        } else {
            format!(
                "Content:\n{content}\nEntities the caller already identified:\n{}",
                pre_identified.join(", ")
            )
        };

        let parsed: LLMEntityResponse = self
            .structured_completion(
                ENTITY_EXTRACTION_SYSTEM_MESSAGE,
                user_message,
                "entity_extraction",
                entity_extraction_schema(),
            )
            .await?;

        Ok(parsed
            .entities
            .into_iter()
            .map(|entity| EntityDraft {
                name: entity.name,
                domain: entity.domain,
                entity_type: entity.entity_type,
                hierarchy_level: entity.hierarchy_level,
                content: entity.description,
                confidence: entity.confidence.clamp(0.0, 1.0),
                parent: entity.parent,
            })
            .collect())
    }

    async fn extract_facts(
        &self,
        content: &str,
        entities: &[EntityDraft],
    ) -> Result<Vec<FactDraft>, AppError> {
        if entities.len() < 2 {
            return Ok(Vec::new());
        }

        let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let user_message = format!(
            "Content:\n{content}\nKnown entities:\n{}",
            names.join(", ")
        );

        let parsed: LLMFactResponse = self
            .structured_completion(
                FACT_EXTRACTION_SYSTEM_MESSAGE,
                user_message,
                "fact_extraction",
                fact_extraction_schema(),
            )
            .await?;

        Ok(parsed
            .facts
            .into_iter()
            .map(|fact| FactDraft {
                subject: fact.subject,
                predicate: fact.predicate,
                object: fact.object,
                confidence: fact.confidence.clamp(0.0, 1.0),
                weight: fact.weight.clamp(0.0, 1.0),
                directionality: if fact.bidirectional {
                    Directionality::Bidirectional
                } else {
                    Directionality::Directed
                },
            })
            .collect())
    }

    async fn summarize(&self, content: &str) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(SUMMARY_SYSTEM_MESSAGE).into(),
                ChatCompletionRequestUserMessage::from(content.to_owned()).into(),
            ])
            .build()?;

        let response = self.openai_client.chat().create(request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(AppError::LLMParsing("No content in summary response".into()))
    }

    async fn embed_entity(&self, draft: &EntityDraft) -> Result<Vec<f32>, AppError> {
        let input = format!(
            "name: {}, type: {}, description: {}",
            draft.name, draft.entity_type, draft.content
        );
        self.embedder.embed(&input, EmbeddingKind::Document).await
    }
}
