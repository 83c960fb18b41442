use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::AppError;

/// What the write path should do with a memory beyond the primary stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageDecision {
    StoreOnly,
    ExtractEntities,
    Episodic,
}

impl std::fmt::Display for TriageDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::StoreOnly => "store_only",
            Self::ExtractEntities => "extract_entities",
            Self::Episodic => "episodic",
        };
        f.write_str(label)
    }
}

/// Caller-provided signals that can override or steer the classifier.
#[derive(Debug, Clone, Default)]
pub struct TriageHints {
    pub force_entity_extraction: bool,
    pub force_episodic_storage: bool,
    pub pre_identified_entities: Vec<String>,
    pub episode_type: Option<String>,
}

#[async_trait]
pub trait TriageClassifier: Send + Sync {
    async fn triage(&self, content: &str, hints: &TriageHints) -> Result<TriageDecision, AppError>;
}

/// Rule-based default classifier. Cheap, always available.
///
/// Episodic wins over extraction when both signals fire: an episode still
/// runs entity extraction inside enrichment.
pub struct HeuristicTriage;

const MIN_EXTRACTION_CHARS: usize = 64;
const CONVERSATIONAL_MARKERS: [&str; 6] = ["i said", "you said", "we discussed", "told me", "asked me", "my "];

impl HeuristicTriage {
    fn classify(content: &str, hints: &TriageHints) -> TriageDecision {
        if hints.force_episodic_storage || hints.episode_type.is_some() {
            return TriageDecision::Episodic;
        }
        if hints.force_entity_extraction || !hints.pre_identified_entities.is_empty() {
            return TriageDecision::ExtractEntities;
        }

        let lowered = content.to_lowercase();
        if CONVERSATIONAL_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            return TriageDecision::Episodic;
        }

        if content.len() < MIN_EXTRACTION_CHARS {
            return TriageDecision::StoreOnly;
        }

        // Capitalized mid-sentence tokens are a cheap named-entity signal.
        let capitalized_tokens = content
            .split_whitespace()
            .skip(1)
            .filter(|token| token.chars().next().is_some_and(char::is_uppercase))
            .count();
        if capitalized_tokens >= 2 {
            return TriageDecision::ExtractEntities;
        }

        TriageDecision::StoreOnly
    }
}

#[async_trait]
impl TriageClassifier for HeuristicTriage {
    async fn triage(&self, content: &str, hints: &TriageHints) -> Result<TriageDecision, AppError> {
        Ok(Self::classify(content, hints))
    }
}

/// LLM-backed classifier with heuristic fallback when the model call fails.
pub struct LlmTriage {
    client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    model: String,
}

const TRIAGE_SYSTEM_MESSAGE: &str = "You route incoming memories for a knowledge store. \
Classify the content as one of: store_only (plain factual snippet, no structure worth extracting), \
extract_entities (names people, projects, places or concepts worth linking), \
episodic (describes an interaction, event or conversation that happened). \
Respond with the classification only.";

#[derive(Deserialize)]
struct TriageResponse {
    decision: TriageDecision,
}

impl LlmTriage {
    pub fn new(
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        model: String,
    ) -> Self {
        Self { client, model }
    }

    fn response_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "decision": {
                    "type": "string",
                    "enum": ["store_only", "extract_entities", "episodic"]
                }
            },
            "required": ["decision"],
            "additionalProperties": false
        })
    }

    async fn classify_with_model(&self, content: &str) -> Result<TriageDecision, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some("Routing decision for an incoming memory".into()),
                name: "memory_triage".into(),
                schema: Some(Self::response_schema()),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(TRIAGE_SYSTEM_MESSAGE).into(),
                ChatCompletionRequestUserMessage::from(content).into(),
            ])
            .response_format(response_format)
            .build()?;

        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or(AppError::LLMParsing("No content in triage response".into()))?;

        let parsed: TriageResponse = serde_json::from_str(content)
            .map_err(|e| AppError::LLMParsing(format!("Failed to parse triage response: {e}")))?;

        Ok(parsed.decision)
    }
}

#[async_trait]
impl TriageClassifier for LlmTriage {
    async fn triage(&self, content: &str, hints: &TriageHints) -> Result<TriageDecision, AppError> {
        // Explicit caller hints never need a model round-trip.
        if hints.force_episodic_storage
            || hints.episode_type.is_some()
            || hints.force_entity_extraction
            || !hints.pre_identified_entities.is_empty()
        {
            return Ok(HeuristicTriage::classify(content, hints));
        }

        match self.classify_with_model(content).await {
            Ok(decision) => Ok(decision),
            Err(err) => {
                warn!(error = %err, "LLM triage failed; falling back to heuristic");
                Ok(HeuristicTriage::classify(content, hints))
            }
        }
    }
}
