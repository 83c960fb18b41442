use chrono::{DateTime, Utc};
use serde::Serialize;

use common::storage::types::{chunk::Chunk, entity::Entity, memory::Memory};

/// Which collection a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Memory,
    Chunk,
    Entity,
}

/// A hydrated result row, uniform across collections.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedItem {
    pub id: String,
    pub content_type: ContentKind,
    pub title: String,
    pub snippet: String,
    #[serde(skip)]
    pub content: String,
    pub created_at: DateTime<Utc>,
}

const SNIPPET_CHARS: usize = 160;

fn snippet_of(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let mut snippet: String = text.chars().take(SNIPPET_CHARS).collect();
    snippet.push('…');
    snippet
}

impl RetrievedItem {
    pub fn from_memory(memory: Memory) -> Self {
        Self {
            id: memory.id,
            content_type: ContentKind::Memory,
            title: snippet_of(&memory.content),
            snippet: snippet_of(&memory.content),
            content: memory.content,
            created_at: memory.created_at,
        }
    }

    pub fn from_chunk(chunk: Chunk) -> Self {
        Self {
            id: chunk.id,
            content_type: ContentKind::Chunk,
            title: format!("chunk of {}", chunk.document_id),
            snippet: snippet_of(&chunk.text),
            content: chunk.text,
            created_at: chunk.created_at,
        }
    }

    pub fn from_entity(entity: Entity) -> Self {
        Self {
            id: entity.id,
            content_type: ContentKind::Entity,
            title: entity.name.clone(),
            snippet: snippet_of(&entity.content),
            content: entity.content,
            created_at: entity.created_at,
        }
    }

    /// Merge key: collection plus id, so a chunk and a memory never collide.
    pub fn merge_key(&self) -> String {
        format!("{:?}:{}", self.content_type, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_truncates_long_text() {
        let text = "x".repeat(500);
        let snippet = snippet_of(&text);
        assert!(snippet.chars().count() <= SNIPPET_CHARS + 1);
        assert!(snippet.ends_with('…'));
    }

    #[test]
    fn short_text_is_left_alone() {
        assert_eq!(snippet_of("hello"), "hello");
    }
}
