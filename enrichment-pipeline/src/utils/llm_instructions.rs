use serde_json::{json, Value};

pub const ENTITY_EXTRACTION_SYSTEM_MESSAGE: &str = "You extract durable entities from text \
for a multi-tenant knowledge graph. Return the people, organisations, projects, systems, \
places and concepts the text is actually about; skip incidental words. Use short canonical \
names, a coarse domain label, a type, and a hierarchy level (0 = top level concept, \
deeper levels for sub-parts). Confidence reflects how certain the text itself is.";

pub const FACT_EXTRACTION_SYSTEM_MESSAGE: &str = "You extract (subject, predicate, object) \
facts between the provided entities. Only use entities from the provided list as subject \
and object, with predicates as short snake_case verbs. Weight expresses the strength of \
the connection in [0,1]; confidence how certain the text is. Mark a fact bidirectional \
only when the relation genuinely reads both ways.";

pub const SUMMARY_SYSTEM_MESSAGE: &str = "Summarize the submitted content as a short \
episodic note: what happened, who or what was involved, and the outcome. Two to three \
sentences, no preamble.";

pub fn entity_extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "domain": { "type": "string" },
                        "entity_type": { "type": "string" },
                        "hierarchy_level": { "type": "integer", "minimum": 0 },
                        "description": { "type": "string" },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "parent": { "type": ["string", "null"] }
                    },
                    "required": [
                        "name",
                        "domain",
                        "entity_type",
                        "hierarchy_level",
                        "description",
                        "confidence",
                        "parent"
                    ],
                    "additionalProperties": false
                }
            }
        },
        "required": ["entities"],
        "additionalProperties": false
    })
}

pub fn fact_extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "subject": { "type": "string" },
                        "predicate": { "type": "string" },
                        "object": { "type": "string" },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "weight": { "type": "number", "minimum": 0, "maximum": 1 },
                        "bidirectional": { "type": "boolean" }
                    },
                    "required": [
                        "subject",
                        "predicate",
                        "object",
                        "confidence",
                        "weight",
                        "bidirectional"
                    ],
                    "additionalProperties": false
                }
            }
        },
        "required": ["facts"],
        "additionalProperties": false
    })
}
