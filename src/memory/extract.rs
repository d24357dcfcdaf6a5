//! Fact extraction from Q&A turns.
//!
//! After each assistant message the pair is handed to an LLM that returns a
//! JSON array of key/value facts. Extraction failure is never fatal; the
//! caller just gets no new facts.

use crate::db::Database;
use crate::error::Result;
use crate::llm::{strip_code_fences, ChatMessage, LlmClient};
use crate::models::{Conversation, ConversationFact, FactCategory};
use chrono::Utc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const EXTRACTION_PROMPT: &str = "Extract key facts from this Q&A pair as simple key-value pairs.

Q: {user_query}
A: {assistant_response}

Return JSON array of facts:
[
  {\"key\": \"instructor\", \"value\": \"Dr. Andrew Ng\"},
  {\"key\": \"topic\", \"value\": \"machine learning\"},
  {\"key\": \"framework\", \"value\": \"TensorFlow\"}
]

Extract ONLY:
- Names (people, organizations, places)
- Key concepts or topics
- Tools, frameworks, or technologies
- Important dates, numbers, or findings

Use short, descriptive keys (lowercase, underscore-separated).
Return empty array if no facts.";

/// Normalize a fact key to lowercase snake_case.
fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace([' ', '-'], "_")
}

/// Fact extractor bound to an LLM client.
pub struct FactExtractor<'a> {
    llm: &'a LlmClient,
}

impl<'a> FactExtractor<'a> {
    pub fn new(llm: &'a LlmClient) -> Self {
        Self { llm }
    }

    /// Extract facts from an assistant response and persist the new ones.
    ///
    /// Facts whose normalized key already exists in the conversation are
    /// skipped. Returns the facts that were actually stored; failures
    /// degrade to an empty list.
    #[instrument(skip(self, db, user_query, assistant_response))]
    pub async fn extract_facts(
        &self,
        db: &Database,
        conversation: &Conversation,
        user_query: &str,
        assistant_response: &str,
    ) -> Result<Vec<ConversationFact>> {
        // Truncate very long responses to save tokens.
        let response_excerpt: String = if assistant_response.chars().count() > 2000 {
            let cut: String = assistant_response.chars().take(2000).collect();
            format!("{}...", cut)
        } else {
            assistant_response.to_string()
        };

        let prompt = EXTRACTION_PROMPT
            .replace("{user_query}", user_query)
            .replace("{assistant_response}", &response_excerpt);

        let messages = vec![
            ChatMessage::system("You are a fact extraction assistant."),
            ChatMessage::user(prompt),
        ];

        let response = match self
            .llm
            .complete(&messages, Some(0.2), Some(500), None, false)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Fact extraction failed: {}", e);
                return Ok(Vec::new());
            }
        };

        let parsed = Self::parse_facts(&response.content);
        if parsed.is_empty() {
            return Ok(Vec::new());
        }

        let existing: std::collections::HashSet<String> = db
            .facts_for_conversation(conversation.id)?
            .into_iter()
            .map(|f| f.key)
            .collect();

        let current_turn = conversation.message_count.div_ceil(2).max(1);
        let now = Utc::now();

        let mut stored = Vec::new();
        for (key, value) in parsed {
            if existing.contains(&key) {
                debug!("Skipping duplicate fact key: {}", key);
                continue;
            }
            let fact = ConversationFact {
                id: Uuid::new_v4(),
                conversation_id: conversation.id,
                user_id: conversation.user_id,
                key,
                value,
                source_turn: current_turn,
                importance: 1.0,
                category: FactCategory::Topic,
                access_count: 0,
                last_accessed: None,
                created_at: now,
            };
            if db.insert_fact(&fact)? {
                stored.push(fact);
            }
        }

        debug!(
            "Extracted {} facts for conversation {}",
            stored.len(),
            conversation.id
        );
        Ok(stored)
    }

    /// Parse the LLM response into (key, value) pairs, dropping malformed
    /// entries and normalizing keys.
    fn parse_facts(raw: &str) -> Vec<(String, String)> {
        let cleaned = strip_code_fences(raw);
        let Ok(value) = serde_json::from_str::<serde_json::Value>(cleaned) else {
            warn!("Failed to parse facts JSON");
            return Vec::new();
        };
        let Some(items) = value.as_array() else {
            warn!("Facts response was not a JSON array");
            return Vec::new();
        };

        items
            .iter()
            .filter_map(|item| {
                let key = item["key"].as_str()?.trim();
                let value = item["value"].as_str()?.trim();
                if key.is_empty() || value.is_empty() {
                    return None;
                }
                Some((normalize_key(key), value.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_facts() {
        let raw = r#"[{"key": "Instructor Name", "value": "Dr. Ng"}, {"key": "topic", "value": "ML"}]"#;
        let facts = FactExtractor::parse_facts(raw);
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].0, "instructor_name");
        assert_eq!(facts[0].1, "Dr. Ng");
    }

    #[test]
    fn test_parse_tolerates_fences_and_garbage() {
        let raw = "```json\n[{\"key\": \"k\", \"value\": \"v\"}]\n```";
        assert_eq!(FactExtractor::parse_facts(raw).len(), 1);

        assert!(FactExtractor::parse_facts("not json").is_empty());
        assert!(FactExtractor::parse_facts("{\"key\": \"not an array\"}").is_empty());
    }

    #[test]
    fn test_parse_drops_empty_and_malformed_entries() {
        let raw = r#"[
            {"key": "", "value": "x"},
            {"key": "ok", "value": ""},
            {"value": "missing key"},
            {"key": "good-key", "value": "kept"}
        ]"#;
        let facts = FactExtractor::parse_facts(raw);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].0, "good_key");
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("Instructor Name"), "instructor_name");
        assert_eq!(normalize_key("frame-work"), "frame_work");
        assert_eq!(normalize_key("  Topic "), "topic");
    }
}
