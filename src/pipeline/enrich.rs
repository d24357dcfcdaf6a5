//! Contextual enrichment of transcript chunks.
//!
//! Each chunk gets an LLM-generated title, summary, and keyword list that is
//! folded into the embedding text. Enrichment failures never abort the
//! pipeline; a heuristic fallback fills in instead.

use crate::config::EnrichmentSettings;
use crate::error::{Result, ViskaError};
use crate::llm::{strip_code_fences, ChatMessage, LlmClient};
use crate::pipeline::chunker::TranscriptChunk;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Enrichment metadata for one chunk.
#[derive(Debug, Clone)]
pub struct Enrichment {
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
}

impl Enrichment {
    /// Text handed to the embedder: `{title}. {summary}\n\n{text}`.
    pub fn embedding_text(&self, chunk_text: &str) -> String {
        format!("{}. {}\n\n{}", self.title, self.summary, chunk_text)
    }
}

#[derive(Debug, Deserialize)]
struct EnrichmentResponse {
    title: String,
    summary: String,
    keywords: Vec<String>,
}

const STOPWORDS: [&str; 40] = [
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "be", "this", "that", "these", "those", "i", "you",
    "he", "she", "it", "we", "they", "what", "which", "who", "when", "where", "why", "how", "not",
];

/// LLM-driven chunk enricher with heuristic fallback.
pub struct Enricher<'a> {
    llm: &'a LlmClient,
    settings: EnrichmentSettings,
    video_context: Option<String>,
}

impl<'a> Enricher<'a> {
    pub fn new(llm: &'a LlmClient, settings: &EnrichmentSettings) -> Self {
        Self {
            llm,
            settings: settings.clone(),
            video_context: None,
        }
    }

    /// Attach video context (title, truncated description) to prompts.
    pub fn set_video_context(&mut self, title: &str, description: Option<&str>) {
        let mut parts = vec![format!("Title: {}", title)];
        if let Some(desc) = description {
            let truncated = if desc.chars().count() > 500 {
                let cut: String = desc.chars().take(500).collect();
                format!("{}...", cut)
            } else {
                desc.to_string()
            };
            parts.push(format!("Description: {}", truncated));
        }
        self.video_context = Some(parts.join(" | "));
    }

    fn build_prompt(&self, chunk: &TranscriptChunk) -> Vec<ChatMessage> {
        let system = ChatMessage::system(
            "You are an expert at analyzing transcript segments and extracting key information. \
             Your task is to generate concise metadata for a chunk of transcript text.\n\n\
             Return your response as valid JSON with these exact fields:\n\
             {\n\
               \"title\": \"A short phrase (3-7 words) capturing the main topic\",\n\
               \"summary\": \"A concise 1-3 sentence summary of what is discussed\",\n\
               \"keywords\": [\"3-7 key topics, entities, or concepts mentioned\"]\n\
             }\n\n\
             Guidelines:\n\
             - Title should be specific and descriptive\n\
             - Summary should capture the essence and key points\n\
             - Keywords should be searchable terms someone might use to find this content\n\
             - Return ONLY valid JSON, no additional text",
        );

        let context_info = self
            .video_context
            .as_ref()
            .map(|c| format!("\n\nVideo context: {}", c))
            .unwrap_or_default();

        let minutes = chunk.start_timestamp as u64 / 60;
        let seconds = chunk.start_timestamp as u64 % 60;

        let user = ChatMessage::user(format!(
            "Analyze this transcript segment (from {:02}:{:02}):{}\n\n\
             Transcript:\n{}\n\n\
             Return JSON with title, summary, and keywords.",
            minutes, seconds, context_info, chunk.text
        ));

        vec![system, user]
    }

    /// Parse the model response, tolerating markdown code fences.
    fn parse_response(raw: &str) -> Result<Enrichment> {
        let cleaned = strip_code_fences(raw);
        let parsed: EnrichmentResponse = serde_json::from_str(cleaned)
            .map_err(|e| ViskaError::Parse(format!("Enrichment JSON invalid: {}", e)))?;

        if parsed.title.trim().is_empty() || parsed.summary.trim().is_empty() {
            return Err(ViskaError::Parse(
                "Enrichment response missing title or summary".to_string(),
            ));
        }

        Ok(Enrichment {
            title: parsed.title,
            summary: parsed.summary,
            keywords: parsed.keywords,
        })
    }

    /// Heuristic enrichment used when the LLM is unavailable or keeps
    /// returning garbage: first sentence as title, first three sentences as
    /// summary, top-5 frequent non-stopword tokens as keywords.
    pub fn fallback(chunk: &TranscriptChunk) -> Enrichment {
        let sentences: Vec<&str> = chunk.text.split(". ").collect();

        let first = sentences.first().copied().unwrap_or(&chunk.text);
        let title = if first.chars().count() > 50 {
            let cut: String = first.chars().take(50).collect();
            format!("{}...", cut)
        } else {
            first.to_string()
        };

        let mut summary = sentences
            .iter()
            .take(3)
            .copied()
            .collect::<Vec<_>>()
            .join(". ");
        if !summary.ends_with('.') {
            summary.push('.');
        }
        let summary: String = summary.chars().take(300).collect();

        let mut freq: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        for raw_word in chunk.text.to_lowercase().split_whitespace() {
            let word: String = raw_word.chars().filter(|c| c.is_alphanumeric()).collect();
            if word.len() > 3 && !STOPWORDS.contains(&word.as_str()) {
                *freq.entry(word).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<(String, u32)> = freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let keywords: Vec<String> = ranked.into_iter().take(5).map(|(w, _)| w).collect();

        Enrichment {
            title,
            summary,
            keywords,
        }
    }

    /// Enrich a single chunk. Retries with exponential backoff on LLM or
    /// parse failure, then degrades to the heuristic fallback.
    #[instrument(skip(self, chunk), fields(chunk_index = chunk.chunk_index))]
    pub async fn enrich_chunk(&self, chunk: &TranscriptChunk) -> Enrichment {
        if !self.settings.enabled {
            return Self::fallback(chunk);
        }

        for attempt in 0..self.settings.max_retries {
            let messages = self.build_prompt(chunk);
            let result = self
                .llm
                .complete(&messages, Some(0.3), Some(500), None, false)
                .await;

            match result.and_then(|r| Self::parse_response(&r.content)) {
                Ok(enrichment) => return enrichment,
                Err(e) => {
                    if attempt + 1 < self.settings.max_retries {
                        let backoff = 1u64 << attempt;
                        debug!(
                            "Enrichment attempt {} failed ({}), retrying in {}s",
                            attempt + 1,
                            e,
                            backoff
                        );
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                    } else {
                        warn!(
                            "Enrichment failed for chunk {}, using fallback: {}",
                            chunk.chunk_index, e
                        );
                    }
                }
            }
        }

        Self::fallback(chunk)
    }

    /// Enrich chunks sequentially with rate limiting: a 1s pause every
    /// `batch_size` chunks. The callback reports completion counts.
    pub async fn enrich_chunks(
        &self,
        chunks: &[TranscriptChunk],
        mut on_progress: impl FnMut(usize, usize),
    ) -> Vec<Enrichment> {
        let mut enriched = Vec::with_capacity(chunks.len());
        let batch_size = self.settings.batch_size.max(1);

        for (i, chunk) in chunks.iter().enumerate() {
            enriched.push(self.enrich_chunk(chunk).await);
            on_progress(i + 1, chunks.len());

            if (i + 1) % batch_size == 0 && i + 1 < chunks.len() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        enriched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> TranscriptChunk {
        TranscriptChunk {
            text: text.to_string(),
            start_timestamp: 0.0,
            end_timestamp: 60.0,
            token_count: 50,
            speakers: vec![],
            chapter_title: None,
            chapter_index: None,
            chunk_index: 0,
        }
    }

    #[test]
    fn test_parse_strict_json() {
        let raw = r#"{"title": "Rust Ownership", "summary": "Covers moves and borrows.", "keywords": ["rust", "ownership"]}"#;
        let e = Enricher::parse_response(raw).unwrap();
        assert_eq!(e.title, "Rust Ownership");
        assert_eq!(e.keywords.len(), 2);
    }

    #[test]
    fn test_parse_tolerates_code_fences() {
        let raw = "```json\n{\"title\": \"T\", \"summary\": \"S\", \"keywords\": [\"k\"]}\n```";
        let e = Enricher::parse_response(raw).unwrap();
        assert_eq!(e.title, "T");
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(Enricher::parse_response(r#"{"title": "T"}"#).is_err());
        assert!(Enricher::parse_response("not json at all").is_err());
        assert!(Enricher::parse_response(r#"{"title": "", "summary": "", "keywords": []}"#).is_err());
    }

    #[test]
    fn test_fallback_enrichment() {
        let c = chunk(
            "Machine learning models require training data. Neural networks learn \
             representations from examples. Gradient descent optimizes network weights. \
             Training continues until convergence happens.",
        );
        let e = Enricher::fallback(&c);

        assert!(e.title.starts_with("Machine learning models require training data"));
        assert!(e.summary.len() <= 300);
        assert!(e.keywords.len() <= 5);
        assert!(!e.keywords.is_empty());
        // Stopwords and short words never appear
        for keyword in &e.keywords {
            assert!(keyword.len() > 3);
            assert!(!STOPWORDS.contains(&keyword.as_str()));
        }
    }

    #[test]
    fn test_fallback_truncates_long_title() {
        let c = chunk(
            "This opening sentence is deliberately much longer than fifty characters to test truncation. Short one.",
        );
        let e = Enricher::fallback(&c);
        assert!(e.title.ends_with("..."));
        assert_eq!(e.title.chars().count(), 53);
    }

    #[test]
    fn test_embedding_text_composition() {
        let e = Enrichment {
            title: "Title".to_string(),
            summary: "Summary".to_string(),
            keywords: vec![],
        };
        assert_eq!(e.embedding_text("body"), "Title. Summary\n\nbody");
    }
}
