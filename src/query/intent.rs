//! Query intent classification for retrieval routing.
//!
//! Intent determines retrieval strategy, not response formatting:
//! - COVERAGE: video summaries for "summarize all" / "key themes" queries
//! - PRECISION: chunk retrieval for "what did X say" / "why" queries
//! - HYBRID: both, for "summarize with quotes" queries
//!
//! The cascade is: follow-up inheritance, explicit intent switches, LLM
//! classification (accepted at confidence >= 0.7), then regex fallback with
//! mode-based tiebreakers.

use crate::error::Result;
use crate::llm::{strip_code_fences, ChatMessage, LlmClient};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Query intent for retrieval routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryIntent {
    Coverage,
    Precision,
    Hybrid,
}

impl std::fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryIntent::Coverage => "COVERAGE",
            QueryIntent::Precision => "PRECISION",
            QueryIntent::Hybrid => "HYBRID",
        };
        write!(f, "{}", s)
    }
}

/// Result of intent classification.
#[derive(Debug, Clone)]
pub struct IntentClassification {
    pub intent: QueryIntent,
    pub confidence: f64,
    pub reasoning: String,
}

/// A recent conversation turn handed to the classifier for context.
#[derive(Debug, Clone)]
pub struct RecentMessage {
    pub role: String,
    pub content: String,
}

const CONFIDENCE_THRESHOLD: f64 = 0.7;

const COVERAGE_PATTERNS: &[&str] = &[
    r"\bsummar(y|ize|ise|izing|ising)\b",
    r"\boverview\b",
    r"\bmain points?\b",
    r"\bkey (points?|takeaways?|themes?|topics?|ideas?)\b",
    r"\bwhat (are|is) (this|these|the) (videos?|transcripts?) about\b",
    r"\bgist\b",
    r"\bhighlights?\b",
    r"\btl;?dr\b",
    r"\bin (short|brief|summary)\b",
    r"\ball (the )?(videos?|sources?|transcripts?)\b",
    r"\bacross (all|the|these)\b",
    r"\beach (video|source|transcript)\b",
    r"\bevery (video|source|transcript)\b",
    r"\bcompare\b.*\b(videos?|sources?|speakers?)\b",
];

const PRECISION_PATTERNS: &[&str] = &[
    r"\bwhat did .+ say about\b",
    r"\bwhen did\b",
    r"\bwhere did\b",
    r"\bwho said\b",
    r"\bhow (does|did|do)\b",
    r"\bfind (the|a)?\b",
    r"\bspecific(ally)?\b",
    r"\bexact(ly)?\b",
    r"\bquote\b",
    r"\bclip\b",
    r"\bmoment\b",
    r"\btimestamp\b",
    r"\bpart where\b",
    r"\bsection (about|on|where)\b",
    r"\bwhy (do|did|does|is|are|was|were)\b",
];

const HYBRID_PATTERNS: &[&str] = &[
    r"\bsummar(y|ize|ise)\b.*\b(quote|example|evidence)\b",
    r"\b(quote|example|evidence)\b.*\bsummar(y|ize|ise)\b",
    r"\boverview\b.*\b(with|including)\b.*\b(example|quote|evidence)\b",
    r"\bcompare\b.*\b(with|and)\b.*\b(example|quote|evidence)\b",
];

const FOLLOW_UP_PATTERNS: &[&str] = &[
    r"^tell me more\b",
    r"^expand on that\b",
    r"^go on\b",
    r"^continue\b",
    r"^more detail\b",
    r"^elaborate\b",
    r"^what else\b",
];

const SWITCH_TO_COVERAGE_PATTERNS: &[&str] = &[
    r"\bnow (give me|provide) (an )?overview\b",
    r"\bnow summarize\b",
    r"\bswitch to summary\b",
    r"\bgive me the (big picture|overview)\b",
];

const SWITCH_TO_PRECISION_PATTERNS: &[&str] = &[
    r"\bnow (find|show) (me )?(the )?specific\b",
    r"\bnow tell me exactly\b",
    r"\bget specific\b",
    r"\bwhat specifically\b",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("(?i){}", p)).expect("valid intent pattern")
        })
        .collect()
}

/// LLM-backed intent classifier with regex fallback.
pub struct IntentClassifier {
    coverage: Vec<Regex>,
    precision: Vec<Regex>,
    hybrid: Vec<Regex>,
    follow_up: Vec<Regex>,
    switch_coverage: Vec<Regex>,
    switch_precision: Vec<Regex>,
}

impl IntentClassifier {
    pub fn new() -> Self {
        Self {
            coverage: compile(COVERAGE_PATTERNS),
            precision: compile(PRECISION_PATTERNS),
            hybrid: compile(HYBRID_PATTERNS),
            follow_up: compile(FOLLOW_UP_PATTERNS),
            switch_coverage: compile(SWITCH_TO_COVERAGE_PATTERNS),
            switch_precision: compile(SWITCH_TO_PRECISION_PATTERNS),
        }
    }

    /// Classify a query with full conversation context.
    #[instrument(skip(self, llm, recent_messages, facts))]
    pub async fn classify(
        &self,
        llm: &LlmClient,
        query: &str,
        mode: &str,
        num_videos: usize,
        recent_messages: &[RecentMessage],
        facts: &[String],
    ) -> IntentClassification {
        // 1. Follow-up queries inherit the previous user query's intent.
        if !recent_messages.is_empty() && self.is_follow_up(query) {
            if let Some(previous) = self.infer_previous_intent(recent_messages) {
                return IntentClassification {
                    intent: previous,
                    confidence: 0.75,
                    reasoning: "Follow-up query, continuing previous intent".to_string(),
                };
            }
        }

        // 2. Explicit intent switches override everything else.
        if let Some(switched) = self.check_intent_switch(query) {
            return switched;
        }

        // 3. LLM classification, accepted only at high confidence.
        match self
            .classify_with_llm(llm, query, mode, num_videos, recent_messages, facts)
            .await
        {
            Ok(result) if result.confidence >= CONFIDENCE_THRESHOLD => {
                info!(
                    "LLM classification: {} (confidence={:.2})",
                    result.intent, result.confidence
                );
                return result;
            }
            Ok(result) => {
                info!(
                    "LLM confidence too low ({:.2}), falling back to heuristics",
                    result.confidence
                );
            }
            Err(e) => {
                warn!("LLM classification failed: {}, using fallback", e);
            }
        }

        // 4. Regex fallback.
        self.classify_with_regex(query, mode, num_videos)
    }

    /// Regex-only classification for callers without an LLM in reach.
    pub fn classify_sync(
        &self,
        query: &str,
        mode: &str,
        num_videos: usize,
        recent_messages: &[RecentMessage],
    ) -> IntentClassification {
        if !recent_messages.is_empty() && self.is_follow_up(query) {
            if let Some(previous) = self.infer_previous_intent(recent_messages) {
                return IntentClassification {
                    intent: previous,
                    confidence: 0.75,
                    reasoning: "Follow-up query, continuing previous intent".to_string(),
                };
            }
        }
        if let Some(switched) = self.check_intent_switch(query) {
            return switched;
        }
        self.classify_with_regex(query, mode, num_videos)
    }

    fn is_follow_up(&self, query: &str) -> bool {
        let q = query.trim().to_lowercase();
        self.follow_up.iter().any(|p| p.is_match(&q))
    }

    /// Classify the most recent user message with regex; accept at >= 0.6.
    fn infer_previous_intent(&self, recent_messages: &[RecentMessage]) -> Option<QueryIntent> {
        for message in recent_messages.iter().rev() {
            if message.role == "user" {
                let result = self.classify_with_regex(&message.content, "default", 1);
                if result.confidence >= 0.6 {
                    return Some(result.intent);
                }
            }
        }
        None
    }

    fn check_intent_switch(&self, query: &str) -> Option<IntentClassification> {
        let q = query.to_lowercase();

        if self.switch_coverage.iter().any(|p| p.is_match(&q)) {
            return Some(IntentClassification {
                intent: QueryIntent::Coverage,
                confidence: 0.85,
                reasoning: "Explicit switch to coverage/overview mode".to_string(),
            });
        }
        if self.switch_precision.iter().any(|p| p.is_match(&q)) {
            return Some(IntentClassification {
                intent: QueryIntent::Precision,
                confidence: 0.85,
                reasoning: "Explicit switch to precision/specific mode".to_string(),
            });
        }
        None
    }

    async fn classify_with_llm(
        &self,
        llm: &LlmClient,
        query: &str,
        mode: &str,
        num_videos: usize,
        recent_messages: &[RecentMessage],
        facts: &[String],
    ) -> Result<IntentClassification> {
        let mut context_parts = Vec::new();
        if !recent_messages.is_empty() {
            context_parts.push("Recent conversation:".to_string());
            for message in recent_messages.iter().rev().take(3).rev() {
                let excerpt: String = message.content.chars().take(200).collect();
                context_parts.push(format!("- {}: {}...", message.role, excerpt));
            }
        }
        if !facts.is_empty() {
            context_parts.push("\nExtracted facts (for long conversations):".to_string());
            for fact in facts.iter().take(5) {
                context_parts.push(format!("- {}", fact));
            }
        }
        let conversation_context = if context_parts.is_empty() {
            "No prior context.".to_string()
        } else {
            context_parts.join("\n")
        };

        let prompt = format!(
            "Classify the user's query as COVERAGE, PRECISION, or HYBRID.\n\n\
             COVERAGE: User wants an overview, summary, or comparison across ALL videos.\n\
             Examples: \"summarize these videos\", \"what are the main themes?\", \"compare the speakers\"\n\n\
             PRECISION: User wants specific information, quotes, or details from relevant videos only.\n\
             Examples: \"why do schools kill creativity?\", \"what did Ken Robinson say about mistakes?\"\n\n\
             HYBRID: User wants both overview AND specific evidence/examples.\n\
             Examples: \"summarize and give me key quotes\", \"what themes are covered with examples?\"\n\n\
             ## Conversation Context\n{}\n\n\
             ## Current Query\n\
             Query: \"{}\"\n\
             Number of videos: {}\n\
             Mode: {}\n\n\
             ## Instructions\n\
             - Consider the conversation context when classifying\n\
             - \"Tell me more\" or \"expand on that\" -> Use previous query's intent\n\
             - \"Now summarize\" or \"give me an overview\" -> COVERAGE (regardless of previous)\n\
             - \"Why\" questions seeking specific explanations -> PRECISION (not COVERAGE)\n\
             - If query is ambiguous and no context helps, use lower confidence\n\n\
             Output JSON only:\n\
             {{\"intent\": \"COVERAGE\" or \"PRECISION\" or \"HYBRID\", \"confidence\": 0.0-1.0, \"reasoning\": \"brief explanation\"}}",
            conversation_context, query, num_videos, mode
        );

        let messages = vec![ChatMessage::user(prompt)];
        let response = llm
            .complete(&messages, Some(0.2), Some(150), None, false)
            .await?;

        Ok(Self::parse_llm_response(&response.content))
    }

    /// Parse the LLM JSON; failures become a low-confidence PRECISION result
    /// so the caller falls through to the regex path.
    fn parse_llm_response(raw: &str) -> IntentClassification {
        let cleaned = strip_code_fences(raw);
        let Ok(value) = serde_json::from_str::<serde_json::Value>(cleaned) else {
            debug!("Failed to parse LLM intent response");
            return IntentClassification {
                intent: QueryIntent::Precision,
                confidence: 0.3,
                reasoning: "Failed to parse LLM response".to_string(),
            };
        };

        let intent = match value["intent"].as_str().map(|s| s.to_uppercase()) {
            Some(ref s) if s == "COVERAGE" => QueryIntent::Coverage,
            Some(ref s) if s == "HYBRID" => QueryIntent::Hybrid,
            _ => QueryIntent::Precision,
        };

        IntentClassification {
            intent,
            confidence: value["confidence"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0),
            reasoning: value["reasoning"]
                .as_str()
                .unwrap_or("LLM classification")
                .to_string(),
        }
    }

    /// Pattern-count classification with mode tiebreakers.
    fn classify_with_regex(
        &self,
        query: &str,
        mode: &str,
        num_videos: usize,
    ) -> IntentClassification {
        let q = query.to_lowercase();

        let coverage_matches = self.coverage.iter().filter(|p| p.is_match(&q)).count();
        let precision_matches = self.precision.iter().filter(|p| p.is_match(&q)).count();
        let hybrid_matches = self.hybrid.iter().filter(|p| p.is_match(&q)).count();

        if hybrid_matches > 0 {
            return IntentClassification {
                intent: QueryIntent::Hybrid,
                confidence: (0.6 + hybrid_matches as f64 * 0.15).min(0.85),
                reasoning: format!("Hybrid patterns matched ({})", hybrid_matches),
            };
        }

        if coverage_matches > 0 && precision_matches == 0 {
            return IntentClassification {
                intent: QueryIntent::Coverage,
                confidence: (0.5 + coverage_matches as f64 * 0.15).min(0.85),
                reasoning: format!("Coverage patterns matched ({})", coverage_matches),
            };
        }

        if precision_matches > 0 && coverage_matches == 0 {
            return IntentClassification {
                intent: QueryIntent::Precision,
                confidence: (0.5 + precision_matches as f64 * 0.15).min(0.85),
                reasoning: format!("Precision patterns matched ({})", precision_matches),
            };
        }

        if coverage_matches > 0 && precision_matches > 0 {
            return IntentClassification {
                intent: QueryIntent::Hybrid,
                confidence: 0.6,
                reasoning: format!(
                    "Mixed signals (coverage={}, precision={})",
                    coverage_matches, precision_matches
                ),
            };
        }

        // No clear patterns: fall back to the conversation mode.
        let mode_prefers_coverage = matches!(mode, "summarize" | "compare_sources");
        let mode_prefers_precision = matches!(mode, "deep_dive" | "extract_actions");

        if mode_prefers_coverage && num_videos > 1 {
            return IntentClassification {
                intent: QueryIntent::Coverage,
                confidence: 0.5,
                reasoning: format!("Mode fallback ({} with {} videos)", mode, num_videos),
            };
        }
        if mode_prefers_precision {
            return IntentClassification {
                intent: QueryIntent::Precision,
                confidence: 0.5,
                reasoning: format!("Mode fallback ({})", mode),
            };
        }

        IntentClassification {
            intent: QueryIntent::Precision,
            confidence: 0.4,
            reasoning: "Default to precision (no clear signals)".to_string(),
        }
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> IntentClassifier {
        IntentClassifier::new()
    }

    #[test]
    fn test_coverage_queries() {
        let c = classifier();
        for query in [
            "summarize these videos",
            "what are the key themes here",
            "give me the highlights",
            "tl;dr of all the videos",
        ] {
            let result = c.classify_with_regex(query, "default", 5);
            assert_eq!(result.intent, QueryIntent::Coverage, "query: {}", query);
            assert!(result.confidence >= 0.5);
        }
    }

    #[test]
    fn test_precision_queries() {
        let c = classifier();
        for query in [
            "why do schools kill creativity",
            "what did Ken Robinson say about mistakes",
            "find the part where they discuss pricing",
            "who said that exact quote",
        ] {
            let result = c.classify_with_regex(query, "default", 5);
            assert_eq!(result.intent, QueryIntent::Precision, "query: {}", query);
        }
    }

    #[test]
    fn test_hybrid_patterns_win() {
        let c = classifier();
        let result = c.classify_with_regex("summarize the talks with one key quote", "default", 3);
        assert_eq!(result.intent, QueryIntent::Hybrid);
    }

    #[test]
    fn test_mixed_signals_yield_hybrid_at_point_six() {
        let c = classifier();
        // "overview" is coverage; "timestamp" is precision; no hybrid pattern.
        let result = c.classify_with_regex("overview of the timestamp markers", "default", 2);
        assert_eq!(result.intent, QueryIntent::Hybrid);
        assert_eq!(result.confidence, 0.6);
    }

    #[test]
    fn test_mode_tiebreakers() {
        let c = classifier();

        let result = c.classify_with_regex("thoughts on this content", "summarize", 3);
        assert_eq!(result.intent, QueryIntent::Coverage);
        assert_eq!(result.confidence, 0.5);

        let result = c.classify_with_regex("thoughts on this content", "deep_dive", 3);
        assert_eq!(result.intent, QueryIntent::Precision);

        // Coverage-preferring modes need more than one video.
        let result = c.classify_with_regex("thoughts on this content", "summarize", 1);
        assert_eq!(result.intent, QueryIntent::Precision);
        assert_eq!(result.confidence, 0.4);
    }

    #[test]
    fn test_follow_up_inherits_previous_intent() {
        let c = classifier();
        let history = vec![
            RecentMessage {
                role: "user".to_string(),
                content: "summarize all the videos".to_string(),
            },
            RecentMessage {
                role: "assistant".to_string(),
                content: "Here is a summary...".to_string(),
            },
        ];

        let result = c.classify_sync("tell me more", "default", 3, &history);
        assert_eq!(result.intent, QueryIntent::Coverage);
        assert_eq!(result.confidence, 0.75);

        let history = vec![RecentMessage {
            role: "user".to_string(),
            content: "why do schools kill creativity".to_string(),
        }];
        let result = c.classify_sync("expand on that", "default", 3, &history);
        assert_eq!(result.intent, QueryIntent::Precision);
        assert_eq!(result.confidence, 0.75);
    }

    #[test]
    fn test_explicit_switch_beats_follow_up_context() {
        let c = classifier();
        let history = vec![RecentMessage {
            role: "user".to_string(),
            content: "why do schools kill creativity".to_string(),
        }];

        let result = c.classify_sync("now summarize everything", "default", 3, &history);
        assert_eq!(result.intent, QueryIntent::Coverage);
        assert_eq!(result.confidence, 0.85);

        let result = c.classify_sync("get specific about the examples", "default", 3, &history);
        assert_eq!(result.intent, QueryIntent::Precision);
        assert_eq!(result.confidence, 0.85);
    }

    #[test]
    fn test_parse_llm_response() {
        let parsed = IntentClassifier::parse_llm_response(
            r#"{"intent": "COVERAGE", "confidence": 0.9, "reasoning": "asks for themes"}"#,
        );
        assert_eq!(parsed.intent, QueryIntent::Coverage);
        assert!((parsed.confidence - 0.9).abs() < 1e-9);

        let parsed = IntentClassifier::parse_llm_response(
            "```json\n{\"intent\": \"HYBRID\", \"confidence\": 0.8, \"reasoning\": \"both\"}\n```",
        );
        assert_eq!(parsed.intent, QueryIntent::Hybrid);

        // Garbage falls back to low-confidence precision.
        let parsed = IntentClassifier::parse_llm_response("no json here");
        assert_eq!(parsed.intent, QueryIntent::Precision);
        assert!(parsed.confidence < CONFIDENCE_THRESHOLD);
    }
}
