//! Conversation memory: fact scoring, selection, and prompt formatting.
//!
//! Facts are ranked by a multi-factor composite of LLM-rated importance,
//! recency (with decay and access reinforcement), category priority, and the
//! turn they were extracted in. Early identity facts survive long
//! conversations; ephemeral ones fade.

pub mod consolidate;
pub mod extract;

pub use consolidate::{consolidate_conversation, ConsolidationStats};
pub use extract::FactExtractor;

use crate::db::Database;
use crate::error::Result;
use crate::models::{ConversationFact, FactCategory};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

const WEIGHT_IMPORTANCE: f64 = 0.40;
const WEIGHT_RECENCY: f64 = 0.25;
const WEIGHT_CATEGORY: f64 = 0.20;
const WEIGHT_SOURCE_TURN: f64 = 0.15;

/// Hourly decay factor (~88% retained after 24h).
const DECAY_RATE: f64 = 0.995;

/// Default number of facts injected into a prompt.
pub const DEFAULT_FACT_LIMIT: usize = 15;

/// Recency score with decay and reinforcement.
///
/// Frequently accessed facts decay slower; each access adds ~5% up to a 0.3
/// bonus. The result is clamped to [0, 1].
pub fn recency_score(
    created_at: DateTime<Utc>,
    last_accessed: Option<DateTime<Utc>>,
    access_count: u32,
    now: DateTime<Utc>,
) -> f64 {
    let reference = last_accessed.unwrap_or(created_at);
    let hours_elapsed = (now - reference).num_seconds().max(0) as f64 / 3600.0;

    let base_decay = DECAY_RATE.powf(hours_elapsed);
    let reinforcement = (access_count as f64 * 0.05).min(0.3);

    (base_decay + reinforcement).min(1.0)
}

/// Priority from the turn the fact was extracted in.
///
/// The first turns establish identity and keep full priority; later turns
/// decay linearly against the conversation length.
pub fn source_turn_priority(source_turn: u32, max_turn: u32) -> f64 {
    if max_turn <= 1 {
        return 1.0;
    }
    match source_turn {
        0..=3 => 1.0,
        4..=10 => 0.8,
        11..=20 => 0.6,
        _ => (1.0 - source_turn as f64 / max_turn as f64).max(0.2),
    }
}

/// Weighted composite memory score in [0, 1].
pub fn composite_score(fact: &ConversationFact, max_turn: u32, now: DateTime<Utc>) -> f64 {
    let importance = fact.importance.clamp(0.0, 1.0);
    let recency = recency_score(fact.created_at, fact.last_accessed, fact.access_count, now);
    let category = fact.category.priority();
    let turn_priority = source_turn_priority(fact.source_turn, max_turn);

    importance * WEIGHT_IMPORTANCE
        + recency * WEIGHT_RECENCY
        + category * WEIGHT_CATEGORY
        + turn_priority * WEIGHT_SOURCE_TURN
}

/// Select the top facts for a conversation by composite score.
pub fn select_facts(
    db: &Database,
    conversation_id: Uuid,
    limit: usize,
) -> Result<Vec<(ConversationFact, f64)>> {
    let facts = db.facts_for_conversation(conversation_id)?;
    if facts.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let max_turn = facts.iter().map(|f| f.source_turn).max().unwrap_or(1);

    let mut scored: Vec<(ConversationFact, f64)> = facts
        .into_iter()
        .map(|fact| {
            let score = composite_score(&fact, max_turn, now);
            (fact, score)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);

    debug!(
        "Selected {} facts for conversation {}",
        scored.len(),
        conversation_id
    );
    Ok(scored)
}

/// Record that facts were used: bumps access counts and last-accessed times,
/// feeding the reinforcement term of future scores.
pub fn mark_accessed(db: &Database, fact_ids: &[Uuid]) -> Result<()> {
    db.mark_facts_accessed(fact_ids)
}

/// Format selected facts for prompt injection, grouped by category:
/// `[category] key=value(T3), key2=value2(T7)`.
pub fn format_facts_for_prompt(scored: &[(ConversationFact, f64)]) -> String {
    if scored.is_empty() {
        return String::new();
    }

    let order = [
        FactCategory::Identity,
        FactCategory::Topic,
        FactCategory::Preference,
        FactCategory::Session,
        FactCategory::Ephemeral,
    ];

    let mut lines = Vec::new();
    for category in order {
        let items: Vec<String> = scored
            .iter()
            .filter(|(fact, _)| fact.category == category)
            .map(|(fact, _)| format!("{}={}(T{})", fact.key, fact.value, fact.source_turn))
            .collect();
        if !items.is_empty() {
            lines.push(format!("[{}] {}", category, items.join(", ")));
        }
    }

    if lines.is_empty() {
        return String::new();
    }
    format!("\n\n**Known Facts**:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fact(
        key: &str,
        category: FactCategory,
        importance: f64,
        source_turn: u32,
        age_hours: i64,
        access_count: u32,
    ) -> ConversationFact {
        ConversationFact {
            id: Uuid::new_v4(),
            conversation_id: Uuid::nil(),
            user_id: Uuid::nil(),
            key: key.to_string(),
            value: format!("value-{}", key),
            source_turn,
            importance,
            category,
            access_count,
            last_accessed: None,
            created_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    #[test]
    fn test_composite_score_bounds() {
        let now = Utc::now();
        // Exhaustive-ish sweep of factor extremes.
        for importance in [0.0, 0.5, 1.0] {
            for category in [
                FactCategory::Identity,
                FactCategory::Topic,
                FactCategory::Ephemeral,
            ] {
                for age in [0, 24, 24 * 30] {
                    for accesses in [0, 5, 100] {
                        let f = fact("k", category, importance, 1, age, accesses);
                        let score = composite_score(&f, 40, now);
                        assert!((0.0..=1.0).contains(&score), "score out of bounds: {}", score);
                    }
                }
            }
        }
    }

    #[test]
    fn test_recency_decay_and_reinforcement() {
        let now = Utc::now();
        let fresh = recency_score(now, None, 0, now);
        let day_old = recency_score(now - Duration::hours(24), None, 0, now);
        let day_old_used = recency_score(now - Duration::hours(24), None, 10, now);

        assert!(fresh > day_old);
        assert!(day_old_used > day_old, "access reinforces recency");
        // Reinforcement bonus is capped at 0.3.
        let capped = recency_score(now - Duration::hours(24), None, 1000, now);
        assert!((capped - (day_old + 0.3)).abs() < 1e-9);
    }

    #[test]
    fn test_source_turn_tiers() {
        assert_eq!(source_turn_priority(1, 40), 1.0);
        assert_eq!(source_turn_priority(3, 40), 1.0);
        assert_eq!(source_turn_priority(7, 40), 0.8);
        assert_eq!(source_turn_priority(15, 40), 0.6);
        // Late turns decay linearly with a 0.2 floor.
        assert!((source_turn_priority(30, 40) - 0.25).abs() < 1e-9);
        assert_eq!(source_turn_priority(39, 40), 0.2);
    }

    #[test]
    fn test_identity_facts_outrank_ephemeral_at_same_age() {
        let now = Utc::now();
        let identity = fact("name", FactCategory::Identity, 0.8, 1, 30 * 24, 0);
        let ephemeral = fact("mood", FactCategory::Ephemeral, 0.8, 35, 1, 0);

        let identity_score = composite_score(&identity, 40, now);
        let ephemeral_score = composite_score(&ephemeral, 40, now);
        assert!(
            identity_score > ephemeral_score,
            "old identity fact should outrank recent ephemeral one: {} vs {}",
            identity_score,
            ephemeral_score
        );
    }

    #[test]
    fn test_selection_returns_identity_first_in_long_conversation() {
        let db = Database::in_memory().unwrap();
        let conversation_id = Uuid::new_v4();
        let user_id = Uuid::nil();

        // Turn-1 identity fact and a turn-2 topic fact...
        let mut identity = fact("instructor", FactCategory::Identity, 0.9, 1, 48, 2);
        identity.conversation_id = conversation_id;
        identity.user_id = user_id;
        db.insert_fact(&identity).unwrap();

        let mut topic = fact("course_topic", FactCategory::Topic, 0.7, 2, 48, 1);
        topic.conversation_id = conversation_id;
        topic.user_id = user_id;
        db.insert_fact(&topic).unwrap();

        // ...buried under a pile of late ephemeral facts.
        for i in 0..20 {
            let mut e = fact(&format!("note_{}", i), FactCategory::Ephemeral, 0.4, 34, 0, 0);
            e.conversation_id = conversation_id;
            e.user_id = user_id;
            db.insert_fact(&e).unwrap();
        }

        let selected = select_facts(&db, conversation_id, DEFAULT_FACT_LIMIT).unwrap();
        assert_eq!(selected[0].0.key, "instructor");
        assert!(
            selected.iter().any(|(f, _)| f.key == "course_topic"),
            "topic fact must appear in the top selection"
        );
    }

    #[test]
    fn test_prompt_formatting_groups_by_category() {
        let scored = vec![
            (fact("name", FactCategory::Identity, 0.9, 1, 0, 0), 0.9),
            (fact("framework", FactCategory::Topic, 0.7, 3, 0, 0), 0.7),
            (fact("style", FactCategory::Topic, 0.6, 7, 0, 0), 0.6),
        ];
        let formatted = format_facts_for_prompt(&scored);
        assert!(formatted.contains("[identity] name=value-name(T1)"));
        assert!(formatted.contains("[topic] framework=value-framework(T3), style=value-style(T7)"));

        assert!(format_facts_for_prompt(&[]).is_empty());
    }
}
