//! Periodic consolidation of conversation facts.
//!
//! Three passes keep memory focused over long-lived conversations:
//! deduplication of near-equivalent facts, importance decay for stale ones,
//! and pruning once a conversation accumulates too many. Identity facts are
//! never pruned and never decay.

use crate::db::Database;
use crate::error::Result;
use crate::models::{ConversationFact, FactCategory};
use chrono::{Duration, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Facts below this importance are candidates for pruning; decay floors here.
const MIN_IMPORTANCE: f64 = 0.3;
/// Days without access before the decay penalty applies.
const STALE_DAYS: i64 = 7;
/// Importance reduction per consolidation for stale facts.
const DECAY_PENALTY: f64 = 0.1;
/// Soft cap on facts per conversation.
const MAX_FACTS_PER_CONVERSATION: usize = 50;
/// Jaccard word-overlap threshold for value similarity.
const SIMILARITY_THRESHOLD: f64 = 0.85;

/// What one consolidation run changed.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationStats {
    pub merged: usize,
    pub decayed: usize,
    pub pruned: usize,
    pub total_before: usize,
    pub total_after: usize,
}

fn trailing_digits_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_?\d+$").expect("valid regex"))
}

fn common_suffix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_(name|value|type|id)$").expect("valid regex"))
}

/// Normalize a key for duplicate grouping:
/// `frequency_333` -> `frequency`, `instructor_name` -> `instructor`.
fn base_key(key: &str) -> String {
    let stripped = trailing_digits_regex().replace(key, "");
    let stripped = common_suffix_regex().replace(&stripped, "");
    stripped.to_lowercase()
}

/// Whether two fact values are close enough to be duplicates: exact match,
/// substring containment, or Jaccard word overlap at or above 0.85.
fn values_similar(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let a = a.trim();
    let b = b.trim();

    if a == b || a.contains(b) || b.contains(a) {
        return true;
    }

    let words_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let words_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() || words_b.is_empty() {
        return false;
    }

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f64 / union as f64 >= SIMILARITY_THRESHOLD
}

/// Run the consolidation pipeline for one conversation.
///
/// Idempotent: a second run over already-consolidated facts changes nothing.
/// With `dry_run` the stats are computed but nothing is written.
#[instrument(skip(db))]
pub fn consolidate_conversation(
    db: &Database,
    conversation_id: Uuid,
    dry_run: bool,
) -> Result<ConsolidationStats> {
    let mut stats = ConsolidationStats::default();

    let facts = db.facts_for_conversation(conversation_id)?;
    if facts.is_empty() {
        return Ok(stats);
    }
    stats.total_before = facts.len();

    stats.merged = deduplicate(db, &facts, dry_run)?;

    let facts = if dry_run {
        facts
    } else {
        db.facts_for_conversation(conversation_id)?
    };

    stats.decayed = apply_decay(db, &facts, dry_run)?;
    stats.pruned = prune(db, &facts, dry_run)?;

    stats.total_after = if dry_run {
        stats.total_before - stats.merged - stats.pruned
    } else {
        db.facts_for_conversation(conversation_id)?.len()
    };

    info!(
        "Consolidated conversation {}: merged={}, decayed={}, pruned={}, total {} -> {}",
        conversation_id,
        stats.merged,
        stats.decayed,
        stats.pruned,
        stats.total_before,
        stats.total_after
    );
    Ok(stats)
}

/// Merge semantically equivalent facts within base-key groups.
///
/// The keeper is the most important fact, ties broken by earliest turn; it
/// absorbs the duplicates' access stats.
fn deduplicate(db: &Database, facts: &[ConversationFact], dry_run: bool) -> Result<usize> {
    let mut groups: HashMap<String, Vec<&ConversationFact>> = HashMap::new();
    for fact in facts {
        groups.entry(base_key(&fact.key)).or_default().push(fact);
    }

    let mut merged = 0;
    for group in groups.values_mut() {
        if group.len() <= 1 {
            continue;
        }

        group.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.source_turn.cmp(&b.source_turn))
        });

        let keeper = group[0];
        for duplicate in group.iter().skip(1) {
            if !values_similar(&keeper.value, &duplicate.value) {
                continue;
            }
            debug!(
                "Merging duplicate fact {}={} into {}={}",
                duplicate.key, duplicate.value, keeper.key, keeper.value
            );
            if !dry_run {
                db.merge_fact_stats(keeper.id, duplicate.access_count, duplicate.last_accessed)?;
                db.delete_fact(duplicate.id)?;
            }
            merged += 1;
        }
    }

    Ok(merged)
}

/// Reduce importance of stale non-identity facts, flooring at 0.3.
fn apply_decay(db: &Database, facts: &[ConversationFact], dry_run: bool) -> Result<usize> {
    let stale_cutoff = Utc::now() - Duration::days(STALE_DAYS);
    let mut decayed = 0;

    for fact in facts {
        if fact.category == FactCategory::Identity {
            continue;
        }

        let is_stale = match fact.last_accessed {
            Some(accessed) => accessed < stale_cutoff,
            None => fact.created_at < stale_cutoff,
        };

        if is_stale && fact.importance > MIN_IMPORTANCE {
            let new_importance = (fact.importance - DECAY_PENALTY).max(MIN_IMPORTANCE);
            if new_importance < fact.importance {
                if !dry_run {
                    db.update_fact_importance(fact.id, new_importance)?;
                }
                decayed += 1;
            }
        }
    }

    Ok(decayed)
}

/// Remove the lowest-value facts once the soft cap is exceeded.
/// Identity facts are never pruned.
fn prune(db: &Database, facts: &[ConversationFact], dry_run: bool) -> Result<usize> {
    if facts.len() <= MAX_FACTS_PER_CONVERSATION {
        return Ok(0);
    }
    let excess = facts.len() - MAX_FACTS_PER_CONVERSATION;
    let recent_cutoff = Utc::now() - Duration::hours(24);

    let mut candidates: Vec<(&ConversationFact, f64)> = facts
        .iter()
        .filter(|f| f.category != FactCategory::Identity)
        .map(|fact| {
            let mut score = fact.importance;
            if fact.access_count > 0 {
                score += 0.2;
            }
            if fact.last_accessed.map(|t| t > recent_cutoff).unwrap_or(false) {
                score += 0.3;
            }
            (fact, score)
        })
        .collect();

    candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut pruned = 0;
    for (fact, score) in candidates.into_iter().take(excess) {
        debug!(
            "Pruning fact {}={} (score={:.2})",
            fact.key, fact.value, score
        );
        if !dry_run {
            db.delete_fact(fact.id)?;
        }
        pruned += 1;
    }

    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_fact(
        conversation_id: Uuid,
        key: &str,
        value: &str,
        category: FactCategory,
        importance: f64,
        source_turn: u32,
    ) -> ConversationFact {
        ConversationFact {
            id: Uuid::new_v4(),
            conversation_id,
            user_id: Uuid::nil(),
            key: key.to_string(),
            value: value.to_string(),
            source_turn,
            importance,
            category,
            access_count: 0,
            last_accessed: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_base_key_normalization() {
        assert_eq!(base_key("frequency_333"), "frequency");
        assert_eq!(base_key("instructor_name"), "instructor");
        assert_eq!(base_key("topic_1"), "topic");
        assert_eq!(base_key("framework"), "framework");
    }

    #[test]
    fn test_value_similarity() {
        assert!(values_similar("Dr. Ng", "dr. ng"));
        assert!(values_similar("TensorFlow", "TensorFlow framework"));
        assert!(values_similar(
            "machine learning with neural networks today",
            "machine learning with neural networks",
        ));
        assert!(!values_similar("apples", "oranges"));
    }

    #[test]
    fn test_dedup_merges_similar_values() {
        let db = Database::in_memory().unwrap();
        let conv = Uuid::new_v4();

        let keeper = make_fact(conv, "instructor", "Dr. Andrew Ng", FactCategory::Topic, 0.9, 1);
        let dup = make_fact(conv, "instructor_name", "Andrew Ng", FactCategory::Topic, 0.5, 5);
        db.insert_fact(&keeper).unwrap();
        db.insert_fact(&dup).unwrap();

        let stats = consolidate_conversation(&db, conv, false).unwrap();
        assert_eq!(stats.merged, 1);

        let remaining = db.facts_for_conversation(conv).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value, "Dr. Andrew Ng");
    }

    #[test]
    fn test_consolidation_is_non_expanding_and_idempotent() {
        let db = Database::in_memory().unwrap();
        let conv = Uuid::new_v4();

        for i in 0..60 {
            let fact = make_fact(
                conv,
                &format!("note_{}", i),
                &format!("observation number {}", i),
                FactCategory::Ephemeral,
                0.4,
                10,
            );
            db.insert_fact(&fact).unwrap();
        }
        let identity = make_fact(conv, "user", "Alice", FactCategory::Identity, 0.9, 1);
        db.insert_fact(&identity).unwrap();

        let stats = consolidate_conversation(&db, conv, false).unwrap();
        assert!(stats.total_after <= stats.total_before);
        assert!(stats.total_after <= MAX_FACTS_PER_CONVERSATION + 1);

        // Identity facts survive pruning.
        let remaining = db.facts_for_conversation(conv).unwrap();
        assert!(remaining.iter().any(|f| f.key == "user"));

        // Second run changes nothing further.
        let again = consolidate_conversation(&db, conv, false).unwrap();
        assert_eq!(again.merged, 0);
        assert_eq!(again.pruned, 0);
        assert_eq!(again.total_before, again.total_after);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let db = Database::in_memory().unwrap();
        let conv = Uuid::new_v4();

        let a = make_fact(conv, "topic", "rust programming", FactCategory::Topic, 0.9, 1);
        let b = make_fact(conv, "topic_2", "rust programming", FactCategory::Topic, 0.5, 3);
        db.insert_fact(&a).unwrap();
        db.insert_fact(&b).unwrap();

        let stats = consolidate_conversation(&db, conv, true).unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(db.facts_for_conversation(conv).unwrap().len(), 2);
    }

    #[test]
    fn test_decay_spares_identity_and_floors() {
        let db = Database::in_memory().unwrap();
        let conv = Uuid::new_v4();

        let mut old_topic = make_fact(conv, "theme", "economics", FactCategory::Topic, 0.5, 2);
        old_topic.created_at = Utc::now() - Duration::days(10);
        let mut old_identity = make_fact(conv, "name", "Alice", FactCategory::Identity, 0.5, 1);
        old_identity.created_at = Utc::now() - Duration::days(10);
        db.insert_fact(&old_topic).unwrap();
        db.insert_fact(&old_identity).unwrap();

        let stats = consolidate_conversation(&db, conv, false).unwrap();
        assert_eq!(stats.decayed, 1);

        let facts = db.facts_for_conversation(conv).unwrap();
        let theme = facts.iter().find(|f| f.key == "theme").unwrap();
        let name = facts.iter().find(|f| f.key == "name").unwrap();
        assert!((theme.importance - 0.4).abs() < 1e-9);
        assert!((name.importance - 0.5).abs() < 1e-9);

        // Repeated decay floors at 0.3.
        consolidate_conversation(&db, conv, false).unwrap();
        consolidate_conversation(&db, conv, false).unwrap();
        let facts = db.facts_for_conversation(conv).unwrap();
        let theme = facts.iter().find(|f| f.key == "theme").unwrap();
        assert!(theme.importance >= 0.3 - 1e-9);
    }
}
