//! Two-level retrieval routed by query intent.
//!
//! COVERAGE answers from pre-computed video summaries, PRECISION from
//! MMR-diversified chunk search with relevance filtering and 30-second
//! deduplication, HYBRID from both. The assembled context string is what the
//! answer LLM ultimately sees.

use crate::config::Settings;
use crate::db::Database;
use crate::error::Result;
use crate::models::{format_time_range, Video};
use crate::query::intent::{IntentClassification, QueryIntent};
use crate::rerank::Reranker;
use crate::vector_store::{ScoredPoint, SearchFilter, VectorIndex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Video-level summary entry for coverage answers.
#[derive(Debug, Clone)]
pub struct VideoSummary {
    pub video_id: Uuid,
    pub title: String,
    pub channel_name: Option<String>,
    pub summary: String,
    pub key_topics: Vec<String>,
    pub duration_seconds: Option<u32>,
}

/// What kind of retrieval produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalType {
    Chunks,
    Summaries,
    Hybrid,
}

impl std::fmt::Display for RetrievalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetrievalType::Chunks => "chunks",
            RetrievalType::Summaries => "summaries",
            RetrievalType::Hybrid => "hybrid",
        };
        write!(f, "{}", s)
    }
}

/// Result of a retrieval pass.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredPoint>,
    pub video_summaries: Vec<VideoSummary>,
    pub retrieval_type: RetrievalType,
    pub context: String,
    pub videos_missing_summaries: usize,
    pub stats: HashMap<String, f64>,
}

const SUMMARY_CAP: usize = 50;
const DEFAULT_DIVERSITY: f32 = 0.4;
const MAX_DIVERSITY: f32 = 0.7;
const DEFAULT_CHUNK_LIMIT: usize = 4;
const MAX_CHUNK_LIMIT: usize = 12;
const MMR_PREFETCH_LIMIT: usize = 100;
const DEDUP_BUCKET_SECONDS: f64 = 30.0;

fn base_chunk_limit(mode: &str) -> usize {
    match mode {
        "summarize" => 6,
        "compare_sources" => 8,
        "deep_dive" => 4,
        "timeline" => 6,
        "extract_actions" => 5,
        "quiz_me" => 6,
        _ => DEFAULT_CHUNK_LIMIT,
    }
}

fn base_diversity(mode: &str) -> f32 {
    match mode {
        "summarize" => 0.5,
        "compare_sources" => 0.6,
        "deep_dive" => 0.3,
        "timeline" => 0.5,
        "extract_actions" => 0.4,
        "quiz_me" => 0.5,
        _ => DEFAULT_DIVERSITY,
    }
}

/// Chunk limit scaled for multi-video selections.
fn chunk_limit(mode: &str, num_videos: usize) -> usize {
    let base = base_chunk_limit(mode);
    if num_videos > 3 {
        (base + (num_videos - 3)).min(MAX_CHUNK_LIMIT)
    } else {
        base
    }
}

/// Diversity scaled up 0.05 per video beyond three.
fn diversity_factor(mode: &str, num_videos: usize) -> f32 {
    let base = base_diversity(mode);
    if num_videos > 3 {
        (base + (num_videos - 3) as f32 * 0.05).min(MAX_DIVERSITY)
    } else {
        base
    }
}

/// Intent-routed retriever over the vector index and video summaries.
pub struct Retriever {
    db: Arc<Database>,
    index: Arc<dyn VectorIndex>,
    reranker: Option<Reranker>,
    settings: Settings,
}

impl Retriever {
    pub fn new(db: Arc<Database>, index: Arc<dyn VectorIndex>, settings: &Settings) -> Self {
        let reranker = if settings.reranking.enabled {
            Some(Reranker::new(&settings.reranking))
        } else {
            None
        };
        Self {
            db,
            index,
            reranker,
            settings: settings.clone(),
        }
    }

    /// Retrieve context for a query according to its classified intent.
    #[instrument(skip(self, query, query_embedding, intent), fields(intent = %intent.intent))]
    pub async fn retrieve(
        &self,
        query: &str,
        query_embedding: &[f32],
        intent: &IntentClassification,
        video_ids: &[Uuid],
        user_id: Uuid,
        mode: &str,
    ) -> Result<RetrievalResult> {
        let num_videos = video_ids.len();
        info!(
            "Two-level retrieval: intent={} (confidence={:.2}), videos={}, mode={}",
            intent.intent, intent.confidence, num_videos, mode
        );

        match intent.intent {
            QueryIntent::Coverage => self.retrieve_coverage(video_ids, user_id, num_videos),
            QueryIntent::Precision => {
                self.retrieve_precision(query, query_embedding, video_ids, user_id, num_videos, mode)
                    .await
            }
            QueryIntent::Hybrid => {
                self.retrieve_hybrid(query, query_embedding, video_ids, user_id, num_videos, mode)
                    .await
            }
        }
    }

    /// COVERAGE: concatenate stored video summaries into `[Source i]` context.
    fn retrieve_coverage(
        &self,
        video_ids: &[Uuid],
        user_id: Uuid,
        num_videos: usize,
    ) -> Result<RetrievalResult> {
        let videos = self.db.videos_by_ids(user_id, video_ids, SUMMARY_CAP)?;

        let mut summaries = Vec::new();
        let mut context_parts = Vec::new();
        let mut missing = 0usize;

        for (i, video) in videos.iter().enumerate() {
            let Some(summary_text) = &video.summary else {
                missing += 1;
                continue;
            };

            let topics_line = if video.key_topics.is_empty() {
                String::new()
            } else {
                let top: Vec<&str> = video.key_topics.iter().take(5).map(|s| s.as_str()).collect();
                format!("\nKey Topics: {}", top.join(", "))
            };

            context_parts.push(format!(
                "[Source {}] \"{}\"\nChannel: {}{}\n---\n{}\n",
                i + 1,
                video.title,
                video.channel_name.as_deref().unwrap_or("Unknown"),
                topics_line,
                summary_text
            ));

            summaries.push(VideoSummary {
                video_id: video.id,
                title: video.title.clone(),
                channel_name: video.channel_name.clone(),
                summary: summary_text.clone(),
                key_topics: video.key_topics.clone(),
                duration_seconds: video.duration_seconds,
            });
        }

        let context = if context_parts.is_empty() {
            "No video summaries available. Please process videos first.".to_string()
        } else {
            let joined = context_parts.join("\n---\n");
            if missing > 0 {
                format!(
                    "NOTE: {} video(s) don't have summaries yet.\n\n{}",
                    missing, joined
                )
            } else {
                joined
            }
        };

        info!(
            "Coverage retrieval: {} summaries ({} missing)",
            summaries.len(),
            missing
        );

        let mut stats = HashMap::new();
        stats.insert("videos_requested".to_string(), num_videos as f64);
        stats.insert("summaries_found".to_string(), summaries.len() as f64);
        stats.insert("summaries_missing".to_string(), missing as f64);

        Ok(RetrievalResult {
            chunks: Vec::new(),
            video_summaries: summaries,
            retrieval_type: RetrievalType::Summaries,
            context,
            videos_missing_summaries: missing,
            stats,
        })
    }

    /// PRECISION: diversity search, relevance filter, optional rerank,
    /// 30-second dedup, then the mode-scaled limit.
    async fn retrieve_precision(
        &self,
        query: &str,
        query_embedding: &[f32],
        video_ids: &[Uuid],
        user_id: Uuid,
        num_videos: usize,
        mode: &str,
    ) -> Result<RetrievalResult> {
        let limit = chunk_limit(mode, num_videos);
        let top_chunks = self
            .search_chunks(query, query_embedding, video_ids, user_id, num_videos, mode, limit)
            .await?;

        let (context, unique_videos) = self.build_chunk_context(user_id, &top_chunks)?;

        let mut stats = HashMap::new();
        stats.insert("used".to_string(), top_chunks.len() as f64);
        stats.insert("chunk_limit".to_string(), limit as f64);
        stats.insert(
            "diversity".to_string(),
            diversity_factor(mode, num_videos) as f64,
        );
        stats.insert("unique_videos".to_string(), unique_videos as f64);

        Ok(RetrievalResult {
            chunks: top_chunks,
            video_summaries: Vec::new(),
            retrieval_type: RetrievalType::Chunks,
            context,
            videos_missing_summaries: 0,
            stats,
        })
    }

    /// HYBRID: summaries plus a halved chunk budget, concatenated.
    async fn retrieve_hybrid(
        &self,
        query: &str,
        query_embedding: &[f32],
        video_ids: &[Uuid],
        user_id: Uuid,
        num_videos: usize,
        mode: &str,
    ) -> Result<RetrievalResult> {
        let coverage = self.retrieve_coverage(video_ids, user_id, num_videos)?;

        let limit = (chunk_limit(mode, num_videos) / 2).max(3);
        let top_chunks = self
            .search_chunks(query, query_embedding, video_ids, user_id, num_videos, mode, limit)
            .await?;

        let (chunk_context, _) = self.build_chunk_context(user_id, &top_chunks)?;

        let context = format!(
            "## Video Summaries (Overview)\n\n{}\n\n## Supporting Evidence (Specific Quotes)\n\n{}",
            coverage.context, chunk_context
        );

        info!(
            "Hybrid retrieval: {} summaries + {} chunks",
            coverage.video_summaries.len(),
            top_chunks.len()
        );

        let mut stats = HashMap::new();
        stats.insert(
            "summaries_found".to_string(),
            coverage.video_summaries.len() as f64,
        );
        stats.insert("chunks_found".to_string(), top_chunks.len() as f64);

        Ok(RetrievalResult {
            chunks: top_chunks,
            video_summaries: coverage.video_summaries,
            retrieval_type: RetrievalType::Hybrid,
            context,
            videos_missing_summaries: coverage.videos_missing_summaries,
            stats,
        })
    }

    /// Shared chunk-search path: MMR search, relevance filter with fallback,
    /// optional cross-encoder rerank, time-bucket dedup, final limit.
    #[allow(clippy::too_many_arguments)]
    async fn search_chunks(
        &self,
        query: &str,
        query_embedding: &[f32],
        video_ids: &[Uuid],
        user_id: Uuid,
        num_videos: usize,
        mode: &str,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let diversity = diversity_factor(mode, num_videos);
        let filter = SearchFilter::for_videos(user_id, video_ids.to_vec());

        let candidates = self
            .index
            .search_with_diversity(
                query_embedding,
                &filter,
                self.settings.retrieval.top_k,
                diversity,
                MMR_PREFETCH_LIMIT,
            )
            .await?;
        let candidate_count = candidates.len();

        let mut filtered: Vec<ScoredPoint> = candidates
            .iter()
            .filter(|c| c.score >= self.settings.retrieval.min_relevance_score)
            .cloned()
            .collect();

        if filtered.is_empty() {
            filtered = candidates
                .into_iter()
                .filter(|c| c.score >= self.settings.retrieval.fallback_relevance_score)
                .collect();
            warn!(
                "Using fallback relevance threshold, found {} chunks",
                filtered.len()
            );
        }

        // Cross-encoder rerank reorders the filtered pool before dedup so the
        // bucket winners reflect cross-encoder order.
        if let Some(reranker) = &self.reranker {
            filtered = reranker
                .rerank(query, filtered, self.settings.reranking.top_k)
                .await;
        }

        let deduped = deduplicate_by_time_bucket(filtered);
        let mut top = deduped;
        top.truncate(limit);

        debug!(
            "Precision search: {} candidates -> {} used (limit={})",
            candidate_count,
            top.len(),
            limit
        );
        Ok(top)
    }

    /// Format chunk context entries with source attribution, topic, time
    /// span, and relevance; prepend a weak-context note when warranted.
    fn build_chunk_context(
        &self,
        user_id: Uuid,
        chunks: &[ScoredPoint],
    ) -> Result<(String, usize)> {
        if chunks.is_empty() {
            return Ok((
                "No relevant content found in the selected transcripts.".to_string(),
                0,
            ));
        }

        let video_ids: Vec<Uuid> = chunks
            .iter()
            .map(|c| c.payload.video_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let videos = self.db.videos_by_ids(user_id, &video_ids, video_ids.len())?;
        let video_map: HashMap<Uuid, &Video> = videos.iter().map(|v| (v.id, v)).collect();

        let mut parts = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let video_title = video_map
                .get(&chunk.payload.video_id)
                .map(|v| v.title.as_str())
                .unwrap_or("Unknown Video");

            let timestamp =
                format_time_range(chunk.payload.start_timestamp, chunk.payload.end_timestamp);
            let speaker = chunk
                .payload
                .speakers
                .first()
                .map(|s| s.as_str())
                .unwrap_or("Unknown");
            let topic = chunk
                .payload
                .chapter_title
                .as_deref()
                .or(chunk.payload.title.as_deref())
                .unwrap_or("General");

            parts.push(format!(
                "[Source {}] from \"{}\"\nSpeaker: {}\nTopic: {}\nTime: {}\nRelevance: {:.0}%\n---\n{}\n",
                i + 1,
                video_title,
                speaker,
                topic,
                timestamp,
                chunk.score * 100.0,
                chunk.payload.text
            ));
        }

        let mut context = parts.join("\n---\n");

        let max_score = chunks.iter().map(|c| c.score).fold(0.0f32, f32::max);
        if max_score < self.settings.retrieval.weak_context_threshold {
            context = format!(
                "NOTE: Retrieved context has low relevance (max {:.0}%). The response may be speculative.\n\n{}",
                max_score * 100.0,
                context
            );
        }

        Ok((context, video_ids.len()))
    }
}

/// At most one chunk per (video, 30-second bucket), keeping input order.
fn deduplicate_by_time_bucket(chunks: Vec<ScoredPoint>) -> Vec<ScoredPoint> {
    let mut seen: HashSet<(Uuid, i64)> = HashSet::new();
    let mut deduped = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let bucket = (chunk.payload.start_timestamp / DEDUP_BUCKET_SECONDS).floor() as i64;
        if seen.insert((chunk.payload.video_id, bucket)) {
            deduped.push(chunk);
        }
    }

    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingClient;
    use crate::vector_store::{IndexedPoint, MemoryVectorIndex, PointPayload};

    fn point(video: Uuid, idx: u32, start: f64, score: f32) -> ScoredPoint {
        ScoredPoint {
            id: Uuid::new_v4(),
            score,
            payload: PointPayload {
                user_id: Uuid::nil(),
                video_id: video,
                chunk_index: idx,
                text: format!("chunk {}", idx),
                start_timestamp: start,
                end_timestamp: start + 20.0,
                title: None,
                summary: None,
                keywords: vec![],
                chapter_title: None,
                speakers: vec![],
            },
        }
    }

    #[test]
    fn test_mode_tables() {
        assert_eq!(base_chunk_limit("summarize"), 6);
        assert_eq!(base_chunk_limit("compare_sources"), 8);
        assert_eq!(base_chunk_limit("unknown_mode"), 4);
        assert_eq!(base_diversity("deep_dive"), 0.3);
        assert_eq!(base_diversity("unknown_mode"), DEFAULT_DIVERSITY);
    }

    #[test]
    fn test_multi_video_scaling() {
        // min(4 + (10 - 3), 12) = 11 for the default mode with ten videos
        assert_eq!(chunk_limit("deep_dive", 10), 11);
        assert_eq!(chunk_limit("compare_sources", 10), 12); // capped
        assert_eq!(chunk_limit("summarize", 2), 6); // unscaled at <= 3

        let d = diversity_factor("deep_dive", 10);
        assert!((d - 0.65).abs() < 1e-6);
        assert_eq!(diversity_factor("compare_sources", 20), MAX_DIVERSITY);
    }

    #[test]
    fn test_dedup_30_second_buckets() {
        let video_a = Uuid::new_v4();
        let video_b = Uuid::new_v4();

        let chunks = vec![
            point(video_a, 0, 5.0, 0.9),   // bucket 0
            point(video_a, 1, 15.0, 0.8),  // bucket 0 (dropped)
            point(video_a, 2, 35.0, 0.7),  // bucket 1
            point(video_b, 0, 10.0, 0.6),  // bucket 0, other video (kept)
        ];

        let deduped = deduplicate_by_time_bucket(chunks);
        assert_eq!(deduped.len(), 3);

        let mut seen = HashSet::new();
        for chunk in &deduped {
            let bucket = (chunk.payload.start_timestamp / 30.0).floor() as i64;
            assert!(seen.insert((chunk.payload.video_id, bucket)));
        }
    }

    async fn seed_retriever(with_summaries: bool) -> (Retriever, Uuid, Vec<Uuid>, EmbeddingClient) {
        let db = Arc::new(Database::in_memory().unwrap());
        let index = Arc::new(MemoryVectorIndex::new());
        let embedder = EmbeddingClient::lexical(64, 8);

        let user = crate::models::User {
            id: Uuid::new_v4(),
            email: "r@example.com".to_string(),
            tier: crate::models::Tier::Free,
            is_admin: false,
            is_active: true,
            created_at: chrono::Utc::now(),
        };
        db.insert_user(&user).unwrap();

        let topics = ["creativity in schools", "machine learning basics"];
        let mut video_ids = Vec::new();
        for (v, topic) in topics.iter().enumerate() {
            let mut video =
                crate::models::Video::new(user.id, "url", &format!("vid{}", v), topic);
            if with_summaries {
                video.summary = Some(format!("A talk about {}.", topic));
                video.key_topics = vec![topic.to_string(), "education".to_string()];
            }
            db.insert_video(&video).unwrap();
            video_ids.push(video.id);

            for i in 0..4u32 {
                let text = format!("{} discussed in part {}", topic, i);
                let vector = embedder.embed(&text).await.unwrap();
                let p = IndexedPoint::new(
                    vector,
                    PointPayload {
                        user_id: user.id,
                        video_id: video.id,
                        chunk_index: i,
                        text,
                        start_timestamp: i as f64 * 60.0,
                        end_timestamp: i as f64 * 60.0 + 30.0,
                        title: None,
                        summary: None,
                        keywords: vec![],
                        chapter_title: None,
                        speakers: vec![],
                    },
                );
                index.upsert(&[p]).await.unwrap();
            }
        }

        let mut settings = Settings::default();
        settings.retrieval.min_relevance_score = 0.05;
        let retriever = Retriever::new(db, index, &settings);
        (retriever, user.id, video_ids, embedder)
    }

    #[tokio::test]
    async fn test_coverage_path_uses_summaries_only() {
        let (retriever, user_id, video_ids, embedder) = seed_retriever(true).await;
        let embedding = embedder.embed("summarize main themes").await.unwrap();

        let intent = IntentClassification {
            intent: QueryIntent::Coverage,
            confidence: 0.9,
            reasoning: "test".to_string(),
        };
        let result = retriever
            .retrieve(
                "summarize main themes",
                &embedding,
                &intent,
                &video_ids,
                user_id,
                "summarize",
            )
            .await
            .unwrap();

        assert_eq!(result.retrieval_type, RetrievalType::Summaries);
        assert!(result.chunks.is_empty(), "coverage must not search chunks");
        assert_eq!(result.video_summaries.len(), 2);
        assert!(result.context.contains("[Source 1]"));
        assert!(result.context.contains("Key Topics:"));
        assert_eq!(result.videos_missing_summaries, 0);
    }

    #[tokio::test]
    async fn test_coverage_notes_missing_summaries() {
        let (retriever, user_id, video_ids, _embedder) = seed_retriever(false).await;

        let intent = IntentClassification {
            intent: QueryIntent::Coverage,
            confidence: 0.9,
            reasoning: "test".to_string(),
        };
        let result = retriever
            .retrieve("summarize", &[0.0; 64], &intent, &video_ids, user_id, "summarize")
            .await
            .unwrap();

        assert_eq!(result.videos_missing_summaries, 2);
        assert!(result.context.contains("No video summaries available"));
    }

    #[tokio::test]
    async fn test_precision_path_dedups_and_limits() {
        let (retriever, user_id, video_ids, embedder) = seed_retriever(true).await;
        let embedding = embedder
            .embed("creativity in schools discussed")
            .await
            .unwrap();

        let intent = IntentClassification {
            intent: QueryIntent::Precision,
            confidence: 0.9,
            reasoning: "test".to_string(),
        };
        let result = retriever
            .retrieve(
                "why do schools kill creativity",
                &embedding,
                &intent,
                &video_ids,
                user_id,
                "deep_dive",
            )
            .await
            .unwrap();

        assert_eq!(result.retrieval_type, RetrievalType::Chunks);
        assert!(!result.chunks.is_empty());
        assert!(result.chunks.len() <= chunk_limit("deep_dive", 2));
        assert!(result.context.contains("Relevance:"));

        // No two chunks share (video, 30s bucket)
        let mut seen = HashSet::new();
        for chunk in &result.chunks {
            let bucket = (chunk.payload.start_timestamp / 30.0).floor() as i64;
            assert!(seen.insert((chunk.payload.video_id, bucket)));
        }
    }

    #[tokio::test]
    async fn test_hybrid_path_combines_both() {
        let (retriever, user_id, video_ids, embedder) = seed_retriever(true).await;
        let embedding = embedder.embed("machine learning basics").await.unwrap();

        let intent = IntentClassification {
            intent: QueryIntent::Hybrid,
            confidence: 0.8,
            reasoning: "test".to_string(),
        };
        let result = retriever
            .retrieve(
                "summarize with quotes",
                &embedding,
                &intent,
                &video_ids,
                user_id,
                "summarize",
            )
            .await
            .unwrap();

        assert_eq!(result.retrieval_type, RetrievalType::Hybrid);
        assert!(!result.video_summaries.is_empty());
        assert!(!result.chunks.is_empty());
        assert!(result.context.contains("## Video Summaries (Overview)"));
        assert!(result.context.contains("## Supporting Evidence (Specific Quotes)"));
        // Hybrid halves the chunk budget with a floor of three.
        assert!(result.chunks.len() <= (chunk_limit("summarize", 2) / 2).max(3));
    }

    #[tokio::test]
    async fn test_weak_context_note() {
        let (retriever, user_id, video_ids, _embedder) = seed_retriever(true).await;

        // An orthogonal query embedding keeps all scores low.
        let mut settings = Settings::default();
        settings.retrieval.min_relevance_score = -1.0;
        settings.retrieval.weak_context_threshold = 0.99;
        let weak = Retriever::new(retriever.db.clone(), retriever.index.clone(), &settings);

        let intent = IntentClassification {
            intent: QueryIntent::Precision,
            confidence: 0.9,
            reasoning: "test".to_string(),
        };
        let result = weak
            .retrieve("unrelated", &[0.001; 64], &intent, &video_ids, user_id, "deep_dive")
            .await
            .unwrap();

        assert!(result.context.contains("NOTE: Retrieved context has low relevance"));
    }
}
