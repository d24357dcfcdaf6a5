//! Vector index abstraction for chunk embeddings.
//!
//! Provides a trait-based interface with a durable SQLite implementation and
//! an in-memory one for tests. Point ids are deterministic (UUID v5 of the
//! video id and chunk index) so re-indexing a video is idempotent.

mod memory;
mod sqlite;

pub use memory::MemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPayload {
    pub user_id: Uuid,
    pub video_id: Uuid,
    pub chunk_index: u32,
    pub text: String,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub chapter_title: Option<String>,
    #[serde(default)]
    pub speakers: Vec<String>,
}

/// A vector plus payload, ready for insertion.
#[derive(Debug, Clone)]
pub struct IndexedPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

impl IndexedPoint {
    /// Deterministic point id so re-indexing overwrites instead of duplicating.
    pub fn deterministic_id(video_id: Uuid, chunk_index: u32) -> Uuid {
        Uuid::new_v5(&video_id, chunk_index.to_string().as_bytes())
    }

    pub fn new(vector: Vec<f32>, payload: PointPayload) -> Self {
        let id = Self::deterministic_id(payload.video_id, payload.chunk_index);
        Self {
            id,
            vector,
            payload,
        }
    }
}

/// A search hit with its relevance score.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: PointPayload,
}

/// Owner and video scoping applied to searches and deletes.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub user_id: Option<Uuid>,
    pub video_ids: Option<Vec<Uuid>>,
}

impl SearchFilter {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            video_ids: None,
        }
    }

    pub fn for_videos(user_id: Uuid, video_ids: Vec<Uuid>) -> Self {
        Self {
            user_id: Some(user_id),
            video_ids: Some(video_ids),
        }
    }

    pub fn matches(&self, payload: &PointPayload) -> bool {
        if let Some(user_id) = self.user_id {
            if payload.user_id != user_id {
                return false;
            }
        }
        if let Some(video_ids) = &self.video_ids {
            if !video_ids.contains(&payload.video_id) {
                return false;
            }
        }
        true
    }
}

/// Trait for vector index implementations.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if missing; idempotent. Cosine distance.
    async fn ensure_collection(&self, dimensions: usize) -> Result<()>;

    /// Insert or overwrite points.
    async fn upsert(&self, points: &[IndexedPoint]) -> Result<usize>;

    /// Nearest-neighbour search ordered by score descending.
    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredPoint>>;

    /// MMR-diversified search over a prefetched candidate pool.
    ///
    /// `diversity` is the MMR lambda: 0 = pure relevance, 1 = pure diversity.
    async fn search_with_diversity(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        top_k: usize,
        diversity: f32,
        prefetch: usize,
    ) -> Result<Vec<ScoredPoint>>;

    /// Search guaranteeing at least `min_per_video` hits from every distinct
    /// video present in the candidate pool, filling the rest by score.
    async fn search_with_video_guarantee(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        top_k: usize,
        min_per_video: usize,
    ) -> Result<Vec<ScoredPoint>>;

    /// Bulk delete by payload filter. Returns removed count.
    async fn delete_by(&self, filter: &SearchFilter) -> Result<usize>;

    /// Fetch stored vectors for reuse, keyed by (video_id, chunk_index).
    async fn fetch_vectors(
        &self,
        user_id: Uuid,
        video_ids: &[Uuid],
    ) -> Result<HashMap<(Uuid, u32), Vec<f32>>>;

    /// Total number of stored points.
    async fn point_count(&self) -> Result<usize>;
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Candidate for in-process MMR selection: score plus its raw vector.
pub(crate) struct MmrCandidate {
    pub point: ScoredPoint,
    pub vector: Vec<f32>,
}

/// Maximal Marginal Relevance selection over scored candidates.
///
/// `mmr(i) = (1 - lambda) * sim(q, i) - lambda * max_{j in selected} sim(i, j)`
///
/// Candidates must arrive ordered by query similarity descending; ties are
/// broken by (video_id, chunk_index) so selection is deterministic.
pub(crate) fn mmr_select(
    mut candidates: Vec<MmrCandidate>,
    top_k: usize,
    lambda: f32,
) -> Vec<ScoredPoint> {
    if candidates.is_empty() || top_k == 0 {
        return Vec::new();
    }

    candidates.sort_by(|a, b| {
        b.point
            .score
            .partial_cmp(&a.point.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                (a.point.payload.video_id, a.point.payload.chunk_index)
                    .cmp(&(b.point.payload.video_id, b.point.payload.chunk_index))
            })
    });

    let mut selected: Vec<MmrCandidate> = Vec::with_capacity(top_k.min(candidates.len()));
    selected.push(candidates.remove(0));

    while selected.len() < top_k && !candidates.is_empty() {
        let mut best_idx = 0;
        let mut best_score = f32::NEG_INFINITY;

        for (i, candidate) in candidates.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|s| cosine_similarity(&candidate.vector, &s.vector))
                .fold(f32::NEG_INFINITY, f32::max);
            let mmr = (1.0 - lambda) * candidate.point.score - lambda * max_sim;
            if mmr > best_score {
                best_score = mmr;
                best_idx = i;
            }
        }

        selected.push(candidates.remove(best_idx));
    }

    selected.into_iter().map(|c| c.point).collect()
}

/// Guarantee `min_per_video` hits from each distinct video in the pool,
/// then fill the remainder by global score. Pool must be score-descending.
pub(crate) fn select_with_video_guarantee(
    pool: Vec<ScoredPoint>,
    top_k: usize,
    min_per_video: usize,
) -> Vec<ScoredPoint> {
    use std::collections::HashSet;

    let mut taken_ids: HashSet<Uuid> = HashSet::new();
    let mut per_video: HashMap<Uuid, usize> = HashMap::new();
    let mut result: Vec<ScoredPoint> = Vec::new();

    // First pass: per-video guarantees in score order.
    for point in &pool {
        let count = per_video.entry(point.payload.video_id).or_insert(0);
        if *count < min_per_video {
            *count += 1;
            taken_ids.insert(point.id);
            result.push(point.clone());
        }
    }

    // Second pass: fill by score. Guarantees may already exceed top_k.
    for point in pool {
        if result.len() >= top_k {
            break;
        }
        if !taken_ids.contains(&point.id) {
            taken_ids.insert(point.id);
            result.push(point);
        }
    }

    result.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(video: Uuid, idx: u32) -> PointPayload {
        PointPayload {
            user_id: Uuid::nil(),
            video_id: video,
            chunk_index: idx,
            text: format!("chunk {}", idx),
            start_timestamp: idx as f64 * 10.0,
            end_timestamp: idx as f64 * 10.0 + 10.0,
            title: None,
            summary: None,
            keywords: vec![],
            chapter_title: None,
            speakers: vec![],
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &[1.0, 0.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 0.001);
        assert!((cosine_similarity(&a, &[-1.0, 0.0, 0.0]) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_deterministic_point_ids() {
        let video = Uuid::new_v4();
        let a = IndexedPoint::deterministic_id(video, 3);
        let b = IndexedPoint::deterministic_id(video, 3);
        let c = IndexedPoint::deterministic_id(video, 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_mmr_prefers_diverse_results() {
        let video = Uuid::new_v4();
        // Two near-identical high scorers and one distinct lower scorer.
        let candidates = vec![
            MmrCandidate {
                point: ScoredPoint {
                    id: Uuid::new_v4(),
                    score: 0.95,
                    payload: payload(video, 0),
                },
                vector: vec![1.0, 0.0, 0.0],
            },
            MmrCandidate {
                point: ScoredPoint {
                    id: Uuid::new_v4(),
                    score: 0.94,
                    payload: payload(video, 1),
                },
                vector: vec![0.999, 0.01, 0.0],
            },
            MmrCandidate {
                point: ScoredPoint {
                    id: Uuid::new_v4(),
                    score: 0.6,
                    payload: payload(video, 2),
                },
                vector: vec![0.0, 1.0, 0.0],
            },
        ];

        let picked = mmr_select(candidates, 2, 0.7);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].payload.chunk_index, 0);
        // The diverse candidate beats the near-duplicate despite lower score.
        assert_eq!(picked[1].payload.chunk_index, 2);
    }

    #[test]
    fn test_mmr_zero_diversity_is_pure_relevance() {
        let video = Uuid::new_v4();
        let candidates = (0..4)
            .map(|i| MmrCandidate {
                point: ScoredPoint {
                    id: Uuid::new_v4(),
                    score: 1.0 - i as f32 * 0.1,
                    payload: payload(video, i),
                },
                vector: vec![1.0, 0.0],
            })
            .collect();

        let picked = mmr_select(candidates, 3, 0.0);
        let indices: Vec<u32> = picked.iter().map(|p| p.payload.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_video_guarantee_covers_all_videos() {
        let video_a = Uuid::new_v4();
        let video_b = Uuid::new_v4();

        // All top scorers from video A, one weak hit from video B.
        let mut pool: Vec<ScoredPoint> = (0..5)
            .map(|i| ScoredPoint {
                id: Uuid::new_v4(),
                score: 0.9 - i as f32 * 0.01,
                payload: payload(video_a, i),
            })
            .collect();
        pool.push(ScoredPoint {
            id: Uuid::new_v4(),
            score: 0.2,
            payload: payload(video_b, 0),
        });

        let picked = select_with_video_guarantee(pool, 4, 1);
        let videos: std::collections::HashSet<Uuid> =
            picked.iter().map(|p| p.payload.video_id).collect();
        assert!(videos.contains(&video_a));
        assert!(videos.contains(&video_b));
    }
}
