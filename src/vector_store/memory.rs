//! In-memory vector index for tests and ephemeral runs.

use super::{
    cosine_similarity, mmr_select, select_with_video_guarantee, IndexedPoint, MmrCandidate,
    ScoredPoint, SearchFilter, VectorIndex,
};
use crate::error::{Result, ViskaError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// In-memory vector index.
pub struct MemoryVectorIndex {
    points: RwLock<HashMap<Uuid, IndexedPoint>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
        }
    }

    fn candidates(&self, query: &[f32], filter: &SearchFilter) -> Result<Vec<MmrCandidate>> {
        let points = self
            .points
            .read()
            .map_err(|e| ViskaError::VectorStore(format!("Failed to acquire lock: {}", e)))?;

        let mut candidates: Vec<MmrCandidate> = points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| MmrCandidate {
                point: ScoredPoint {
                    id: p.id,
                    score: cosine_similarity(query, &p.vector),
                    payload: p.payload.clone(),
                },
                vector: p.vector.clone(),
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.point
                .score
                .partial_cmp(&a.point.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn ensure_collection(&self, _dimensions: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, new_points: &[IndexedPoint]) -> Result<usize> {
        let mut points = self
            .points
            .write()
            .map_err(|e| ViskaError::VectorStore(format!("Failed to acquire lock: {}", e)))?;
        for point in new_points {
            points.insert(point.id, point.clone());
        }
        Ok(new_points.len())
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let mut candidates = self.candidates(query, filter)?;
        candidates.truncate(top_k);
        Ok(candidates.into_iter().map(|c| c.point).collect())
    }

    async fn search_with_diversity(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        top_k: usize,
        diversity: f32,
        prefetch: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let mut candidates = self.candidates(query, filter)?;
        candidates.truncate(prefetch);
        Ok(mmr_select(candidates, top_k, diversity))
    }

    async fn search_with_video_guarantee(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        top_k: usize,
        min_per_video: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let candidates = self.candidates(query, filter)?;
        let pool: Vec<ScoredPoint> = candidates.into_iter().map(|c| c.point).collect();
        Ok(select_with_video_guarantee(pool, top_k, min_per_video))
    }

    async fn delete_by(&self, filter: &SearchFilter) -> Result<usize> {
        let mut points = self
            .points
            .write()
            .map_err(|e| ViskaError::VectorStore(format!("Failed to acquire lock: {}", e)))?;
        let before = points.len();
        points.retain(|_, p| !filter.matches(&p.payload));
        Ok(before - points.len())
    }

    async fn fetch_vectors(
        &self,
        user_id: Uuid,
        video_ids: &[Uuid],
    ) -> Result<HashMap<(Uuid, u32), Vec<f32>>> {
        let points = self
            .points
            .read()
            .map_err(|e| ViskaError::VectorStore(format!("Failed to acquire lock: {}", e)))?;
        let mut map = HashMap::new();
        for p in points.values() {
            if p.payload.user_id == user_id && video_ids.contains(&p.payload.video_id) {
                map.insert(
                    (p.payload.video_id, p.payload.chunk_index),
                    p.vector.clone(),
                );
            }
        }
        Ok(map)
    }

    async fn point_count(&self) -> Result<usize> {
        let points = self
            .points
            .read()
            .map_err(|e| ViskaError::VectorStore(format!("Failed to acquire lock: {}", e)))?;
        Ok(points.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::PointPayload;

    #[tokio::test]
    async fn test_memory_index_basics() {
        let index = MemoryVectorIndex::new();
        let user = Uuid::new_v4();
        let video = Uuid::new_v4();

        let point = IndexedPoint::new(
            vec![1.0, 0.0],
            PointPayload {
                user_id: user,
                video_id: video,
                chunk_index: 0,
                text: "hello".to_string(),
                start_timestamp: 0.0,
                end_timestamp: 5.0,
                title: None,
                summary: None,
                keywords: vec![],
                chapter_title: None,
                speakers: vec![],
            },
        );
        index.upsert(&[point]).await.unwrap();

        let results = index
            .search(&[1.0, 0.0], &SearchFilter::for_user(user), 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        let deleted = index
            .delete_by(&SearchFilter::for_videos(user, vec![video]))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(index.point_count().await.unwrap(), 0);
    }
}
