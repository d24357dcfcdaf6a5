//! SQLite-based vector index implementation.
//!
//! Vectors live in a dedicated table with cosine similarity computed in Rust.
//! Suits single-node deployments; the trait boundary leaves room for a
//! dedicated vector database later.

use super::{
    cosine_similarity, mmr_select, select_with_video_guarantee, IndexedPoint, MmrCandidate,
    PointPayload, ScoredPoint, SearchFilter, VectorIndex,
};
use crate::error::{Result, ViskaError};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// SQLite-backed vector index.
pub struct SqliteVectorIndex {
    conn: Mutex<Connection>,
}

impl SqliteVectorIndex {
    /// Open (or create) the index at the given path.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::create_tables(&conn)?;

        info!("Initialized SQLite vector index at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory index (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS points (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                video_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                vector BLOB NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_points_user_id ON points(user_id);
            CREATE INDEX IF NOT EXISTS idx_points_video_id ON points(video_id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ViskaError::VectorStore(format!("Failed to acquire lock: {}", e)))
    }

    fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
        vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| {
                let arr: [u8; 4] = chunk.try_into().unwrap_or_default();
                f32::from_le_bytes(arr)
            })
            .collect()
    }

    /// Load all candidates matching the filter, with vectors, score-sorted.
    fn candidates(&self, query: &[f32], filter: &SearchFilter) -> Result<Vec<MmrCandidate>> {
        let conn = self.lock()?;

        let mut sql = "SELECT id, vector, payload FROM points WHERE 1=1".to_string();
        let mut values: Vec<String> = Vec::new();

        if let Some(user_id) = filter.user_id {
            sql.push_str(" AND user_id = ?");
            values.push(user_id.to_string());
        }
        if let Some(video_ids) = &filter.video_ids {
            if video_ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = video_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND video_id IN ({})", placeholders));
            values.extend(video_ids.iter().map(|id| id.to_string()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            let id_str: String = row.get(0)?;
            let vector_bytes: Vec<u8> = row.get(1)?;
            let payload_raw: String = row.get(2)?;
            Ok((id_str, vector_bytes, payload_raw))
        })?;

        let mut candidates = Vec::new();
        for row in rows.flatten() {
            let (id_str, vector_bytes, payload_raw) = row;
            let Ok(payload) = serde_json::from_str::<PointPayload>(&payload_raw) else {
                continue;
            };
            let vector = Self::bytes_to_vector(&vector_bytes);
            let score = cosine_similarity(query, &vector);
            candidates.push(MmrCandidate {
                point: ScoredPoint {
                    id: Uuid::parse_str(&id_str).unwrap_or_default(),
                    score,
                    payload,
                },
                vector,
            });
        }

        candidates.sort_by(|a, b| {
            b.point
                .score
                .partial_cmp(&a.point.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn ensure_collection(&self, _dimensions: usize) -> Result<()> {
        // Tables are created on open; dimensions are embedded in the vectors.
        Ok(())
    }

    #[instrument(skip(self, points))]
    async fn upsert(&self, points: &[IndexedPoint]) -> Result<usize> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        for point in points {
            let payload_json = serde_json::to_string(&point.payload)
                .map_err(|e| ViskaError::VectorStore(format!("Payload serialize: {}", e)))?;
            tx.execute(
                r#"
                INSERT OR REPLACE INTO points (id, user_id, video_id, chunk_index, vector, payload)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    point.id.to_string(),
                    point.payload.user_id.to_string(),
                    point.payload.video_id.to_string(),
                    point.payload.chunk_index,
                    Self::vector_to_bytes(&point.vector),
                    payload_json,
                ],
            )?;
        }

        tx.commit()?;
        info!("Upserted {} points", points.len());
        Ok(points.len())
    }

    #[instrument(skip(self, query))]
    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let mut candidates = self.candidates(query, filter)?;
        candidates.truncate(top_k);
        debug!("Search returned {} points", candidates.len());
        Ok(candidates.into_iter().map(|c| c.point).collect())
    }

    #[instrument(skip(self, query))]
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

    #[instrument(skip(self, query))]
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

    #[instrument(skip(self))]
    async fn delete_by(&self, filter: &SearchFilter) -> Result<usize> {
        let conn = self.lock()?;

        let mut sql = "DELETE FROM points WHERE 1=1".to_string();
        let mut values: Vec<String> = Vec::new();

        if let Some(user_id) = filter.user_id {
            sql.push_str(" AND user_id = ?");
            values.push(user_id.to_string());
        }
        if let Some(video_ids) = &filter.video_ids {
            if video_ids.is_empty() {
                return Ok(0);
            }
            let placeholders = video_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND video_id IN ({})", placeholders));
            values.extend(video_ids.iter().map(|id| id.to_string()));
        }

        let deleted = conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        info!("Deleted {} points", deleted);
        Ok(deleted)
    }

    async fn fetch_vectors(
        &self,
        user_id: Uuid,
        video_ids: &[Uuid],
    ) -> Result<HashMap<(Uuid, u32), Vec<f32>>> {
        if video_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock()?;
        let placeholders = video_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT video_id, chunk_index, vector FROM points
             WHERE user_id = ? AND video_id IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<String> = vec![user_id.to_string()];
        values.extend(video_ids.iter().map(|id| id.to_string()));

        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            let video_str: String = row.get(0)?;
            let chunk_index: u32 = row.get(1)?;
            let vector_bytes: Vec<u8> = row.get(2)?;
            Ok((video_str, chunk_index, vector_bytes))
        })?;

        let mut map = HashMap::new();
        for row in rows.flatten() {
            let (video_str, chunk_index, vector_bytes) = row;
            if let Ok(video_id) = Uuid::parse_str(&video_str) {
                map.insert((video_id, chunk_index), Self::bytes_to_vector(&vector_bytes));
            }
        }
        Ok(map)
    }

    async fn point_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM points", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_point(user: Uuid, video: Uuid, idx: u32, vector: Vec<f32>) -> IndexedPoint {
        IndexedPoint::new(
            vector,
            PointPayload {
                user_id: user,
                video_id: video,
                chunk_index: idx,
                text: format!("chunk {}", idx),
                start_timestamp: idx as f64 * 30.0,
                end_timestamp: idx as f64 * 30.0 + 30.0,
                title: None,
                summary: None,
                keywords: vec![],
                chapter_title: None,
                speakers: vec![],
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_search_delete() {
        let index = SqliteVectorIndex::in_memory().unwrap();
        let user = Uuid::new_v4();
        let video = Uuid::new_v4();

        index
            .upsert(&[
                make_point(user, video, 0, vec![1.0, 0.0, 0.0]),
                make_point(user, video, 1, vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();

        let filter = SearchFilter::for_user(user);
        let results = index.search(&[1.0, 0.0, 0.0], &filter, 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].payload.chunk_index, 0);
        assert!((results[0].score - 1.0).abs() < 0.001);

        let deleted = index
            .delete_by(&SearchFilter::for_videos(user, vec![video]))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(index.point_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent() {
        let index = SqliteVectorIndex::in_memory().unwrap();
        let user = Uuid::new_v4();
        let video = Uuid::new_v4();

        let points = vec![
            make_point(user, video, 0, vec![1.0, 0.0]),
            make_point(user, video, 1, vec![0.0, 1.0]),
        ];
        index.upsert(&points).await.unwrap();
        index.upsert(&points).await.unwrap();

        assert_eq!(index.point_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_user_isolation() {
        let index = SqliteVectorIndex::in_memory().unwrap();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let video = Uuid::new_v4();

        index
            .upsert(&[make_point(user_a, video, 0, vec![1.0, 0.0])])
            .await
            .unwrap();

        let results = index
            .search(&[1.0, 0.0], &SearchFilter::for_user(user_b), 10)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_vectors() {
        let index = SqliteVectorIndex::in_memory().unwrap();
        let user = Uuid::new_v4();
        let video = Uuid::new_v4();

        index
            .upsert(&[make_point(user, video, 2, vec![0.5, 0.5])])
            .await
            .unwrap();

        let vectors = index.fetch_vectors(user, &[video]).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors.get(&(video, 2)).unwrap(), &vec![0.5, 0.5]);
    }
}
