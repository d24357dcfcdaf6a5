//! Cancellation of in-flight video processing with deterministic cleanup.
//!
//! Setting `status = canceled` is the sole cooperative signal; active stages
//! observe it at their next checkpoint. Task revocation through the worker
//! pool is best-effort. Cleanup runs synchronously inside `cancel` so partial
//! state is reclaimed before the call returns, and it logs-and-continues on
//! partial failure rather than propagating errors.

use crate::db::Database;
use crate::error::{Result, ViskaError};
use crate::models::{CleanupOption, JobStatus, Video, VideoStatus};
use crate::pipeline::PipelineWorkers;
use crate::quota::UsageTracker;
use crate::storage::BlobStore;
use crate::vector_store::{SearchFilter, VectorIndex};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Estimated bytes per indexed chunk in the vector store: the float32 vector
/// plus payload overhead.
pub fn vector_bytes_estimate(dimensions: usize) -> u64 {
    (dimensions * 4 + 2048) as u64
}

/// What cleanup actually removed.
#[derive(Debug, Clone, Default)]
pub struct CleanupSummary {
    pub transcript_deleted: bool,
    pub chunks_deleted: usize,
    pub audio_file_deleted: bool,
    pub transcript_file_deleted: bool,
    pub vectors_deleted: bool,
    pub storage_freed_mb: f64,
}

/// Result of a cancel operation.
#[derive(Debug)]
pub struct CancelResult {
    pub video_id: Uuid,
    pub previous_status: VideoStatus,
    pub new_status: VideoStatus,
    pub task_revoked: bool,
    pub cleanup: CleanupSummary,
}

/// Cancellation engine.
pub struct Canceller {
    db: Arc<Database>,
    store: Arc<BlobStore>,
    index: Arc<dyn VectorIndex>,
    tracker: Arc<UsageTracker>,
    workers: Option<Arc<PipelineWorkers>>,
    embedding_dimensions: usize,
}

impl Canceller {
    pub fn new(
        db: Arc<Database>,
        store: Arc<BlobStore>,
        index: Arc<dyn VectorIndex>,
        tracker: Arc<UsageTracker>,
        workers: Option<Arc<PipelineWorkers>>,
        embedding_dimensions: usize,
    ) -> Self {
        Self {
            db,
            store,
            index,
            tracker,
            workers,
            embedding_dimensions,
        }
    }

    /// Cancel video processing and reclaim partial state.
    ///
    /// Rejects terminal videos, except that re-canceling an already-canceled
    /// video is a no-op success.
    #[instrument(skip(self))]
    pub async fn cancel(&self, video_id: Uuid, option: CleanupOption) -> Result<CancelResult> {
        // Re-fetch to avoid racing a stage transition.
        let video = self
            .db
            .get_video(video_id)?
            .ok_or_else(|| ViskaError::InvalidInput(format!("Video {} not found", video_id)))?;
        let previous_status = video.status;

        if video.status == VideoStatus::Canceled {
            return Ok(CancelResult {
                video_id,
                previous_status,
                new_status: VideoStatus::Canceled,
                task_revoked: false,
                cleanup: CleanupSummary::default(),
            });
        }
        if video.status.is_terminal() {
            return Err(ViskaError::InvalidInput(format!(
                "Video is already in terminal status: {}",
                video.status
            )));
        }

        // Mark canceled first so active stages stop at their next checkpoint.
        self.db.set_video_status(
            video_id,
            VideoStatus::Canceled,
            video.progress_percent,
            Some("Processing canceled by user"),
        )?;

        // Best-effort revocation of the in-flight task.
        let mut task_revoked = false;
        if let Some(workers) = &self.workers {
            if let Some(job) = self.db.latest_job_for_video(video_id)? {
                task_revoked = workers.revoke(job.task_handle);
                if task_revoked {
                    self.db.update_job_status(
                        job.id,
                        JobStatus::Canceled,
                        0.0,
                        None,
                        Some("Task revoked due to cancellation"),
                    )?;
                }
            }
        }

        // Reclaim partial state before returning.
        let cleanup = self.cleanup_video_data(&video, true, true, true, true).await;

        let new_status = match option {
            CleanupOption::FullDelete => {
                self.db.soft_delete_video(video_id)?;
                VideoStatus::Canceled
            }
            CleanupOption::KeepVideo => {
                self.db
                    .set_video_status(video_id, VideoStatus::Canceled, 0.0, None)?;
                VideoStatus::Canceled
            }
        };

        info!(
            "Canceled video {} ({} -> {}), freed {:.2} MB",
            video_id, previous_status, new_status, cleanup.storage_freed_mb
        );

        Ok(CancelResult {
            video_id,
            previous_status,
            new_status,
            task_revoked,
            cleanup,
        })
    }

    /// Delete a video's partial data and credit freed storage back.
    ///
    /// Every step logs and continues on failure; this function never errors.
    pub async fn cleanup_video_data(
        &self,
        video: &Video,
        delete_files: bool,
        delete_vectors: bool,
        delete_db_records: bool,
        track_quota: bool,
    ) -> CleanupSummary {
        let mut summary = CleanupSummary::default();
        let mut freed_bytes: u64 = 0;

        // Pre-deletion sizes: chunk text bytes and indexed-vector estimate.
        let mut chunk_text_bytes = 0u64;
        let mut indexed_count = 0u64;
        if delete_db_records {
            match self.db.chunk_text_bytes(video.id) {
                Ok(bytes) => chunk_text_bytes = bytes,
                Err(e) => warn!("Failed to size chunks for video {}: {}", video.id, e),
            }
            match self.db.indexed_chunk_count(video.id) {
                Ok(count) => indexed_count = count,
                Err(e) => warn!("Failed to count indexed chunks for video {}: {}", video.id, e),
            }
        }

        // 1. Vectors
        if delete_vectors {
            let filter = SearchFilter::for_videos(video.user_id, vec![video.id]);
            match self.index.delete_by(&filter).await {
                Ok(_) => {
                    summary.vectors_deleted = true;
                    freed_bytes += indexed_count * vector_bytes_estimate(self.embedding_dimensions);
                }
                Err(e) => warn!("Failed to delete vectors for video {}: {}", video.id, e),
            }
        }

        // 2. Chunk rows
        if delete_db_records {
            match self.db.delete_chunks_for_video(video.id) {
                Ok(count) => {
                    summary.chunks_deleted = count;
                    freed_bytes += chunk_text_bytes;
                }
                Err(e) => warn!("Failed to delete chunks for video {}: {}", video.id, e),
            }

            // 3. Transcript row
            match self.db.delete_transcript(video.id) {
                Ok(deleted) => summary.transcript_deleted = deleted,
                Err(e) => warn!("Failed to delete transcript for video {}: {}", video.id, e),
            }
        }

        // 4. Audio file
        if delete_files {
            if let Some(path) = self.store.audio_path(video.user_id, video.id) {
                freed_bytes += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            }
            match self.store.delete_audio(video.user_id, video.id) {
                Ok(deleted) => summary.audio_file_deleted = deleted,
                Err(e) => warn!("Failed to delete audio for video {}: {}", video.id, e),
            }

            // 5. Transcript file
            if let Some(path) = &video.transcript_file_path {
                freed_bytes += std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            }
            match self.store.delete_transcript(video.user_id, video.id) {
                Ok(deleted) => summary.transcript_file_deleted = deleted,
                Err(e) => warn!("Failed to delete transcript file for video {}: {}", video.id, e),
            }
        }

        summary.storage_freed_mb = freed_bytes as f64 / (1024.0 * 1024.0);

        // Credit freed storage back. Best-effort, never fatal.
        if track_quota && summary.storage_freed_mb > 0.0 {
            if let Err(e) = self.tracker.track_storage_usage(
                video.user_id,
                -summary.storage_freed_mb,
                "video_cleanup",
                Some(video.id),
            ) {
                warn!("Failed to credit storage for video {}: {}", video.id, e);
            }
        }

        // Null out file references; chunk_count = 0.
        if let Err(e) = self.db.clear_video_files(video.id) {
            warn!("Failed to clear file refs for video {}: {}", video.id, e);
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaSettings;
    use crate::models::{ChunkRecord, Tier, Transcript, TranscriptSegment, User};
    use crate::vector_store::{IndexedPoint, MemoryVectorIndex, PointPayload};
    use chrono::Utc;

    struct Fixture {
        db: Arc<Database>,
        store: Arc<BlobStore>,
        index: Arc<MemoryVectorIndex>,
        tracker: Arc<UsageTracker>,
        canceller: Canceller,
        user_id: Uuid,
        _tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(BlobStore::local(tmp.path()).unwrap());
        let index = Arc::new(MemoryVectorIndex::new());
        let tracker = Arc::new(UsageTracker::new(db.clone(), &QuotaSettings::default()));

        let user = User {
            id: Uuid::new_v4(),
            email: "cancel@example.com".to_string(),
            tier: Tier::Free,
            is_admin: false,
            is_active: true,
            created_at: Utc::now(),
        };
        db.insert_user(&user).unwrap();

        let canceller = Canceller::new(
            db.clone(),
            store.clone(),
            index.clone(),
            tracker.clone(),
            None,
            384,
        );

        Fixture {
            db,
            store,
            index,
            tracker,
            canceller,
            user_id: user.id,
            _tmp: tmp,
        }
    }

    async fn seed_video(f: &Fixture, status: VideoStatus) -> Video {
        let mut video = Video::new(f.user_id, "url", "vid123", "Test");
        video.status = status;
        f.db.insert_video(&video).unwrap();
        f.db.set_video_status(video.id, status, 50.0, None).unwrap();

        // Audio + transcript blobs
        let audio_path = f
            .store
            .put_audio(f.user_id, video.id, &[0u8; 2048], "audio.mp3")
            .unwrap();
        f.db.set_video_audio(video.id, &audio_path, 0.002).unwrap();

        let transcript = Transcript::from_segments(
            video.id,
            vec![TranscriptSegment::new(0.0, 5.0, "hello world".to_string())],
            "en",
        );
        f.db.upsert_transcript(&transcript).unwrap();
        let t_path = f.store.put_transcript(f.user_id, video.id, &transcript).unwrap();
        f.db.set_video_transcript_meta(video.id, "whisper", "en", Some(&t_path))
            .unwrap();

        // One indexed chunk + vector
        let chunk = ChunkRecord {
            id: Uuid::new_v4(),
            video_id: video.id,
            user_id: f.user_id,
            chunk_index: 0,
            text: "hello world".to_string(),
            token_count: 12,
            start_timestamp: 0.0,
            end_timestamp: 5.0,
            speakers: vec![],
            chapter_title: None,
            chapter_index: None,
            title: None,
            summary: None,
            keywords: vec![],
            embedding_text: "hello world".to_string(),
            is_indexed: true,
            created_at: Utc::now(),
        };
        f.db.insert_chunks(&[chunk]).unwrap();

        let point = IndexedPoint::new(
            vec![1.0, 0.0],
            PointPayload {
                user_id: f.user_id,
                video_id: video.id,
                chunk_index: 0,
                text: "hello world".to_string(),
                start_timestamp: 0.0,
                end_timestamp: 5.0,
                title: None,
                summary: None,
                keywords: vec![],
                chapter_title: None,
                speakers: vec![],
            },
        );
        f.index.upsert(&[point]).await.unwrap();

        // Seed the quota so the cleanup credit has something to reduce.
        f.tracker
            .track_storage_usage(f.user_id, 10.0, "seed", Some(video.id))
            .unwrap();

        f.db.get_video(video.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_cancel_reclaims_all_state() {
        let f = fixture();
        let video = seed_video(&f, VideoStatus::Transcribing).await;
        let pre_quota = f.tracker.get_or_create_quota(f.user_id).unwrap();

        let result = f
            .canceller
            .cancel(video.id, CleanupOption::FullDelete)
            .await
            .unwrap();

        assert_eq!(result.previous_status, VideoStatus::Transcribing);
        assert!(result.cleanup.chunks_deleted > 0);
        assert!(result.cleanup.vectors_deleted);
        assert!(result.cleanup.audio_file_deleted);
        assert!(result.cleanup.transcript_file_deleted);
        assert!(result.cleanup.storage_freed_mb > 0.0);

        // No chunks, no vectors, no files remain.
        assert!(f.db.chunks_for_video(video.id, false).unwrap().is_empty());
        assert_eq!(f.index.point_count().await.unwrap(), 0);
        assert!(f.store.audio_path(f.user_id, video.id).is_none());
        assert!(f.store.get_transcript(f.user_id, video.id).unwrap().is_none());

        // Storage was credited back.
        let post_quota = f.tracker.get_or_create_quota(f.user_id).unwrap();
        assert!(post_quota.storage_mb_used <= pre_quota.storage_mb_used);

        // Full delete soft-deletes the row.
        let loaded = f.db.get_video(video.id).unwrap().unwrap();
        assert!(loaded.is_deleted);
        assert!(loaded.deleted_at.is_some());
        assert_eq!(loaded.chunk_count, 0);
        assert!(loaded.audio_file_path.is_none());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let f = fixture();
        let video = seed_video(&f, VideoStatus::Downloading).await;

        f.canceller
            .cancel(video.id, CleanupOption::KeepVideo)
            .await
            .unwrap();

        // Second cancel is a no-op success.
        let again = f
            .canceller
            .cancel(video.id, CleanupOption::KeepVideo)
            .await
            .unwrap();
        assert_eq!(again.previous_status, VideoStatus::Canceled);
        assert_eq!(again.cleanup.chunks_deleted, 0);
    }

    #[tokio::test]
    async fn test_cancel_rejects_completed_video() {
        let f = fixture();
        let video = seed_video(&f, VideoStatus::Completed).await;

        let err = f
            .canceller
            .cancel(video.id, CleanupOption::KeepVideo)
            .await
            .unwrap_err();
        assert!(matches!(err, ViskaError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_keep_video_preserves_row() {
        let f = fixture();
        let video = seed_video(&f, VideoStatus::Pending).await;

        f.canceller
            .cancel(video.id, CleanupOption::KeepVideo)
            .await
            .unwrap();

        let loaded = f.db.get_video(video.id).unwrap().unwrap();
        assert!(!loaded.is_deleted);
        assert_eq!(loaded.status, VideoStatus::Canceled);
        assert_eq!(loaded.progress_percent, 0.0);
    }
}
