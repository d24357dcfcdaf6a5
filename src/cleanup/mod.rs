//! Periodic maintenance: stale pipeline GC, orphaned file GC, storage quota
//! reconciliation, and conversation memory consolidation.
//!
//! Storage accounting is delta-tracked on the hot path; the daily
//! reconciliation recomputes it from ground truth (disk + database text +
//! vector estimate) and corrects drift larger than 10 MB.

use crate::db::Database;
use crate::error::Result;
use crate::memory::consolidate_conversation;
use crate::models::CleanupOption;
use crate::pipeline::cancel::{vector_bytes_estimate, Canceller};
use crate::storage::BlobStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Hours a video may sit in pending/downloading before auto-cancel.
const STALE_THRESHOLD_HOURS: i64 = 24;
/// Hours since the last message before a conversation's memory consolidates.
const MEMORY_STALE_HOURS: i64 = 24;
/// Storage drift below this is left alone.
const QUOTA_DISCREPANCY_THRESHOLD_MB: f64 = 10.0;

/// Outcome of one stale-video sweep.
#[derive(Debug, Default)]
pub struct StaleSweepReport {
    pub canceled: usize,
    pub errors: Vec<String>,
}

/// Outcome of one orphaned-file sweep.
#[derive(Debug, Default)]
pub struct OrphanSweepReport {
    pub orphaned_audio_dirs: usize,
    pub orphaned_transcript_dirs: usize,
    pub freed_mb: f64,
}

/// Outcome of one quota reconciliation.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub users_checked: usize,
    pub corrections: usize,
    pub orphaned_chunks_deleted: usize,
}

/// Outcome of one memory consolidation sweep.
#[derive(Debug, Default)]
pub struct MemorySweepReport {
    pub conversations: usize,
    pub merged: usize,
    pub decayed: usize,
    pub pruned: usize,
}

/// The periodic cleanup scheduler.
pub struct CleanupScheduler {
    db: Arc<Database>,
    store: Arc<BlobStore>,
    canceller: Arc<Canceller>,
    embedding_dimensions: usize,
}

impl CleanupScheduler {
    pub fn new(
        db: Arc<Database>,
        store: Arc<BlobStore>,
        canceller: Arc<Canceller>,
        embedding_dimensions: usize,
    ) -> Self {
        Self {
            db,
            store,
            canceller,
            embedding_dimensions,
        }
    }

    /// Hourly: cancel (keeping the record) videos stuck in pending or
    /// downloading for more than 24 hours.
    #[instrument(skip(self))]
    pub async fn cleanup_stale_videos(&self) -> Result<StaleSweepReport> {
        let cutoff = Utc::now() - ChronoDuration::hours(STALE_THRESHOLD_HOURS);
        let stale = self.db.stale_videos(cutoff)?;

        let mut report = StaleSweepReport::default();
        if stale.is_empty() {
            info!("No stale videos found");
            return Ok(report);
        }

        for video in stale {
            let age_hours = (Utc::now() - video.created_at).num_seconds() as f64 / 3600.0;
            info!(
                "Canceling stale video {} (status={}, age={:.1}h)",
                video.id, video.status, age_hours
            );
            match self.canceller.cancel(video.id, CleanupOption::KeepVideo).await {
                Ok(_) => report.canceled += 1,
                Err(e) => report.errors.push(format!("{}: {}", video.id, e)),
            }
        }

        info!(
            "Stale video sweep complete: canceled={}, errors={}",
            report.canceled,
            report.errors.len()
        );
        Ok(report)
    }

    /// Daily: remove (user, video) blob directories whose video row no
    /// longer exists, reporting freed bytes.
    #[instrument(skip(self))]
    pub async fn cleanup_orphaned_files(&self) -> Result<OrphanSweepReport> {
        let mut report = OrphanSweepReport::default();
        let mut freed_bytes = 0u64;

        for (audio, dirs) in [
            (true, self.store.audio_video_dirs()?),
            (false, self.store.transcript_video_dirs()?),
        ] {
            for (_user_id, video_id, dir) in dirs {
                match self.db.video_exists(video_id) {
                    Ok(true) => continue,
                    Ok(false) => {
                        let size = crate::storage::dir_size(&dir).unwrap_or(0);
                        if let Err(e) = std::fs::remove_dir_all(&dir) {
                            warn!("Failed to remove orphaned dir {:?}: {}", dir, e);
                            continue;
                        }
                        freed_bytes += size;
                        if audio {
                            report.orphaned_audio_dirs += 1;
                        } else {
                            report.orphaned_transcript_dirs += 1;
                        }
                        info!("Removed orphaned dir {:?}", dir);
                    }
                    Err(e) => warn!("Failed checking video {}: {}", video_id, e),
                }
            }
        }

        report.freed_mb = freed_bytes as f64 / (1024.0 * 1024.0);
        info!(
            "Orphan sweep complete: audio_dirs={}, transcript_dirs={}, freed_mb={:.2}",
            report.orphaned_audio_dirs, report.orphaned_transcript_dirs, report.freed_mb
        );
        Ok(report)
    }

    /// Daily: recompute every user's storage from ground truth and overwrite
    /// tracked figures that drifted beyond 10 MB.
    ///
    /// Ground truth = blob store bytes + chunk text bytes in the database +
    /// indexed chunk count times the per-vector estimate.
    #[instrument(skip(self))]
    pub async fn reconcile_storage_quotas(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        // Chunks of soft-deleted videos are a known drift source; purge first.
        report.orphaned_chunks_deleted = self.db.delete_chunks_of_deleted_videos()?;
        if report.orphaned_chunks_deleted > 0 {
            info!(
                "Deleted {} orphaned chunks from soft-deleted videos",
                report.orphaned_chunks_deleted
            );
        }

        for quota in self.db.all_quotas()? {
            report.users_checked += 1;

            let disk_mb = match self.store.usage_mb(quota.user_id) {
                Ok(mb) => mb,
                Err(e) => {
                    warn!("Failed to size disk for user {}: {}", quota.user_id, e);
                    continue;
                }
            };
            let db_text_mb = self.db.chunk_text_bytes_for_user(quota.user_id)? as f64
                / (1024.0 * 1024.0);
            let vector_mb = (self.db.indexed_chunk_count_for_user(quota.user_id)?
                * vector_bytes_estimate(self.embedding_dimensions)) as f64
                / (1024.0 * 1024.0);

            let actual = disk_mb + db_text_mb + vector_mb;
            let tracked = quota.storage_mb_used;

            if (actual - tracked).abs() > QUOTA_DISCREPANCY_THRESHOLD_MB {
                info!(
                    "Correcting storage for user {}: {:.2} MB -> {:.2} MB",
                    quota.user_id, tracked, actual
                );
                let mut corrected = quota.clone();
                corrected.storage_mb_used = actual.max(0.0);
                self.db.upsert_quota(&corrected)?;
                report.corrections += 1;
            }
        }

        info!(
            "Quota reconciliation complete: checked={}, corrections={}",
            report.users_checked, report.corrections
        );
        Ok(report)
    }

    /// Daily: consolidate memory for conversations idle for 24 hours.
    #[instrument(skip(self))]
    pub async fn consolidate_memories(&self) -> Result<MemorySweepReport> {
        let cutoff = Utc::now() - ChronoDuration::hours(MEMORY_STALE_HOURS);
        let conversations = self.db.idle_conversations_with_facts(cutoff)?;

        let mut report = MemorySweepReport::default();
        for conversation_id in conversations {
            match consolidate_conversation(&self.db, conversation_id, false) {
                Ok(stats) => {
                    report.conversations += 1;
                    report.merged += stats.merged;
                    report.decayed += stats.decayed;
                    report.pruned += stats.pruned;
                }
                Err(e) => warn!("Consolidation failed for {}: {}", conversation_id, e),
            }
        }

        info!(
            "Memory consolidation complete: conversations={}, merged={}, decayed={}, pruned={}",
            report.conversations, report.merged, report.decayed, report.pruned
        );
        Ok(report)
    }

    /// Drive the periodic jobs forever: stale GC hourly; orphan GC,
    /// reconciliation, and memory consolidation daily.
    pub async fn run_forever(self: Arc<Self>) {
        let hourly = self.clone();
        let hourly_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tick.tick().await;
                if let Err(e) = hourly.cleanup_stale_videos().await {
                    warn!("Stale video sweep failed: {}", e);
                }
            }
        });

        let daily = self.clone();
        let daily_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(24 * 3600));
            loop {
                tick.tick().await;
                if let Err(e) = daily.cleanup_orphaned_files().await {
                    warn!("Orphan sweep failed: {}", e);
                }
                if let Err(e) = daily.reconcile_storage_quotas().await {
                    warn!("Quota reconciliation failed: {}", e);
                }
                if let Err(e) = daily.consolidate_memories().await {
                    warn!("Memory consolidation failed: {}", e);
                }
            }
        });

        let _ = tokio::join!(hourly_task, daily_task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaSettings;
    use crate::models::{ChunkRecord, Tier, User, Video, VideoStatus};
    use crate::quota::UsageTracker;
    use crate::vector_store::MemoryVectorIndex;
    use uuid::Uuid;

    struct Fixture {
        db: Arc<Database>,
        store: Arc<BlobStore>,
        scheduler: CleanupScheduler,
        tracker: Arc<UsageTracker>,
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
            email: "gc@example.com".to_string(),
            tier: Tier::Free,
            is_admin: false,
            is_active: true,
            created_at: Utc::now(),
        };
        db.insert_user(&user).unwrap();

        let canceller = Arc::new(Canceller::new(
            db.clone(),
            store.clone(),
            index,
            tracker.clone(),
            None,
            384,
        ));
        let scheduler = CleanupScheduler::new(db.clone(), store.clone(), canceller, 384);

        Fixture {
            db,
            store,
            scheduler,
            tracker,
            user_id: user.id,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn test_stale_sweep_cancels_old_pending_videos() {
        let f = fixture();

        let mut stale = Video::new(f.user_id, "url", "old", "Old");
        stale.created_at = Utc::now() - ChronoDuration::hours(48);
        stale.status = VideoStatus::Downloading;
        f.db.insert_video(&stale).unwrap();

        let fresh = Video::new(f.user_id, "url", "new", "New");
        f.db.insert_video(&fresh).unwrap();

        let report = f.scheduler.cleanup_stale_videos().await.unwrap();
        assert_eq!(report.canceled, 1);
        assert!(report.errors.is_empty());

        let canceled = f.db.get_video(stale.id).unwrap().unwrap();
        assert_eq!(canceled.status, VideoStatus::Canceled);
        let untouched = f.db.get_video(fresh.id).unwrap().unwrap();
        assert_eq!(untouched.status, VideoStatus::Pending);
    }

    #[tokio::test]
    async fn test_orphan_sweep_removes_unknown_dirs() {
        let f = fixture();

        // A dir for a real video stays; one for a vanished video goes.
        let real = Video::new(f.user_id, "url", "real", "Real");
        f.db.insert_video(&real).unwrap();
        f.store
            .put_audio(f.user_id, real.id, b"keep", "a.mp3")
            .unwrap();
        f.store
            .put_audio(f.user_id, Uuid::new_v4(), b"orphan", "a.mp3")
            .unwrap();

        let report = f.scheduler.cleanup_orphaned_files().await.unwrap();
        assert_eq!(report.orphaned_audio_dirs, 1);
        assert!(report.freed_mb > 0.0);
        assert!(f.store.audio_path(f.user_id, real.id).is_some());
    }

    #[tokio::test]
    async fn test_reconciliation_corrects_drift() {
        let f = fixture();

        // Tracked figure is wildly off actual (which is ~0).
        f.tracker
            .track_storage_usage(f.user_id, 500.0, "seed", None)
            .unwrap();

        let report = f.scheduler.reconcile_storage_quotas().await.unwrap();
        assert_eq!(report.users_checked, 1);
        assert_eq!(report.corrections, 1);

        let quota = f.db.get_quota(f.user_id).unwrap().unwrap();
        assert!(
            quota.storage_mb_used < QUOTA_DISCREPANCY_THRESHOLD_MB,
            "tracked figure should be rewritten to actual: {}",
            quota.storage_mb_used
        );
    }

    #[tokio::test]
    async fn test_reconciliation_leaves_small_drift() {
        let f = fixture();
        f.tracker
            .track_storage_usage(f.user_id, 5.0, "seed", None)
            .unwrap();

        let report = f.scheduler.reconcile_storage_quotas().await.unwrap();
        assert_eq!(report.corrections, 0);
    }

    #[tokio::test]
    async fn test_reconciliation_purges_soft_deleted_chunks() {
        let f = fixture();

        let video = Video::new(f.user_id, "url", "gone", "Gone");
        f.db.insert_video(&video).unwrap();
        let chunk = ChunkRecord {
            id: Uuid::new_v4(),
            video_id: video.id,
            user_id: f.user_id,
            chunk_index: 0,
            text: "x".to_string(),
            token_count: 1,
            start_timestamp: 0.0,
            end_timestamp: 1.0,
            speakers: vec![],
            chapter_title: None,
            chapter_index: None,
            title: None,
            summary: None,
            keywords: vec![],
            embedding_text: "x".to_string(),
            is_indexed: false,
            created_at: Utc::now(),
        };
        f.db.insert_chunks(&[chunk]).unwrap();
        f.db.soft_delete_video(video.id).unwrap();

        let report = f.scheduler.reconcile_storage_quotas().await.unwrap();
        assert_eq!(report.orphaned_chunks_deleted, 1);
    }
}
