//! Per-user quota enforcement and usage accounting.
//!
//! Quotas cover a rolling 30-day window that is advanced lazily: any
//! operation that touches a quota past its period end resets the counters
//! and rolls the window forward. Storage is tracked by delta; the cleanup
//! scheduler reconciles against ground truth daily.

use crate::config::QuotaSettings;
use crate::db::Database;
use crate::error::{Result, ViskaError};
use crate::models::{Tier, UserQuota};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Quota dimensions that can be checked before an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Videos,
    Minutes,
    Messages,
    Storage,
}

impl QuotaKind {
    fn name(&self) -> &'static str {
        match self {
            QuotaKind::Videos => "videos",
            QuotaKind::Minutes => "minutes",
            QuotaKind::Messages => "messages",
            QuotaKind::Storage => "storage_mb",
        }
    }
}

/// Effectively-unlimited sentinel for paid tiers.
const UNLIMITED: u32 = 999_999;

/// Usage tracker bound to the database.
pub struct UsageTracker {
    db: Arc<Database>,
    settings: QuotaSettings,
}

impl UsageTracker {
    pub fn new(db: Arc<Database>, settings: &QuotaSettings) -> Self {
        Self {
            db,
            settings: settings.clone(),
        }
    }

    fn tier_limits(&self, tier: Tier) -> (u32, f64, u32, f64) {
        match tier {
            Tier::Free => (
                self.settings.free_tier_video_limit,
                self.settings.free_tier_minutes_limit,
                self.settings.free_tier_messages_limit,
                self.settings.free_tier_storage_mb_limit,
            ),
            Tier::Starter => (25, 2_500.0, 200, 2_500.0),
            Tier::Pro => (50, 5_000.0, UNLIMITED, 10_000.0),
            Tier::Business => (200, 20_000.0, UNLIMITED, 50_000.0),
            Tier::Enterprise => (UNLIMITED, 999_999.0, UNLIMITED, 100_000.0),
        }
    }

    fn initial_quota(&self, user_id: Uuid, tier: Tier) -> UserQuota {
        let now = Utc::now();
        let (videos, minutes, messages, storage) = self.tier_limits(tier);
        UserQuota {
            user_id,
            period_start: now,
            period_end: now + Duration::days(30),
            videos_used: 0,
            videos_limit: videos,
            minutes_used: 0.0,
            minutes_limit: minutes,
            messages_used: 0,
            messages_limit: messages,
            storage_mb_used: 0.0,
            storage_mb_limit: storage,
            embedding_tokens_used: 0,
            embedding_tokens_limit: None, // unlimited for local embeddings
        }
    }

    /// Fetch the user's quota, creating it or rolling the window forward
    /// when the period has lapsed.
    pub fn get_or_create_quota(&self, user_id: Uuid) -> Result<UserQuota> {
        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| ViskaError::InvalidInput(format!("User {} not found", user_id)))?;

        let now = Utc::now();
        match self.db.get_quota(user_id)? {
            Some(mut quota) => {
                if quota.period_end < now {
                    debug!("Rolling quota period forward for user {}", user_id);
                    quota.period_start = now;
                    quota.period_end = now + Duration::days(30);
                    quota.videos_used = 0;
                    quota.minutes_used = 0.0;
                    quota.messages_used = 0;
                    quota.storage_mb_used = 0.0;
                    quota.embedding_tokens_used = 0;
                    self.db.upsert_quota(&quota)?;
                }
                Ok(quota)
            }
            None => {
                let quota = self.initial_quota(user_id, user.tier);
                self.db.upsert_quota(&quota)?;
                Ok(quota)
            }
        }
    }

    /// Check that `amount` more of a quota dimension fits. Admins bypass all
    /// checks. Raises `QuotaExceeded` on failure.
    #[instrument(skip(self))]
    pub fn check(&self, user_id: Uuid, kind: QuotaKind, amount: f64) -> Result<()> {
        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| ViskaError::InvalidInput(format!("User {} not found", user_id)))?;
        if user.is_admin {
            return Ok(());
        }

        let quota = self.get_or_create_quota(user_id)?;

        let (used, limit) = match kind {
            QuotaKind::Videos => (quota.videos_used as f64, quota.videos_limit as f64),
            QuotaKind::Minutes => (quota.minutes_used, quota.minutes_limit),
            QuotaKind::Messages => (quota.messages_used as f64, quota.messages_limit as f64),
            QuotaKind::Storage => (quota.storage_mb_used, quota.storage_mb_limit),
        };

        if used + amount > limit {
            return Err(ViskaError::QuotaExceeded {
                kind: kind.name().to_string(),
                used,
                limit,
            });
        }

        Ok(())
    }

    /// Record a completed video ingestion: one video, its minutes, and the
    /// audio blob's storage.
    pub fn track_video_ingestion(
        &self,
        user_id: Uuid,
        video_id: Uuid,
        duration_seconds: f64,
        audio_size_mb: f64,
    ) -> Result<()> {
        let mut quota = self.get_or_create_quota(user_id)?;
        quota.videos_used += 1;
        quota.minutes_used += duration_seconds / 60.0;
        quota.storage_mb_used += audio_size_mb;
        self.db.upsert_quota(&quota)?;
        info!(
            "Tracked ingestion for video {} ({:.1} min, {:.1} MB)",
            video_id,
            duration_seconds / 60.0,
            audio_size_mb
        );
        Ok(())
    }

    /// Record a transcription as a billing event. Does not double-count the
    /// ingestion counters.
    pub fn track_transcription(
        &self,
        user_id: Uuid,
        video_id: Uuid,
        duration_seconds: f64,
    ) -> Result<()> {
        debug!(
            "Transcription event for user {} video {} ({:.1} min)",
            user_id,
            video_id,
            duration_seconds / 60.0
        );
        Ok(())
    }

    /// Record a chat message sent.
    pub fn track_chat_message(&self, user_id: Uuid) -> Result<()> {
        let mut quota = self.get_or_create_quota(user_id)?;
        quota.messages_used += 1;
        self.db.upsert_quota(&quota)
    }

    /// Record embedding generation for a batch of chunks.
    pub fn track_embedding_generation(&self, user_id: Uuid, chunk_count: u64) -> Result<()> {
        let mut quota = self.get_or_create_quota(user_id)?;
        quota.embedding_tokens_used += chunk_count;
        self.db.upsert_quota(&quota)
    }

    /// Apply a storage delta in MB. Positive for additions, negative for
    /// cleanups crediting space back. The stored value never drops below 0.
    #[instrument(skip(self))]
    pub fn track_storage_usage(
        &self,
        user_id: Uuid,
        delta_mb: f64,
        reason: &str,
        video_id: Option<Uuid>,
    ) -> Result<()> {
        let mut quota = self.get_or_create_quota(user_id)?;
        quota.storage_mb_used = (quota.storage_mb_used + delta_mb).max(0.0);
        self.db.upsert_quota(&quota)?;
        debug!(
            "Storage delta {:+.2} MB for user {} ({}), now {:.2} MB",
            delta_mb, user_id, reason, quota.storage_mb_used
        );
        Ok(())
    }

    /// Overwrite the tracked storage figure (reconciliation).
    pub fn set_storage_usage(&self, user_id: Uuid, actual_mb: f64) -> Result<()> {
        let mut quota = self.get_or_create_quota(user_id)?;
        let previous = quota.storage_mb_used;
        quota.storage_mb_used = actual_mb.max(0.0);
        self.db.upsert_quota(&quota)?;
        warn!(
            "Reconciled storage for user {}: {:.2} MB -> {:.2} MB",
            user_id, previous, actual_mb
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    fn setup(tier: Tier, is_admin: bool) -> (Arc<Database>, UsageTracker, Uuid) {
        let db = Arc::new(Database::in_memory().unwrap());
        let user = User {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", Uuid::new_v4()),
            tier,
            is_admin,
            is_active: true,
            created_at: Utc::now(),
        };
        db.insert_user(&user).unwrap();

        let mut settings = QuotaSettings::default();
        settings.free_tier_video_limit = 2;
        let tracker = UsageTracker::new(db.clone(), &settings);
        (db, tracker, user.id)
    }

    #[test]
    fn test_quota_check_blocks_at_limit() {
        let (_db, tracker, user_id) = setup(Tier::Free, false);

        tracker.check(user_id, QuotaKind::Videos, 1.0).unwrap();
        tracker
            .track_video_ingestion(user_id, Uuid::new_v4(), 60.0, 1.0)
            .unwrap();
        tracker
            .track_video_ingestion(user_id, Uuid::new_v4(), 60.0, 1.0)
            .unwrap();

        let err = tracker.check(user_id, QuotaKind::Videos, 1.0).unwrap_err();
        match err {
            ViskaError::QuotaExceeded { kind, used, limit } => {
                assert_eq!(kind, "videos");
                assert_eq!(used, 2.0);
                assert_eq!(limit, 2.0);
            }
            other => panic!("Expected QuotaExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_admin_bypasses_checks() {
        let (_db, tracker, user_id) = setup(Tier::Free, true);
        // Way over any limit, still fine for admins.
        tracker
            .check(user_id, QuotaKind::Videos, 1_000_000.0)
            .unwrap();
    }

    #[test]
    fn test_storage_delta_clamps_at_zero() {
        let (_db, tracker, user_id) = setup(Tier::Free, false);

        tracker
            .track_storage_usage(user_id, 5.0, "audio_saved", None)
            .unwrap();
        tracker
            .track_storage_usage(user_id, -100.0, "video_cleanup", None)
            .unwrap();

        let quota = tracker.get_or_create_quota(user_id).unwrap();
        assert_eq!(quota.storage_mb_used, 0.0);
    }

    #[test]
    fn test_period_rolls_forward() {
        let (db, tracker, user_id) = setup(Tier::Free, false);

        let mut quota = tracker.get_or_create_quota(user_id).unwrap();
        quota.videos_used = 2;
        quota.period_start = Utc::now() - Duration::days(40);
        quota.period_end = Utc::now() - Duration::days(10);
        db.upsert_quota(&quota).unwrap();

        // Touching the quota after period end resets counters.
        let rolled = tracker.get_or_create_quota(user_id).unwrap();
        assert_eq!(rolled.videos_used, 0);
        assert!(rolled.period_end > Utc::now());

        // And the check passes again.
        tracker.check(user_id, QuotaKind::Videos, 1.0).unwrap();
    }

    #[test]
    fn test_tier_limits_scale() {
        let (_db, tracker, _user) = setup(Tier::Free, false);
        let (videos_free, ..) = tracker.tier_limits(Tier::Free);
        let (videos_pro, ..) = tracker.tier_limits(Tier::Pro);
        let (videos_ent, ..) = tracker.tier_limits(Tier::Enterprise);
        assert!(videos_free < videos_pro);
        assert!(videos_pro < videos_ent);
    }

    #[test]
    fn test_message_tracking() {
        let (_db, tracker, user_id) = setup(Tier::Free, false);
        tracker.track_chat_message(user_id).unwrap();
        tracker.track_chat_message(user_id).unwrap();
        let quota = tracker.get_or_create_quota(user_id).unwrap();
        assert_eq!(quota.messages_used, 2);
    }
}
