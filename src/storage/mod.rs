//! Blob storage facade for audio files and transcript JSON.
//!
//! Paths are opaque to callers; keys are (user, video) pairs. Backends are a
//! closed set of tagged variants so tests can construct the local one over a
//! temp dir.

mod local;

pub use local::{dir_size, LocalBlobStore};

use crate::error::Result;
use crate::models::Transcript;
use std::path::Path;
use uuid::Uuid;

/// Blob storage backend.
pub enum BlobStore {
    Local(LocalBlobStore),
}

impl BlobStore {
    /// Create a local-filesystem store rooted at `root`.
    pub fn local(root: &Path) -> Result<Self> {
        Ok(BlobStore::Local(LocalBlobStore::new(root)?))
    }

    /// Store audio bytes for a video, keeping the source extension.
    /// Returns the opaque storage path.
    pub fn put_audio(
        &self,
        user_id: Uuid,
        video_id: Uuid,
        bytes: &[u8],
        filename: &str,
    ) -> Result<String> {
        match self {
            BlobStore::Local(s) => s.put_audio(user_id, video_id, bytes, filename),
        }
    }

    /// Locate the stored audio file for a video, if present.
    pub fn audio_path(&self, user_id: Uuid, video_id: Uuid) -> Option<std::path::PathBuf> {
        match self {
            BlobStore::Local(s) => s.audio_path(user_id, video_id),
        }
    }

    /// Delete a video's audio directory. Idempotent; false when nothing existed.
    pub fn delete_audio(&self, user_id: Uuid, video_id: Uuid) -> Result<bool> {
        match self {
            BlobStore::Local(s) => s.delete_audio(user_id, video_id),
        }
    }

    /// Persist the transcript JSON for a video. Returns the opaque path.
    pub fn put_transcript(
        &self,
        user_id: Uuid,
        video_id: Uuid,
        transcript: &Transcript,
    ) -> Result<String> {
        match self {
            BlobStore::Local(s) => s.put_transcript(user_id, video_id, transcript),
        }
    }

    /// Load a stored transcript, if present.
    pub fn get_transcript(&self, user_id: Uuid, video_id: Uuid) -> Result<Option<Transcript>> {
        match self {
            BlobStore::Local(s) => s.get_transcript(user_id, video_id),
        }
    }

    /// Delete a video's transcript directory. Idempotent.
    pub fn delete_transcript(&self, user_id: Uuid, video_id: Uuid) -> Result<bool> {
        match self {
            BlobStore::Local(s) => s.delete_transcript(user_id, video_id),
        }
    }

    /// Total bytes used by a user across both audio and transcript roots, in MB.
    pub fn usage_mb(&self, user_id: Uuid) -> Result<f64> {
        match self {
            BlobStore::Local(s) => s.usage_mb(user_id),
        }
    }

    /// Whether a previously returned storage path still exists.
    pub fn exists(&self, path: &str) -> bool {
        match self {
            BlobStore::Local(s) => s.exists(path),
        }
    }

    /// Per-(user, video) directories under the audio root.
    pub fn audio_video_dirs(&self) -> Result<Vec<(Uuid, Uuid, std::path::PathBuf)>> {
        match self {
            BlobStore::Local(s) => s.video_dirs(true),
        }
    }

    /// Per-(user, video) directories under the transcript root.
    pub fn transcript_video_dirs(&self) -> Result<Vec<(Uuid, Uuid, std::path::PathBuf)>> {
        match self {
            BlobStore::Local(s) => s.video_dirs(false),
        }
    }
}
