//! Local filesystem blob storage.
//!
//! Layout:
//! ```text
//! <root>/audio/<user_id>/<video_id>/audio.<ext>
//! <root>/transcripts/<user_id>/<video_id>/transcript.json
//! ```

use crate::error::{Result, ViskaError};
use crate::models::Transcript;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use uuid::Uuid;

const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "m4a", "wav", "webm", "opus"];

/// Local filesystem store.
pub struct LocalBlobStore {
    audio_root: PathBuf,
    transcript_root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: &Path) -> Result<Self> {
        let audio_root = root.join("audio");
        let transcript_root = root.join("transcripts");
        std::fs::create_dir_all(&audio_root)?;
        std::fs::create_dir_all(&transcript_root)?;
        Ok(Self {
            audio_root,
            transcript_root,
        })
    }

    fn audio_dir(&self, user_id: Uuid, video_id: Uuid) -> PathBuf {
        self.audio_root
            .join(user_id.to_string())
            .join(video_id.to_string())
    }

    fn transcript_dir(&self, user_id: Uuid, video_id: Uuid) -> PathBuf {
        self.transcript_root
            .join(user_id.to_string())
            .join(video_id.to_string())
    }

    #[instrument(skip(self, bytes))]
    pub fn put_audio(
        &self,
        user_id: Uuid,
        video_id: Uuid,
        bytes: &[u8],
        filename: &str,
    ) -> Result<String> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp3");
        let dir = self.audio_dir(user_id, video_id);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("audio.{}", ext));
        std::fs::write(&path, bytes)?;
        debug!("Stored {} audio bytes at {:?}", bytes.len(), path);
        Ok(path.to_string_lossy().to_string())
    }

    pub fn audio_path(&self, user_id: Uuid, video_id: Uuid) -> Option<PathBuf> {
        let dir = self.audio_dir(user_id, video_id);
        for ext in AUDIO_EXTENSIONS {
            let candidate = dir.join(format!("audio.{}", ext));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    pub fn delete_audio(&self, user_id: Uuid, video_id: Uuid) -> Result<bool> {
        let dir = self.audio_dir(user_id, video_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn put_transcript(
        &self,
        user_id: Uuid,
        video_id: Uuid,
        transcript: &Transcript,
    ) -> Result<String> {
        let dir = self.transcript_dir(user_id, video_id);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join("transcript.json");
        let json = serde_json::to_string_pretty(transcript)
            .map_err(|e| ViskaError::Storage(format!("Failed to serialize transcript: {}", e)))?;
        std::fs::write(&path, json)?;
        Ok(path.to_string_lossy().to_string())
    }

    pub fn get_transcript(&self, user_id: Uuid, video_id: Uuid) -> Result<Option<Transcript>> {
        let path = self.transcript_dir(user_id, video_id).join("transcript.json");
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let transcript = serde_json::from_str(&content)
            .map_err(|e| ViskaError::Storage(format!("Failed to parse transcript: {}", e)))?;
        Ok(Some(transcript))
    }

    pub fn delete_transcript(&self, user_id: Uuid, video_id: Uuid) -> Result<bool> {
        let dir = self.transcript_dir(user_id, video_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn usage_mb(&self, user_id: Uuid) -> Result<f64> {
        let mut total_bytes = 0u64;
        for root in [&self.audio_root, &self.transcript_root] {
            let user_dir = root.join(user_id.to_string());
            if user_dir.exists() {
                total_bytes += dir_size(&user_dir)?;
            }
        }
        Ok(total_bytes as f64 / (1024.0 * 1024.0))
    }

    pub fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    /// Enumerate (user, video, dir) triples under one of the roots.
    /// Entries whose names are not UUIDs are skipped.
    pub fn video_dirs(&self, audio: bool) -> Result<Vec<(Uuid, Uuid, PathBuf)>> {
        let root = if audio {
            &self.audio_root
        } else {
            &self.transcript_root
        };

        let mut dirs = Vec::new();
        if !root.exists() {
            return Ok(dirs);
        }

        for user_entry in std::fs::read_dir(root)?.flatten() {
            if !user_entry.path().is_dir() {
                continue;
            }
            let Ok(user_id) = Uuid::parse_str(&user_entry.file_name().to_string_lossy()) else {
                continue;
            };
            for video_entry in std::fs::read_dir(user_entry.path())?.flatten() {
                if !video_entry.path().is_dir() {
                    continue;
                }
                let Ok(video_id) = Uuid::parse_str(&video_entry.file_name().to_string_lossy())
                else {
                    continue;
                };
                dirs.push((user_id, video_id, video_entry.path()));
            }
        }
        Ok(dirs)
    }
}

/// Recursive directory size in bytes.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)?.flatten() {
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TranscriptSegment;

    #[test]
    fn test_audio_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path()).unwrap();
        let user = Uuid::new_v4();
        let video = Uuid::new_v4();

        let path = store.put_audio(user, video, b"fake-mp3", "clip.mp3").unwrap();
        assert!(store.exists(&path));
        assert_eq!(store.audio_path(user, video).unwrap().to_string_lossy(), path);

        assert!(store.delete_audio(user, video).unwrap());
        assert!(!store.exists(&path));
        // Idempotent on missing data
        assert!(!store.delete_audio(user, video).unwrap());
    }

    #[test]
    fn test_transcript_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path()).unwrap();
        let user = Uuid::new_v4();
        let video = Uuid::new_v4();

        let transcript = Transcript::from_segments(
            video,
            vec![TranscriptSegment::new(0.0, 2.0, "Hello there".to_string())],
            "en",
        );
        store.put_transcript(user, video, &transcript).unwrap();

        let loaded = store.get_transcript(user, video).unwrap().unwrap();
        assert_eq!(loaded.full_text, "Hello there");
        assert_eq!(loaded.language, "en");

        assert!(store.delete_transcript(user, video).unwrap());
        assert!(store.get_transcript(user, video).unwrap().is_none());
    }

    #[test]
    fn test_usage_walks_both_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path()).unwrap();
        let user = Uuid::new_v4();
        let video = Uuid::new_v4();

        store.put_audio(user, video, &[0u8; 1024], "a.mp3").unwrap();
        let transcript = Transcript::from_segments(
            video,
            vec![TranscriptSegment::new(0.0, 1.0, "x".to_string())],
            "en",
        );
        store.put_transcript(user, video, &transcript).unwrap();

        let usage = store.usage_mb(user).unwrap();
        assert!(usage > 0.0);

        // Another user sees nothing
        assert_eq!(store.usage_mb(Uuid::new_v4()).unwrap(), 0.0);
    }

    #[test]
    fn test_video_dirs_enumeration() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path()).unwrap();
        let user = Uuid::new_v4();
        let video = Uuid::new_v4();
        store.put_audio(user, video, b"x", "a.mp3").unwrap();

        let dirs = store.video_dirs(true).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].0, user);
        assert_eq!(dirs[0].1, video);
        assert!(store.video_dirs(false).unwrap().is_empty());
    }
}
