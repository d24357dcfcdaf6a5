//! Explicit data-access layer over SQLite.
//!
//! All entities of the data model are persisted here through typed queries
//! returning value objects. There is no ORM and no global session; callers
//! hold a `Database` handle and every method is a complete transaction.

use crate::error::{Result, ViskaError};
use crate::models::{
    Chapter, ChunkRecord, Conversation, ConversationFact, FactCategory, Job, JobStatus,
    MessageRole, StoredMessage, Tier, Transcript, TranscriptSegment, User, UserQuota, Video,
    VideoStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    tier TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS videos (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    source_url TEXT NOT NULL,
    source_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    channel_name TEXT,
    duration_seconds INTEGER,
    view_count INTEGER,
    like_count INTEGER,
    chapters TEXT,
    status TEXT NOT NULL,
    progress_percent REAL NOT NULL DEFAULT 0,
    error_message TEXT,
    audio_file_path TEXT,
    audio_file_size_mb REAL,
    transcript_file_path TEXT,
    transcript_source TEXT,
    transcription_language TEXT,
    summary TEXT,
    key_topics TEXT NOT NULL DEFAULT '[]',
    chunk_count INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_videos_user_id ON videos(user_id);
CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status);

CREATE TABLE IF NOT EXISTS transcripts (
    video_id TEXT PRIMARY KEY,
    full_text TEXT NOT NULL,
    segments TEXT NOT NULL,
    language TEXT NOT NULL,
    word_count INTEGER NOT NULL,
    duration_seconds REAL NOT NULL,
    has_speaker_labels INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    start_timestamp REAL NOT NULL,
    end_timestamp REAL NOT NULL,
    speakers TEXT NOT NULL DEFAULT '[]',
    chapter_title TEXT,
    chapter_index INTEGER,
    title TEXT,
    summary TEXT,
    keywords TEXT NOT NULL DEFAULT '[]',
    embedding_text TEXT NOT NULL,
    is_indexed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(video_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_video_id ON chunks(video_id);
CREATE INDEX IF NOT EXISTS idx_chunks_user_id ON chunks(user_id);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    selected_video_ids TEXT NOT NULL DEFAULT '[]',
    message_count INTEGER NOT NULL DEFAULT 0,
    token_total INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_message_at TEXT
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tokens_in INTEGER,
    tokens_out INTEGER,
    model TEXT,
    provider TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);

CREATE TABLE IF NOT EXISTS conversation_facts (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    fact_key TEXT NOT NULL,
    fact_value TEXT NOT NULL,
    source_turn INTEGER NOT NULL,
    importance REAL NOT NULL DEFAULT 0.5,
    category TEXT NOT NULL DEFAULT 'topic',
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(conversation_id, fact_key)
);

CREATE INDEX IF NOT EXISTS idx_facts_conversation ON conversation_facts(conversation_id);

CREATE TABLE IF NOT EXISTS user_quotas (
    user_id TEXT PRIMARY KEY,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    videos_used INTEGER NOT NULL DEFAULT 0,
    videos_limit INTEGER NOT NULL,
    minutes_used REAL NOT NULL DEFAULT 0,
    minutes_limit REAL NOT NULL,
    messages_used INTEGER NOT NULL DEFAULT 0,
    messages_limit INTEGER NOT NULL,
    storage_mb_used REAL NOT NULL DEFAULT 0,
    storage_mb_limit REAL NOT NULL,
    embedding_tokens_used INTEGER NOT NULL DEFAULT 0,
    embedding_tokens_limit INTEGER
);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    progress_percent REAL NOT NULL DEFAULT 0,
    current_step TEXT,
    task_handle INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_video_id ON jobs(video_id);

CREATE TABLE IF NOT EXISTS insight_cache (
    cache_key TEXT NOT NULL,
    prompt_version INTEGER NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (cache_key, prompt_version)
);
"#;

/// SQLite-backed relational store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at the given path.
    #[instrument(skip_all)]
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Opened database at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ViskaError::Storage(format!("Failed to acquire database lock: {}", e)))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

fn from_json<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_time_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

// ============================================================================
// Users
// ============================================================================

impl Database {
    pub fn insert_user(&self, user: &User) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, email, tier, is_admin, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id.to_string(),
                user.email,
                user.tier.to_string(),
                user.is_admin as i32,
                user.is_active as i32,
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT id, email, tier, is_admin, is_active, created_at FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let id_str: String = row.get(0)?;
                let tier_str: String = row.get(2)?;
                let created: String = row.get(5)?;
                Ok(User {
                    id: Uuid::parse_str(&id_str).unwrap_or_default(),
                    email: row.get(1)?,
                    tier: tier_str.parse().unwrap_or(Tier::Free),
                    is_admin: row.get::<_, i32>(3)? != 0,
                    is_active: row.get::<_, i32>(4)? != 0,
                    created_at: parse_time(&created),
                })
            },
        );

        match result {
            Ok(u) => Ok(Some(u)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Videos
// ============================================================================

fn video_from_row(row: &Row<'_>) -> rusqlite::Result<Video> {
    let id_str: String = row.get(0)?;
    let user_str: String = row.get(1)?;
    let chapters_raw: Option<String> = row.get(10)?;
    let status_str: String = row.get(11)?;
    let key_topics_raw: Option<String> = row.get(19)?;
    let created: String = row.get(24)?;
    let updated: String = row.get(25)?;

    let chapters: Option<Vec<Chapter>> = chapters_raw.and_then(|s| serde_json::from_str(&s).ok());

    Ok(Video {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_str).unwrap_or_default(),
        source_url: row.get(2)?,
        source_id: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        channel_name: row.get(6)?,
        duration_seconds: row.get(7)?,
        view_count: row.get(8)?,
        like_count: row.get(9)?,
        chapters,
        status: status_str.parse().unwrap_or(VideoStatus::Pending),
        progress_percent: row.get(12)?,
        error_message: row.get(13)?,
        audio_file_path: row.get(14)?,
        audio_file_size_mb: row.get(15)?,
        transcript_file_path: row.get(16)?,
        transcript_source: row.get(17)?,
        transcription_language: row.get(18)?,
        summary: row.get(20)?,
        key_topics: from_json(key_topics_raw),
        chunk_count: row.get(21)?,
        is_deleted: row.get::<_, i32>(22)? != 0,
        deleted_at: parse_time_opt(row.get(23)?),
        created_at: parse_time(&created),
        updated_at: parse_time(&updated),
        completed_at: parse_time_opt(row.get(26)?),
    })
}

const VIDEO_COLUMNS: &str = "id, user_id, source_url, source_id, title, description, channel_name,
       duration_seconds, view_count, like_count, chapters, status, progress_percent,
       error_message, audio_file_path, audio_file_size_mb, transcript_file_path,
       transcript_source, transcription_language, key_topics, summary, chunk_count,
       is_deleted, deleted_at, created_at, updated_at, completed_at";

impl Database {
    pub fn insert_video(&self, video: &Video) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO videos
            (id, user_id, source_url, source_id, title, description, channel_name,
             duration_seconds, view_count, like_count, chapters, status, progress_percent,
             error_message, audio_file_path, audio_file_size_mb, transcript_file_path,
             transcript_source, transcription_language, summary, key_topics, chunk_count,
             is_deleted, deleted_at, created_at, updated_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)
            "#,
            params![
                video.id.to_string(),
                video.user_id.to_string(),
                video.source_url,
                video.source_id,
                video.title,
                video.description,
                video.channel_name,
                video.duration_seconds,
                video.view_count,
                video.like_count,
                video.chapters.as_ref().map(to_json),
                video.status.to_string(),
                video.progress_percent,
                video.error_message,
                video.audio_file_path,
                video.audio_file_size_mb,
                video.transcript_file_path,
                video.transcript_source,
                video.transcription_language,
                video.summary,
                to_json(&video.key_topics),
                video.chunk_count,
                video.is_deleted as i32,
                video.deleted_at.map(|t| t.to_rfc3339()),
                video.created_at.to_rfc3339(),
                video.updated_at.to_rfc3339(),
                video.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        debug!("Inserted video {}", video.id);
        Ok(())
    }

    pub fn get_video(&self, id: Uuid) -> Result<Option<Video>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM videos WHERE id = ?1", VIDEO_COLUMNS);
        let result = conn.query_row(&sql, params![id.to_string()], video_from_row);

        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Update status, progress, and optionally an error message.
    ///
    /// `updated_at` is always refreshed; `completed_at` is stamped when the
    /// video reaches the completed status.
    pub fn set_video_status(
        &self,
        id: Uuid,
        status: VideoStatus,
        progress: f64,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let completed_at = if status == VideoStatus::Completed {
            Some(now.clone())
        } else {
            None
        };

        if let Some(err) = error {
            conn.execute(
                "UPDATE videos SET status = ?2, progress_percent = ?3, error_message = ?4,
                 updated_at = ?5, completed_at = COALESCE(?6, completed_at) WHERE id = ?1",
                params![id.to_string(), status.to_string(), progress, err, now, completed_at],
            )?;
        } else {
            conn.execute(
                "UPDATE videos SET status = ?2, progress_percent = ?3,
                 updated_at = ?4, completed_at = COALESCE(?5, completed_at) WHERE id = ?1",
                params![id.to_string(), status.to_string(), progress, now, completed_at],
            )?;
        }
        Ok(())
    }

    /// Heartbeat update: refresh `updated_at` and optionally progress.
    pub fn touch_video(&self, id: Uuid, progress: Option<f64>) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        match progress {
            Some(p) => {
                conn.execute(
                    "UPDATE videos SET updated_at = ?2, progress_percent = ?3 WHERE id = ?1",
                    params![id.to_string(), now, p],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE videos SET updated_at = ?2 WHERE id = ?1",
                    params![id.to_string(), now],
                )?;
            }
        }
        Ok(())
    }

    pub fn set_video_metadata(
        &self,
        id: Uuid,
        title: &str,
        description: Option<&str>,
        channel_name: Option<&str>,
        duration_seconds: Option<u32>,
        chapters: Option<&Vec<Chapter>>,
        view_count: Option<u64>,
        like_count: Option<u64>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE videos SET title = ?2, description = ?3, channel_name = ?4,
             duration_seconds = ?5, chapters = ?6, view_count = ?7, like_count = ?8,
             updated_at = ?9 WHERE id = ?1",
            params![
                id.to_string(),
                title,
                description,
                channel_name,
                duration_seconds,
                chapters.map(to_json),
                view_count,
                like_count,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_video_audio(&self, id: Uuid, path: &str, size_mb: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE videos SET audio_file_path = ?2, audio_file_size_mb = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id.to_string(), path, size_mb, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_video_transcript_meta(
        &self,
        id: Uuid,
        source: &str,
        language: &str,
        transcript_path: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE videos SET transcript_source = ?2, transcription_language = ?3,
             transcript_file_path = COALESCE(?4, transcript_file_path), updated_at = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                source,
                language,
                transcript_path,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_video_summary(&self, id: Uuid, summary: &str, key_topics: &[String]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE videos SET summary = ?2, key_topics = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id.to_string(),
                summary,
                to_json(&key_topics.to_vec()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_video_chunk_count(&self, id: Uuid, count: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE videos SET chunk_count = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), count, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Null out file references after cleanup.
    pub fn clear_video_files(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE videos SET audio_file_path = NULL, audio_file_size_mb = NULL,
             transcript_file_path = NULL, chunk_count = 0, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn soft_delete_video(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE videos SET is_deleted = 1, deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), now],
        )?;
        Ok(())
    }

    /// Most recent non-deleted videos among a selection, capped.
    pub fn videos_by_ids(&self, user_id: Uuid, ids: &[Uuid], limit: usize) -> Result<Vec<Video>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {} FROM videos WHERE user_id = ? AND is_deleted = 0 AND id IN ({})
             ORDER BY created_at DESC LIMIT {}",
            VIDEO_COLUMNS, placeholders, limit
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<String> = vec![user_id.to_string()];
        values.extend(ids.iter().map(|id| id.to_string()));
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), video_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn list_user_videos(&self, user_id: Uuid) -> Result<Vec<Video>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM videos WHERE user_id = ?1 AND is_deleted = 0 ORDER BY created_at DESC",
            VIDEO_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id.to_string()], video_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Non-deleted videos stuck in early statuses since before the cutoff.
    pub fn stale_videos(&self, cutoff: DateTime<Utc>) -> Result<Vec<Video>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM videos
             WHERE status IN ('pending', 'downloading') AND created_at < ?1 AND is_deleted = 0",
            VIDEO_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], video_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Whether a video row exists at all (soft-deleted rows count).
    pub fn video_exists(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM videos WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

// ============================================================================
// Transcripts
// ============================================================================

impl Database {
    pub fn upsert_transcript(&self, transcript: &Transcript) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO transcripts
            (video_id, full_text, segments, language, word_count, duration_seconds, has_speaker_labels)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                transcript.video_id.to_string(),
                transcript.full_text,
                to_json(&transcript.segments),
                transcript.language,
                transcript.word_count as i64,
                transcript.duration_seconds,
                transcript.has_speaker_labels as i32,
            ],
        )?;
        debug!("Stored transcript for video {}", transcript.video_id);
        Ok(())
    }

    pub fn get_transcript(&self, video_id: Uuid) -> Result<Option<Transcript>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT full_text, segments, language, word_count, duration_seconds, has_speaker_labels
             FROM transcripts WHERE video_id = ?1",
            params![video_id.to_string()],
            |row| {
                let segments_raw: String = row.get(1)?;
                let segments: Vec<TranscriptSegment> =
                    serde_json::from_str(&segments_raw).unwrap_or_default();
                Ok(Transcript {
                    video_id,
                    full_text: row.get(0)?,
                    segments,
                    language: row.get(2)?,
                    word_count: row.get::<_, i64>(3)? as usize,
                    duration_seconds: row.get(4)?,
                    has_speaker_labels: row.get::<_, i32>(5)? != 0,
                })
            },
        );

        match result {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_transcript(&self, video_id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM transcripts WHERE video_id = ?1",
            params![video_id.to_string()],
        )?;
        Ok(deleted > 0)
    }
}

// ============================================================================
// Chunks
// ============================================================================

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let id_str: String = row.get(0)?;
    let video_str: String = row.get(1)?;
    let user_str: String = row.get(2)?;
    let speakers_raw: Option<String> = row.get(8)?;
    let keywords_raw: Option<String> = row.get(13)?;
    let created: String = row.get(16)?;

    Ok(ChunkRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        video_id: Uuid::parse_str(&video_str).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_str).unwrap_or_default(),
        chunk_index: row.get(3)?,
        text: row.get(4)?,
        token_count: row.get(5)?,
        start_timestamp: row.get(6)?,
        end_timestamp: row.get(7)?,
        speakers: from_json(speakers_raw),
        chapter_title: row.get(9)?,
        chapter_index: row.get(10)?,
        title: row.get(11)?,
        summary: row.get(12)?,
        keywords: from_json(keywords_raw),
        embedding_text: row.get(14)?,
        is_indexed: row.get::<_, i32>(15)? != 0,
        created_at: parse_time(&created),
    })
}

const CHUNK_COLUMNS: &str = "id, video_id, user_id, chunk_index, text, token_count,
       start_timestamp, end_timestamp, speakers, chapter_title, chapter_index,
       title, summary, keywords, embedding_text, is_indexed, created_at";

impl Database {
    #[instrument(skip(self, chunks))]
    pub fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<usize> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        for chunk in chunks {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO chunks
                (id, video_id, user_id, chunk_index, text, token_count, start_timestamp,
                 end_timestamp, speakers, chapter_title, chapter_index, title, summary,
                 keywords, embedding_text, is_indexed, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                "#,
                params![
                    chunk.id.to_string(),
                    chunk.video_id.to_string(),
                    chunk.user_id.to_string(),
                    chunk.chunk_index,
                    chunk.text,
                    chunk.token_count,
                    chunk.start_timestamp,
                    chunk.end_timestamp,
                    to_json(&chunk.speakers),
                    chunk.chapter_title,
                    chunk.chapter_index,
                    chunk.title,
                    chunk.summary,
                    to_json(&chunk.keywords),
                    chunk.embedding_text,
                    chunk.is_indexed as i32,
                    chunk.created_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        info!("Inserted {} chunks", chunks.len());
        Ok(chunks.len())
    }

    pub fn chunks_for_video(&self, video_id: Uuid, only_unindexed: bool) -> Result<Vec<ChunkRecord>> {
        let conn = self.conn()?;
        let sql = if only_unindexed {
            format!(
                "SELECT {} FROM chunks WHERE video_id = ?1 AND is_indexed = 0 ORDER BY chunk_index",
                CHUNK_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM chunks WHERE video_id = ?1 ORDER BY chunk_index",
                CHUNK_COLUMNS
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![video_id.to_string()], chunk_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// All chunks of a user across a set of videos, ordered by (video, index).
    pub fn chunks_for_videos(&self, user_id: Uuid, video_ids: &[Uuid]) -> Result<Vec<ChunkRecord>> {
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = video_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {} FROM chunks WHERE user_id = ? AND video_id IN ({})
             ORDER BY video_id, chunk_index",
            CHUNK_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<String> = vec![user_id.to_string()];
        values.extend(video_ids.iter().map(|id| id.to_string()));
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), chunk_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn mark_chunks_indexed(&self, video_id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE chunks SET is_indexed = 1 WHERE video_id = ?1",
            params![video_id.to_string()],
        )?;
        Ok(())
    }

    pub fn delete_chunks_for_video(&self, video_id: Uuid) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM chunks WHERE video_id = ?1",
            params![video_id.to_string()],
        )?;
        debug!("Deleted {} chunks for video {}", deleted, video_id);
        Ok(deleted)
    }

    /// Total bytes of chunk text columns for one video (text + summary +
    /// embedding_text), used by cleanup storage accounting.
    pub fn chunk_text_bytes(&self, video_id: Uuid) -> Result<u64> {
        let conn = self.conn()?;
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(text) + COALESCE(LENGTH(summary), 0)
                    + LENGTH(embedding_text)), 0)
             FROM chunks WHERE video_id = ?1",
            params![video_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(bytes.max(0) as u64)
    }

    pub fn chunk_text_bytes_for_user(&self, user_id: Uuid) -> Result<u64> {
        let conn = self.conn()?;
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(text) + COALESCE(LENGTH(summary), 0)
                    + LENGTH(embedding_text)), 0)
             FROM chunks WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(bytes.max(0) as u64)
    }

    pub fn indexed_chunk_count(&self, video_id: Uuid) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE video_id = ?1 AND is_indexed = 1",
            params![video_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn indexed_chunk_count_for_user(&self, user_id: Uuid) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE user_id = ?1 AND is_indexed = 1",
            params![user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Remove chunks whose video was soft-deleted (reconciliation drift source).
    pub fn delete_chunks_of_deleted_videos(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM chunks WHERE video_id IN (SELECT id FROM videos WHERE is_deleted = 1)",
            [],
        )?;
        Ok(deleted)
    }
}

// ============================================================================
// Conversations & messages
// ============================================================================

impl Database {
    pub fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conversations
             (id, user_id, title, selected_video_ids, message_count, token_total, created_at, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                conversation.id.to_string(),
                conversation.user_id.to_string(),
                conversation.title,
                to_json(&conversation.selected_video_ids),
                conversation.message_count,
                conversation.token_total as i64,
                conversation.created_at.to_rfc3339(),
                conversation.last_message_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT id, user_id, title, selected_video_ids, message_count, token_total,
                    created_at, last_message_at
             FROM conversations WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let id_str: String = row.get(0)?;
                let user_str: String = row.get(1)?;
                let videos_raw: Option<String> = row.get(3)?;
                let created: String = row.get(6)?;
                Ok(Conversation {
                    id: Uuid::parse_str(&id_str).unwrap_or_default(),
                    user_id: Uuid::parse_str(&user_str).unwrap_or_default(),
                    title: row.get(2)?,
                    selected_video_ids: from_json(videos_raw),
                    message_count: row.get(4)?,
                    token_total: row.get::<_, i64>(5)?.max(0) as u64,
                    created_at: parse_time(&created),
                    last_message_at: parse_time_opt(row.get(7)?),
                })
            },
        );

        match result {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn insert_message(&self, message: &StoredMessage) -> Result<()> {
        let conn = self.conn()?;
        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        conn.execute(
            "INSERT INTO messages
             (id, conversation_id, role, content, tokens_in, tokens_out, model, provider, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                role,
                message.content,
                message.tokens_in,
                message.tokens_out,
                message.model,
                message.provider,
                message.created_at.to_rfc3339(),
            ],
        )?;
        let total_tokens =
            message.tokens_in.unwrap_or(0) as i64 + message.tokens_out.unwrap_or(0) as i64;
        conn.execute(
            "UPDATE conversations SET message_count = message_count + 1,
             token_total = token_total + ?2, last_message_at = ?3 WHERE id = ?1",
            params![
                message.conversation_id.to_string(),
                total_tokens,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_messages(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, tokens_in, tokens_out, model, provider, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![conversation_id.to_string(), limit], |row| {
            let id_str: String = row.get(0)?;
            let conv_str: String = row.get(1)?;
            let role_str: String = row.get(2)?;
            let created: String = row.get(8)?;
            let role = match role_str.as_str() {
                "system" => MessageRole::System,
                "assistant" => MessageRole::Assistant,
                _ => MessageRole::User,
            };
            Ok(StoredMessage {
                id: Uuid::parse_str(&id_str).unwrap_or_default(),
                conversation_id: Uuid::parse_str(&conv_str).unwrap_or_default(),
                role,
                content: row.get(3)?,
                tokens_in: row.get(4)?,
                tokens_out: row.get(5)?,
                model: row.get(6)?,
                provider: row.get(7)?,
                created_at: parse_time(&created),
            })
        })?;

        let mut messages: Vec<StoredMessage> = rows.filter_map(|r| r.ok()).collect();
        messages.reverse(); // chronological order
        Ok(messages)
    }

    /// Conversation ids that carry facts and have been idle since the cutoff.
    pub fn idle_conversations_with_facts(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT c.id FROM conversations c
             JOIN conversation_facts f ON f.conversation_id = c.id
             WHERE c.last_message_at IS NOT NULL AND c.last_message_at < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], |row| {
            let id_str: String = row.get(0)?;
            Ok(Uuid::parse_str(&id_str).unwrap_or_default())
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

// ============================================================================
// Conversation facts
// ============================================================================

fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationFact> {
    let id_str: String = row.get(0)?;
    let conv_str: String = row.get(1)?;
    let user_str: String = row.get(2)?;
    let category_str: String = row.get(7)?;
    let created: String = row.get(10)?;

    Ok(ConversationFact {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        conversation_id: Uuid::parse_str(&conv_str).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_str).unwrap_or_default(),
        key: row.get(3)?,
        value: row.get(4)?,
        source_turn: row.get(5)?,
        importance: row.get(6)?,
        category: category_str.parse().unwrap_or(FactCategory::Topic),
        access_count: row.get(8)?,
        last_accessed: parse_time_opt(row.get(9)?),
        created_at: parse_time(&created),
    })
}

const FACT_COLUMNS: &str = "id, conversation_id, user_id, fact_key, fact_value, source_turn,
       importance, category, access_count, last_accessed, created_at";

impl Database {
    /// Insert a fact; silently ignored when the (conversation, key) pair exists.
    pub fn insert_fact(&self, fact: &ConversationFact) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO conversation_facts
            (id, conversation_id, user_id, fact_key, fact_value, source_turn,
             importance, category, access_count, last_accessed, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                fact.id.to_string(),
                fact.conversation_id.to_string(),
                fact.user_id.to_string(),
                fact.key,
                fact.value,
                fact.source_turn,
                fact.importance,
                fact.category.to_string(),
                fact.access_count,
                fact.last_accessed.map(|t| t.to_rfc3339()),
                fact.created_at.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn facts_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<ConversationFact>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM conversation_facts WHERE conversation_id = ?1 ORDER BY created_at",
            FACT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id.to_string()], fact_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn mark_facts_accessed(&self, fact_ids: &[Uuid]) -> Result<()> {
        if fact_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let placeholders = fact_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE conversation_facts SET last_accessed = ?, access_count = access_count + 1
             WHERE id IN ({})",
            placeholders
        );
        let mut values: Vec<String> = vec![now];
        values.extend(fact_ids.iter().map(|id| id.to_string()));
        conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(())
    }

    pub fn update_fact_importance(&self, fact_id: Uuid, importance: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE conversation_facts SET importance = ?2 WHERE id = ?1",
            params![fact_id.to_string(), importance],
        )?;
        Ok(())
    }

    /// Fold a merged duplicate's usage stats into the keeper.
    pub fn merge_fact_stats(
        &self,
        keeper_id: Uuid,
        access_count: u32,
        last_accessed: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE conversation_facts SET
                access_count = MAX(access_count, ?2),
                last_accessed = CASE
                    WHEN ?3 IS NULL THEN last_accessed
                    WHEN last_accessed IS NULL THEN ?3
                    ELSE MAX(last_accessed, ?3)
                END
             WHERE id = ?1",
            params![
                keeper_id.to_string(),
                access_count,
                last_accessed.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn delete_fact(&self, fact_id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM conversation_facts WHERE id = ?1",
            params![fact_id.to_string()],
        )?;
        Ok(())
    }
}

// ============================================================================
// Quotas
// ============================================================================

fn quota_from_row(row: &Row<'_>) -> rusqlite::Result<UserQuota> {
    let user_str: String = row.get(0)?;
    let start: String = row.get(1)?;
    let end: String = row.get(2)?;
    Ok(UserQuota {
        user_id: Uuid::parse_str(&user_str).unwrap_or_default(),
        period_start: parse_time(&start),
        period_end: parse_time(&end),
        videos_used: row.get(3)?,
        videos_limit: row.get(4)?,
        minutes_used: row.get(5)?,
        minutes_limit: row.get(6)?,
        messages_used: row.get(7)?,
        messages_limit: row.get(8)?,
        storage_mb_used: row.get(9)?,
        storage_mb_limit: row.get(10)?,
        embedding_tokens_used: row.get::<_, i64>(11)?.max(0) as u64,
        embedding_tokens_limit: row.get::<_, Option<i64>>(12)?.map(|v| v.max(0) as u64),
    })
}

const QUOTA_COLUMNS: &str = "user_id, period_start, period_end, videos_used, videos_limit,
       minutes_used, minutes_limit, messages_used, messages_limit,
       storage_mb_used, storage_mb_limit, embedding_tokens_used, embedding_tokens_limit";

impl Database {
    pub fn get_quota(&self, user_id: Uuid) -> Result<Option<UserQuota>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM user_quotas WHERE user_id = ?1",
            QUOTA_COLUMNS
        );
        let result = conn.query_row(&sql, params![user_id.to_string()], quota_from_row);
        match result {
            Ok(q) => Ok(Some(q)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn upsert_quota(&self, quota: &UserQuota) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO user_quotas
            (user_id, period_start, period_end, videos_used, videos_limit, minutes_used,
             minutes_limit, messages_used, messages_limit, storage_mb_used, storage_mb_limit,
             embedding_tokens_used, embedding_tokens_limit)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                quota.user_id.to_string(),
                quota.period_start.to_rfc3339(),
                quota.period_end.to_rfc3339(),
                quota.videos_used,
                quota.videos_limit,
                quota.minutes_used,
                quota.minutes_limit,
                quota.messages_used,
                quota.messages_limit,
                quota.storage_mb_used,
                quota.storage_mb_limit,
                quota.embedding_tokens_used as i64,
                quota.embedding_tokens_limit.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    pub fn all_quotas(&self) -> Result<Vec<UserQuota>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM user_quotas", QUOTA_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], quota_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

// ============================================================================
// Jobs
// ============================================================================

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let id_str: String = row.get(0)?;
    let video_str: String = row.get(1)?;
    let user_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let created: String = row.get(9)?;
    Ok(Job {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        video_id: Uuid::parse_str(&video_str).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_str).unwrap_or_default(),
        status: status_str.parse().unwrap_or(JobStatus::Queued),
        progress_percent: row.get(4)?,
        current_step: row.get(5)?,
        task_handle: row.get::<_, i64>(6)?.max(0) as u64,
        retry_count: row.get(7)?,
        error_message: row.get(8)?,
        created_at: parse_time(&created),
        started_at: parse_time_opt(row.get(10)?),
        completed_at: parse_time_opt(row.get(11)?),
    })
}

const JOB_COLUMNS: &str = "id, video_id, user_id, status, progress_percent, current_step,
       task_handle, retry_count, error_message, created_at, started_at, completed_at";

impl Database {
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO jobs
            (id, video_id, user_id, status, progress_percent, current_step, task_handle,
             retry_count, error_message, created_at, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                job.id.to_string(),
                job.video_id.to_string(),
                job.user_id.to_string(),
                job.status.to_string(),
                job.progress_percent,
                job.current_step,
                job.task_handle as i64,
                job.retry_count,
                job.error_message,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn latest_job_for_video(&self, video_id: Uuid) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM jobs WHERE video_id = ?1 ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        );
        let result = conn.query_row(&sql, params![video_id.to_string()], job_from_row);
        match result {
            Ok(j) => Ok(Some(j)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Update job status, progress, step, and error; stamps started/completed.
    pub fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: f64,
        current_step: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let started = if status == JobStatus::Running {
            Some(now.clone())
        } else {
            None
        };
        let completed = if matches!(
            status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        ) {
            Some(now.clone())
        } else {
            None
        };
        conn.execute(
            "UPDATE jobs SET status = ?2, progress_percent = ?3,
                current_step = COALESCE(?4, current_step),
                error_message = COALESCE(?5, error_message),
                started_at = COALESCE(started_at, ?6),
                completed_at = COALESCE(?7, completed_at)
             WHERE id = ?1",
            params![
                job_id.to_string(),
                status.to_string(),
                progress,
                current_step,
                error,
                started,
                completed,
            ],
        )?;
        Ok(())
    }

    pub fn set_job_handle(&self, job_id: Uuid, handle: u64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET task_handle = ?2 WHERE id = ?1",
            params![job_id.to_string(), handle as i64],
        )?;
        Ok(())
    }

    pub fn bump_job_retries(&self, job_id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET retry_count = retry_count + 1 WHERE id = ?1",
            params![job_id.to_string()],
        )?;
        Ok(())
    }
}

// ============================================================================
// Insight cache
// ============================================================================

impl Database {
    pub fn get_insight_cache(&self, cache_key: &str, prompt_version: u32) -> Result<Option<String>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT payload FROM insight_cache WHERE cache_key = ?1 AND prompt_version = ?2",
            params![cache_key, prompt_version],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(payload) => Ok(Some(payload)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_insight_cache(
        &self,
        cache_key: &str,
        prompt_version: u32,
        payload: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO insight_cache (cache_key, prompt_version, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![cache_key, prompt_version, payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(db: &Database) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", Uuid::new_v4()),
            tier: Tier::Free,
            is_admin: false,
            is_active: true,
            created_at: Utc::now(),
        };
        db.insert_user(&user).unwrap();
        user
    }

    #[test]
    fn test_video_round_trip() {
        let db = Database::in_memory().unwrap();
        let user = test_user(&db);

        let mut video = Video::new(user.id, "https://youtube.com/watch?v=abc123xyz00", "abc123xyz00", "Test");
        video.duration_seconds = Some(120);
        db.insert_video(&video).unwrap();

        let loaded = db.get_video(video.id).unwrap().unwrap();
        assert_eq!(loaded.source_id, "abc123xyz00");
        assert_eq!(loaded.status, VideoStatus::Pending);
        assert_eq!(loaded.duration_seconds, Some(120));

        db.set_video_status(video.id, VideoStatus::Completed, 100.0, None)
            .unwrap();
        let loaded = db.get_video(video.id).unwrap().unwrap();
        assert_eq!(loaded.status, VideoStatus::Completed);
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn test_chunk_storage_accounting() {
        let db = Database::in_memory().unwrap();
        let user = test_user(&db);
        let video = Video::new(user.id, "url", "vid", "Test");
        db.insert_video(&video).unwrap();

        let chunk = ChunkRecord {
            id: Uuid::new_v4(),
            video_id: video.id,
            user_id: user.id,
            chunk_index: 0,
            text: "abcd".to_string(),
            token_count: 20,
            start_timestamp: 0.0,
            end_timestamp: 10.0,
            speakers: vec![],
            chapter_title: None,
            chapter_index: None,
            title: None,
            summary: Some("ab".to_string()),
            keywords: vec![],
            embedding_text: "abcd".to_string(),
            is_indexed: true,
            created_at: Utc::now(),
        };
        db.insert_chunks(&[chunk]).unwrap();

        // text(4) + summary(2) + embedding_text(4)
        assert_eq!(db.chunk_text_bytes(video.id).unwrap(), 10);
        assert_eq!(db.indexed_chunk_count(video.id).unwrap(), 1);

        let deleted = db.delete_chunks_for_video(video.id).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.chunk_text_bytes(video.id).unwrap(), 0);
    }

    #[test]
    fn test_fact_unique_key_per_conversation() {
        let db = Database::in_memory().unwrap();
        let user = test_user(&db);
        let conv_id = Uuid::new_v4();

        let fact = ConversationFact {
            id: Uuid::new_v4(),
            conversation_id: conv_id,
            user_id: user.id,
            key: "instructor".to_string(),
            value: "Dr. Ng".to_string(),
            source_turn: 1,
            importance: 0.8,
            category: FactCategory::Identity,
            access_count: 0,
            last_accessed: None,
            created_at: Utc::now(),
        };
        assert!(db.insert_fact(&fact).unwrap());

        let dup = ConversationFact {
            id: Uuid::new_v4(),
            value: "Someone Else".to_string(),
            ..fact.clone()
        };
        assert!(!db.insert_fact(&dup).unwrap());

        let facts = db.facts_for_conversation(conv_id).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, "Dr. Ng");
    }

    #[test]
    fn test_soft_delete_chunk_purge() {
        let db = Database::in_memory().unwrap();
        let user = test_user(&db);
        let video = Video::new(user.id, "url", "vid", "Test");
        db.insert_video(&video).unwrap();

        let chunk = ChunkRecord {
            id: Uuid::new_v4(),
            video_id: video.id,
            user_id: user.id,
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
        db.insert_chunks(&[chunk]).unwrap();
        db.soft_delete_video(video.id).unwrap();

        let purged = db.delete_chunks_of_deleted_videos().unwrap();
        assert_eq!(purged, 1);
    }
}
