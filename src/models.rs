//! Core entity types shared across the pipeline and query subsystems.
//!
//! These are plain value objects; all persistence goes through explicit
//! queries in the `db` module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription tier for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Starter,
    Pro,
    Business,
    Enterprise,
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "starter" => Ok(Tier::Starter),
            "pro" => Ok(Tier::Pro),
            "business" => Ok(Tier::Business),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(format!("Unknown tier: {}", s)),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Business => "business",
            Tier::Enterprise => "enterprise",
        };
        write!(f, "{}", s)
    }
}

/// A platform user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub tier: Tier,
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Processing status of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Downloading,
    Transcribing,
    Chunking,
    Enriching,
    Indexing,
    Completed,
    Failed,
    Canceled,
}

impl VideoStatus {
    /// Terminal statuses cannot transition further and cannot be canceled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VideoStatus::Completed | VideoStatus::Failed | VideoStatus::Canceled
        )
    }
}

impl std::str::FromStr for VideoStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VideoStatus::Pending),
            "downloading" => Ok(VideoStatus::Downloading),
            "transcribing" => Ok(VideoStatus::Transcribing),
            "chunking" => Ok(VideoStatus::Chunking),
            "enriching" => Ok(VideoStatus::Enriching),
            "indexing" => Ok(VideoStatus::Indexing),
            "completed" => Ok(VideoStatus::Completed),
            "failed" => Ok(VideoStatus::Failed),
            "canceled" => Ok(VideoStatus::Canceled),
            _ => Err(format!("Unknown video status: {}", s)),
        }
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Downloading => "downloading",
            VideoStatus::Transcribing => "transcribing",
            VideoStatus::Chunking => "chunking",
            VideoStatus::Enriching => "enriching",
            VideoStatus::Indexing => "indexing",
            VideoStatus::Completed => "completed",
            VideoStatus::Failed => "failed",
            VideoStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// A chapter marker from the source video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_time: f64,
    pub end_time: f64,
}

/// A video submitted for ingestion, exclusively owned by its user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source_url: String,
    /// External id on the source platform (e.g. the YouTube video id).
    pub source_id: String,
    pub title: String,
    pub description: Option<String>,
    pub channel_name: Option<String>,
    pub duration_seconds: Option<u32>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub chapters: Option<Vec<Chapter>>,
    pub status: VideoStatus,
    pub progress_percent: f64,
    pub error_message: Option<String>,
    pub audio_file_path: Option<String>,
    pub audio_file_size_mb: Option<f64>,
    pub transcript_file_path: Option<String>,
    /// "captions" or "whisper", recorded by the transcription stage.
    pub transcript_source: Option<String>,
    pub transcription_language: Option<String>,
    /// Video-level summary used by COVERAGE retrieval.
    pub summary: Option<String>,
    pub key_topics: Vec<String>,
    pub chunk_count: u32,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Video {
    /// Create a pending video for a freshly submitted URL.
    pub fn new(user_id: Uuid, source_url: &str, source_id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            source_url: source_url.to_string(),
            source_id: source_id.to_string(),
            title: title.to_string(),
            description: None,
            channel_name: None,
            duration_seconds: None,
            view_count: None,
            like_count: None,
            chapters: None,
            status: VideoStatus::Pending,
            progress_percent: 0.0,
            error_message: None,
            audio_file_path: None,
            audio_file_size_mb: None,
            transcript_file_path: None,
            transcript_source: None,
            transcription_language: None,
            summary: None,
            key_topics: Vec::new(),
            chunk_count: 0,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A single segment of a transcript with timestamp information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: String) -> Self {
        Self {
            start,
            end,
            text,
            speaker: None,
        }
    }
}

/// A complete transcript, 1:1 with its video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub video_id: Uuid,
    pub full_text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
    pub word_count: usize,
    pub duration_seconds: f64,
    pub has_speaker_labels: bool,
}

impl Transcript {
    /// Build a transcript from segments, deriving full text and stats.
    pub fn from_segments(video_id: Uuid, segments: Vec<TranscriptSegment>, language: &str) -> Self {
        let full_text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let word_count = full_text.split_whitespace().count();
        let duration_seconds = segments.iter().map(|s| s.end).fold(0.0, f64::max);
        let has_speaker_labels = segments.iter().any(|s| s.speaker.is_some());

        Self {
            video_id,
            full_text,
            segments,
            language: language.to_string(),
            word_count,
            duration_seconds,
            has_speaker_labels,
        }
    }
}

/// A persisted chunk row: a token- and time-bounded slice of a transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub video_id: Uuid,
    pub user_id: Uuid,
    pub chunk_index: u32,
    pub text: String,
    pub token_count: u32,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    pub speakers: Vec<String>,
    pub chapter_title: Option<String>,
    pub chapter_index: Option<u32>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub keywords: Vec<String>,
    pub embedding_text: String,
    pub is_indexed: bool,
    pub created_at: DateTime<Utc>,
}

impl ChunkRecord {
    /// Format the chunk span as `MM:SS - MM:SS` or `HH:MM:SS - HH:MM:SS`.
    pub fn timestamp_display(&self) -> String {
        format_time_range(self.start_timestamp, self.end_timestamp)
    }
}

/// Format a time span, including hours only when either side has them.
pub fn format_time_range(start: f64, end: f64) -> String {
    let (sh, sm, ss) = split_hms(start);
    let (eh, em, es) = split_hms(end);
    if sh > 0 || eh > 0 {
        format!(
            "{:02}:{:02}:{:02} - {:02}:{:02}:{:02}",
            sh, sm, ss, eh, em, es
        )
    } else {
        format!("{:02}:{:02} - {:02}:{:02}", sm, ss, em, es)
    }
}

fn split_hms(seconds: f64) -> (u32, u32, u32) {
    let total = seconds.max(0.0) as u32;
    (total / 3600, (total % 3600) / 60, total % 60)
}

/// A conversation between a user and the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub selected_video_ids: Vec<Uuid>,
    pub message_count: u32,
    pub token_total: u64,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A stored chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Category of a conversation fact, ordered by retention priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Identity,
    Topic,
    Preference,
    Session,
    Ephemeral,
}

impl FactCategory {
    /// Priority weight used by composite memory scoring.
    pub fn priority(&self) -> f64 {
        match self {
            FactCategory::Identity => 1.0,
            FactCategory::Topic => 0.75,
            FactCategory::Preference => 0.5,
            FactCategory::Session => 0.25,
            FactCategory::Ephemeral => 0.1,
        }
    }
}

impl std::str::FromStr for FactCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "identity" => Ok(FactCategory::Identity),
            "topic" => Ok(FactCategory::Topic),
            "preference" => Ok(FactCategory::Preference),
            "session" => Ok(FactCategory::Session),
            "ephemeral" => Ok(FactCategory::Ephemeral),
            _ => Err(format!("Unknown fact category: {}", s)),
        }
    }
}

impl std::fmt::Display for FactCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FactCategory::Identity => "identity",
            FactCategory::Topic => "topic",
            FactCategory::Preference => "preference",
            FactCategory::Session => "session",
            FactCategory::Ephemeral => "ephemeral",
        };
        write!(f, "{}", s)
    }
}

/// A key/value assertion extracted from a conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationFact {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub key: String,
    pub value: String,
    pub source_turn: u32,
    pub importance: f64,
    pub category: FactCategory,
    pub access_count: u32,
    pub last_accessed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Per-user rolling 30-day quota window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuota {
    pub user_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub videos_used: u32,
    pub videos_limit: u32,
    pub minutes_used: f64,
    pub minutes_limit: f64,
    pub messages_used: u32,
    pub messages_limit: u32,
    pub storage_mb_used: f64,
    pub storage_mb_limit: f64,
    pub embedding_tokens_used: u64,
    /// None means unlimited (local embeddings).
    pub embedding_tokens_limit: Option<u64>,
}

/// Status of a pipeline job, mirroring the video lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// A tracked pipeline job for a video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub video_id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub current_step: Option<String>,
    /// Opaque revocation handle into the worker pool. Zero means unassigned.
    pub task_handle: u64,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// How to treat the video record after cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOption {
    /// Set status to canceled, keep the video record.
    KeepVideo,
    /// Soft-delete the video and all related data.
    FullDelete,
}
