//! Media source access via yt-dlp: metadata, captions, and audio download.

use crate::config::{CaptionSettings, LimitSettings};
use crate::error::{Result, ViskaError};
use crate::ingest::captions::parse_vtt;
use crate::models::{Chapter, TranscriptSegment};
use crate::storage::BlobStore;
use chrono::NaiveDate;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Metadata extracted from the source platform without downloading.
#[derive(Debug, Clone)]
pub struct MediaMetadata {
    pub source_id: String,
    pub title: String,
    pub description: Option<String>,
    pub channel_name: Option<String>,
    pub duration_seconds: Option<u32>,
    pub chapters: Option<Vec<Chapter>>,
    pub upload_date: Option<NaiveDate>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub language: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// Captions extracted from the source, shaped like a transcription result.
#[derive(Debug, Clone)]
pub struct CaptionData {
    pub segments: Vec<TranscriptSegment>,
    pub full_text: String,
    pub language: String,
    pub word_count: usize,
    pub duration_seconds: f64,
}

/// Coarse progress events emitted during download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEvent {
    Started,
    Converting,
    Finished,
}

fn video_id_regexes() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        // Watch, short links, shorts, live, embeds, and legacy /v URLs.
        [
            r"(?:youtube\.com/(?:watch\?v=|shorts/|live/)|youtu\.be/)([^&\n?#/]+)",
            r"youtube\.com/embed/([^&\n?#/]+)",
            r"youtube\.com/v/([^&\n?#/]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid video id regex"))
        .collect()
    })
}

/// Extract the platform video id from a URL.
pub fn extract_video_id(url: &str) -> Result<String> {
    for regex in video_id_regexes() {
        if let Some(caps) = regex.captures(url) {
            if let Some(m) = caps.get(1) {
                return Ok(m.as_str().to_string());
            }
        }
    }
    Err(ViskaError::InvalidInput(format!(
        "Could not extract video ID from URL: {}",
        url
    )))
}

/// Normalize to the canonical watch URL.
fn normalize_url(url: &str) -> Result<String> {
    let id = extract_video_id(url)?;
    Ok(format!("https://www.youtube.com/watch?v={}", id))
}

/// yt-dlp-backed media probe.
pub struct MediaProbe {
    limits: LimitSettings,
    captions: CaptionSettings,
    http: reqwest::Client,
}

impl MediaProbe {
    pub fn new(limits: &LimitSettings, captions: &CaptionSettings) -> Self {
        Self {
            limits: limits.clone(),
            captions: captions.clone(),
            http: reqwest::Client::new(),
        }
    }

    async fn dump_json(&self, url: &str, extra_args: &[&str]) -> Result<serde_json::Value> {
        let mut cmd = tokio::process::Command::new("yt-dlp");
        cmd.args([
            "--dump-json",
            "--no-download",
            "--no-warnings",
            "--no-playlist",
        ]);
        cmd.args(extra_args);
        cmd.arg(url);

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ViskaError::ToolNotFound("yt-dlp".to_string())
            } else {
                ViskaError::MediaSource(format!("Failed to run yt-dlp: {}", e))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ViskaError::VideoUnavailable(format!(
                "Video not found or unavailable: {}",
                stderr
            )));
        }

        let json_str = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(&json_str)
            .map_err(|e| ViskaError::MediaSource(format!("Failed to parse yt-dlp output: {}", e)))
    }

    /// Fetch metadata for a video URL without downloading.
    #[instrument(skip(self))]
    pub async fn video_info(&self, url: &str) -> Result<MediaMetadata> {
        let normalized = normalize_url(url)?;
        let json = self.dump_json(&normalized, &[]).await?;
        Ok(Self::metadata_from_json(&json))
    }

    fn metadata_from_json(json: &serde_json::Value) -> MediaMetadata {
        let chapters = json["chapters"].as_array().map(|list| {
            list.iter()
                .enumerate()
                .map(|(i, c)| Chapter {
                    title: c["title"]
                        .as_str()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("Chapter {}", i + 1)),
                    start_time: c["start_time"].as_f64().unwrap_or(0.0),
                    end_time: c["end_time"].as_f64().unwrap_or(0.0),
                })
                .collect::<Vec<_>>()
        });

        let upload_date = json["upload_date"].as_str().and_then(|raw| {
            // yt-dlp returns dates as YYYYMMDD
            NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
        });

        MediaMetadata {
            source_id: json["id"].as_str().unwrap_or_default().to_string(),
            title: json["title"].as_str().unwrap_or("Unknown Title").to_string(),
            description: json["description"].as_str().map(|s| s.to_string()),
            channel_name: json["channel"]
                .as_str()
                .or_else(|| json["uploader"].as_str())
                .map(|s| s.to_string()),
            duration_seconds: json["duration"].as_f64().map(|d| d as u32),
            chapters,
            upload_date,
            view_count: json["view_count"].as_u64(),
            like_count: json["like_count"].as_u64(),
            language: json["language"].as_str().map(|s| s.to_string()),
            thumbnail_url: json["thumbnail"].as_str().map(|s| s.to_string()),
        }
    }

    /// Validate media before ingestion: availability and duration cap.
    pub fn validate(&self, metadata: &MediaMetadata) -> (bool, Option<String>) {
        if metadata.source_id.is_empty() {
            return (
                false,
                Some("Video is not available or URL is invalid.".to_string()),
            );
        }

        if let Some(duration) = metadata.duration_seconds {
            let max = self.limits.max_video_duration_seconds;
            if duration > max {
                return (
                    false,
                    Some(format!(
                        "Video is too long ({:.1} hours). Maximum duration is {:.1} hours.",
                        duration as f64 / 3600.0,
                        max as f64 / 3600.0
                    )),
                );
            }
        }

        (true, None)
    }

    /// Extract captions without downloading the media.
    ///
    /// Tries manual subtitles first, then auto-captions, for each preferred
    /// language in order. Returns None when no captions are available or the
    /// feature is disabled.
    #[instrument(skip(self))]
    pub async fn captions(&self, source_id: &str) -> Result<Option<CaptionData>> {
        if !self.captions.enabled {
            debug!("Caption extraction disabled, skipping for {}", source_id);
            return Ok(None);
        }

        let mut preferred: Vec<String> = vec![self.captions.preferred_language.clone()];
        for lang in ["en", "en-US", "en-GB"] {
            if !preferred.iter().any(|l| l == lang) {
                preferred.push(lang.to_string());
            }
        }

        let url = format!("https://www.youtube.com/watch?v={}", source_id);
        let json = match self.dump_json(&url, &[]).await {
            Ok(j) => j,
            Err(e) => {
                warn!("Caption probe failed for {}: {}", source_id, e);
                return Ok(None);
            }
        };

        let mut vtt_url: Option<String> = None;
        let mut detected_lang: Option<String> = None;

        // Manual subtitles are usually higher quality than auto-captions.
        for track_map in ["subtitles", "automatic_captions"] {
            if vtt_url.is_some() {
                break;
            }
            for lang in &preferred {
                if let Some(tracks) = json[track_map][lang.as_str()].as_array() {
                    for track in tracks {
                        if track["ext"] == "vtt" {
                            if let Some(u) = track["url"].as_str() {
                                vtt_url = Some(u.to_string());
                                detected_lang = Some(lang.clone());
                                break;
                            }
                        }
                    }
                }
                if vtt_url.is_some() {
                    break;
                }
            }
        }

        let Some(vtt_url) = vtt_url else {
            info!("No captions available for {}", source_id);
            return Ok(None);
        };

        if url::Url::parse(&vtt_url).is_err() {
            warn!("Caption track URL is malformed for {}", source_id);
            return Ok(None);
        }

        let vtt_content = match self.http.get(&vtt_url).send().await {
            Ok(r) if r.status().is_success() => r.text().await.unwrap_or_default(),
            Ok(r) => {
                warn!("Caption download returned {} for {}", r.status(), source_id);
                return Ok(None);
            }
            Err(e) => {
                warn!("Caption download failed for {}: {}", source_id, e);
                return Ok(None);
            }
        };

        let segments = parse_vtt(&vtt_content);
        if segments.is_empty() {
            warn!("Parsed VTT but got no segments for {}", source_id);
            return Ok(None);
        }

        let full_text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let word_count = full_text.split_whitespace().count();
        let duration_seconds = segments.iter().map(|s| s.end).fold(0.0, f64::max);

        info!(
            "Extracted {} caption segments, {} words for {}",
            segments.len(),
            word_count,
            source_id
        );

        Ok(Some(CaptionData {
            segments,
            full_text,
            language: detected_lang.unwrap_or_else(|| "en".to_string()),
            word_count,
            duration_seconds,
        }))
    }

    /// Download audio for a video, trying multiple client profiles and format
    /// fallbacks before giving up. The audio blob lands in storage; returns
    /// (storage_path, size_mb).
    #[instrument(skip(self, store, on_progress))]
    pub async fn download_audio(
        &self,
        url: &str,
        user_id: Uuid,
        video_id: Uuid,
        store: &BlobStore,
        on_progress: impl Fn(DownloadEvent),
    ) -> Result<(String, f64)> {
        let normalized = normalize_url(url)?;
        let temp_dir = tempfile::tempdir()?;
        let template = temp_dir.path().join("audio.%(ext)s");

        on_progress(DownloadEvent::Started);

        // Android often dodges rate/region blocks that 403 the web client.
        let client_candidates = ["android", "ios", "web"];
        let format_candidates = [
            "bestaudio[ext=m4a]/bestaudio[ext=webm]/bestaudio/best",
            "bestaudio/best",
        ];

        let mut errors: Vec<String> = Vec::new();
        let mut downloaded = false;

        'attempts: for client in client_candidates {
            for fmt in format_candidates {
                let result = tokio::process::Command::new("yt-dlp")
                    .arg("--extract-audio")
                    .arg("--audio-format").arg("mp3")
                    .arg("--audio-quality").arg("0")
                    .arg("--format").arg(fmt)
                    .arg("--extractor-args")
                    .arg(format!("youtube:player_client={}", client))
                    .arg("--output").arg(template.to_str().unwrap_or_default())
                    .arg("--no-playlist")
                    .arg("--retries").arg("3")
                    .arg("--quiet")
                    .arg("--no-warnings")
                    .arg(&normalized)
                    .output()
                    .await;

                match result {
                    Ok(output) if output.status.success() => {
                        downloaded = true;
                        break 'attempts;
                    }
                    Ok(output) => {
                        // Remove partial files before retrying another strategy
                        if let Ok(entries) = std::fs::read_dir(temp_dir.path()) {
                            for entry in entries.flatten() {
                                let _ = std::fs::remove_file(entry.path());
                            }
                        }
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        errors.push(format!("{}/{}: {}", client, fmt, stderr.trim()));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(ViskaError::ToolNotFound("yt-dlp".to_string()));
                    }
                    Err(e) => {
                        errors.push(format!("{}/{}: {}", client, fmt, e));
                    }
                }
            }
        }

        if !downloaded {
            let tail: Vec<&String> = errors.iter().rev().take(3).collect();
            return Err(ViskaError::AudioDownload(format!(
                "Failed to download audio after trying multiple strategies (last errors: {})",
                tail.iter().rev().map(|s| s.as_str()).collect::<Vec<_>>().join(" | ")
            )));
        }

        on_progress(DownloadEvent::Converting);

        // Locate the produced file
        let mut audio_file = None;
        for ext in ["mp3", "m4a", "webm", "opus"] {
            let candidate = temp_dir.path().join(format!("audio.{}", ext));
            if candidate.exists() {
                audio_file = Some(candidate);
                break;
            }
        }
        let audio_file = audio_file
            .ok_or_else(|| ViskaError::AudioDownload("Audio file not found after download".into()))?;

        let file_size_bytes = std::fs::metadata(&audio_file)?.len();
        let max_bytes = self.limits.max_video_file_size_mb * 1024 * 1024;
        if file_size_bytes > max_bytes {
            return Err(ViskaError::InvalidInput(format!(
                "Audio file too large ({:.1} MB). Maximum size is {} MB.",
                file_size_bytes as f64 / (1024.0 * 1024.0),
                self.limits.max_video_file_size_mb
            )));
        }

        let bytes = std::fs::read(&audio_file)?;
        let filename = audio_file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.mp3");
        let storage_path = store.put_audio(user_id, video_id, &bytes, filename)?;
        let file_size_mb = file_size_bytes as f64 / (1024.0 * 1024.0);

        on_progress(DownloadEvent::Finished);
        info!(
            "Downloaded audio for {} ({:.1} MB)",
            video_id, file_size_mb
        );

        Ok((storage_path, file_size_mb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_video_id_forms() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://youtube.com/embed/dQw4w9WgXcQ",
            "https://youtube.com/shorts/dQw4w9WgXcQ",
            "https://youtube.com/live/dQw4w9WgXcQ",
            "youtube.com/v/dQw4w9WgXcQ",
        ] {
            assert_eq!(extract_video_id(url).unwrap(), "dQw4w9WgXcQ", "url: {}", url);
        }

        assert!(extract_video_id("https://example.com/video").is_err());
        assert!(extract_video_id("").is_err());
    }

    #[test]
    fn test_validate_duration_cap() {
        let probe = MediaProbe::new(&LimitSettings::default(), &CaptionSettings::default());

        let mut metadata = MediaMetadata {
            source_id: "abc".to_string(),
            title: "t".to_string(),
            description: None,
            channel_name: None,
            duration_seconds: Some(120),
            chapters: None,
            upload_date: None,
            view_count: None,
            like_count: None,
            language: None,
            thumbnail_url: None,
        };

        let (ok, reason) = probe.validate(&metadata);
        assert!(ok, "{:?}", reason);

        metadata.duration_seconds = Some(20_000);
        let (ok, reason) = probe.validate(&metadata);
        assert!(!ok);
        assert!(reason.unwrap().contains("too long"));

        metadata.source_id = String::new();
        metadata.duration_seconds = Some(10);
        let (ok, _) = probe.validate(&metadata);
        assert!(!ok);
    }

    #[test]
    fn test_metadata_from_json() {
        let json = serde_json::json!({
            "id": "abc123",
            "title": "Learning Rust",
            "channel": "RustConf",
            "duration": 360.0,
            "upload_date": "20240115",
            "view_count": 1000,
            "chapters": [
                {"title": "Intro", "start_time": 0.0, "end_time": 60.0},
                {"start_time": 60.0, "end_time": 360.0},
            ],
        });

        let metadata = MediaProbe::metadata_from_json(&json);
        assert_eq!(metadata.source_id, "abc123");
        assert_eq!(metadata.duration_seconds, Some(360));
        assert_eq!(
            metadata.upload_date,
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        let chapters = metadata.chapters.unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Intro");
        assert_eq!(chapters[1].title, "Chapter 2");
    }
}
