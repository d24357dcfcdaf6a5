//! Speech-to-text transcription via the Whisper API.
//!
//! Long audio files are split into API-sized segments with ffmpeg and the
//! resulting timestamps re-based onto the original timeline.

use crate::error::{Result, ViskaError};
use crate::ingest::audio::split_audio;
use crate::llm::create_openai_client;
use crate::models::TranscriptSegment;
use async_openai::types::{AudioResponseFormat, CreateTranscriptionRequestArgs};
use std::path::Path;
use tracing::{debug, info, instrument};

/// Result of transcribing one audio file.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub segments: Vec<TranscriptSegment>,
    pub full_text: String,
    pub language: String,
    pub word_count: usize,
    pub duration_seconds: f64,
}

/// Progress events emitted during transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscribeEvent {
    /// Working on segment `current` of `total`.
    Transcribing { current: usize, total: usize },
    /// Post-processing the combined transcript.
    Processing,
}

/// Whisper-backed transcriber.
pub struct Transcriber {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
    /// Split threshold for long audio, in seconds.
    chunk_duration_seconds: u32,
}

impl Transcriber {
    pub fn new() -> Self {
        Self::with_config("whisper-1", 600)
    }

    pub fn with_config(model: &str, chunk_duration_seconds: u32) -> Self {
        Self {
            client: create_openai_client(),
            model: model.to_string(),
            chunk_duration_seconds,
        }
    }

    /// Transcribe an audio file, splitting it when it exceeds the chunk
    /// duration. Emits progress events per segment.
    #[instrument(skip(self, on_progress), fields(audio = %audio_path.display()))]
    pub async fn transcribe(
        &self,
        audio_path: &Path,
        on_progress: impl Fn(TranscribeEvent),
    ) -> Result<TranscriptionResult> {
        let temp_dir = tempfile::tempdir()?;
        let pieces = split_audio(audio_path, temp_dir.path(), self.chunk_duration_seconds).await?;
        let total = pieces.len();

        info!("Transcribing {} audio segment(s) with {}", total, self.model);

        let mut all_segments: Vec<TranscriptSegment> = Vec::new();
        let mut language: Option<String> = None;

        for (i, (piece_path, offset)) in pieces.iter().enumerate() {
            on_progress(TranscribeEvent::Transcribing {
                current: i + 1,
                total,
            });

            let (mut segments, piece_language) = self.transcribe_single(piece_path).await?;
            for segment in &mut segments {
                segment.start += offset;
                segment.end += offset;
            }
            all_segments.extend(segments);

            if language.is_none() {
                language = piece_language;
            }
        }

        on_progress(TranscribeEvent::Processing);

        all_segments.sort_by(|a, b| {
            a.start
                .partial_cmp(&b.start)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let full_text = all_segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let word_count = full_text.split_whitespace().count();
        let duration_seconds = all_segments.iter().map(|s| s.end).fold(0.0, f64::max);

        debug!(
            "Transcribed {} segments, {} words",
            all_segments.len(),
            word_count
        );

        Ok(TranscriptionResult {
            segments: all_segments,
            full_text,
            language: language.unwrap_or_else(|| "en".to_string()),
            word_count,
            duration_seconds,
        })
    }

    /// Transcribe a single (already short enough) audio file.
    async fn transcribe_single(
        &self,
        audio_path: &Path,
    ) -> Result<(Vec<TranscriptSegment>, Option<String>)> {
        let file_bytes = tokio::fs::read(audio_path).await?;

        let request = CreateTranscriptionRequestArgs::default()
            .file(async_openai::types::AudioInput::from_vec_u8(
                audio_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("audio.mp3")
                    .to_string(),
                file_bytes,
            ))
            .model(&self.model)
            .response_format(AudioResponseFormat::VerboseJson)
            .build()
            .map_err(|e| ViskaError::Transcription(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .audio()
            .transcribe_verbose_json(request)
            .await
            .map_err(|e| ViskaError::OpenAI(format!("Whisper API error: {}", e)))?;

        let language = if response.language.is_empty() {
            None
        } else {
            Some(response.language.clone())
        };

        let segments: Vec<TranscriptSegment> = response
            .segments
            .map(|segs| {
                segs.iter()
                    .map(|s| {
                        TranscriptSegment::new(
                            s.start as f64,
                            s.end as f64,
                            s.text.trim().to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_else(|| {
                // Fallback: single segment from the full text
                vec![TranscriptSegment::new(
                    0.0,
                    response.duration as f64,
                    response.text.trim().to_string(),
                )]
            });

        Ok((segments, language))
    }
}

impl Default for Transcriber {
    fn default() -> Self {
        Self::new()
    }
}
