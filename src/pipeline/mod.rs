//! The ingestion pipeline: a checkpointed, cancellable stage DAG per video.
//!
//! ```text
//! [URL, user]
//!    S1  Transcribe: captions fast path, else download + speech-to-text
//!    S2  Chunk + enrich
//!    S3  Embed + index
//! ```
//!
//! Before every stage the video row is re-read; a canceled status raises
//! `Canceled`, which the top level converts to a canceled (not failed) job.
//! Long stages run a heartbeat that refreshes the row and animates progress.

pub mod cancel;
pub mod chunker;
pub mod enrich;

use crate::config::Settings;
use crate::db::Database;
use crate::embedding::EmbeddingClient;
use crate::error::{Result, ViskaError};
use crate::ingest::{DownloadEvent, MediaProbe, TranscribeEvent, Transcriber};
use crate::llm::LlmClient;
use crate::models::{ChunkRecord, JobStatus, Transcript, Video, VideoStatus};
use crate::quota::{QuotaKind, UsageTracker};
use crate::storage::BlobStore;
use crate::vector_store::{IndexedPoint, PointPayload, VectorIndex};
use chunker::Chunker;
use chrono::Utc;
use enrich::Enricher;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Heartbeat tick interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Heartbeat must join within this after a stage ends.
const HEARTBEAT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Simulated progress ceiling during long stages.
const HEARTBEAT_PROGRESS_CAP: f64 = 85.0;

/// Stage retry backoffs in seconds.
const DOWNLOAD_BACKOFFS: [u64; 2] = [60, 60];
const TRANSCRIBE_BACKOFFS: [u64; 2] = [120, 120];
const STAGE_BACKOFFS: [u64; 2] = [60, 60];

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { chunk_count: usize, indexed: usize },
    Canceled,
}

/// Handle to a running heartbeat task.
struct Heartbeat {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn a heartbeat for a video in a long-running stage.
    ///
    /// Every 30s it refreshes `updated_at` and writes a simulated progress of
    /// `min(85, 10 + elapsed/eta * 75)` so clients can detect liveness.
    fn spawn(db: Arc<Database>, video_id: Uuid, duration_seconds: Option<u32>) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        // Transcription runs at roughly 2x media duration on CPU.
        let eta_seconds = (duration_seconds.unwrap_or(3600) as f64) * 2.0;
        let started = std::time::Instant::now();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                    _ = stopped.changed() => {
                        if *stopped.borrow() {
                            break;
                        }
                    }
                }
                if *stopped.borrow() {
                    break;
                }

                let elapsed = started.elapsed().as_secs_f64();
                let simulated =
                    (10.0 + elapsed / eta_seconds * 75.0).min(HEARTBEAT_PROGRESS_CAP);

                match db.get_video(video_id) {
                    Ok(Some(video)) if video.status == VideoStatus::Transcribing => {
                        if let Err(e) = db.touch_video(video_id, Some(simulated)) {
                            warn!("Heartbeat update failed for {}: {}", video_id, e);
                        } else {
                            debug!("Heartbeat video={} progress={:.1}%", video_id, simulated);
                        }
                    }
                    _ => {}
                }
            }
        });

        Self { stop, handle }
    }

    /// Stop the heartbeat; the worker joins within 5 seconds.
    async fn stop(self) {
        let _ = self.stop.send(true);
        if tokio::time::timeout(HEARTBEAT_JOIN_TIMEOUT, self.handle)
            .await
            .is_err()
        {
            warn!("Heartbeat task did not join within 5s");
        }
    }
}

/// Run an operation with stage-level retries.
///
/// Only transient errors retry; cancellation, quota, and input errors
/// propagate immediately. Each retry bumps the job's retry counter.
async fn with_retries<T, F, Fut>(
    db: &Database,
    job_id: Uuid,
    backoffs: &[u64],
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = backoffs.len() + 1;
    let mut last_err = None;

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let backoff = backoffs[attempt];
                warn!(
                    "Stage attempt {} failed ({}), retrying in {}s",
                    attempt + 1,
                    e,
                    backoff
                );
                let _ = db.bump_job_retries(job_id);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| ViskaError::ToolFailed("stage retries exhausted".into())))
}

/// The per-video pipeline with its injected collaborators.
pub struct Pipeline {
    pub db: Arc<Database>,
    pub store: Arc<BlobStore>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<EmbeddingClient>,
    pub llm: Arc<LlmClient>,
    pub tracker: Arc<UsageTracker>,
    pub probe: MediaProbe,
    pub transcriber: Transcriber,
    pub settings: Settings,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        store: Arc<BlobStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<EmbeddingClient>,
        llm: Arc<LlmClient>,
        tracker: Arc<UsageTracker>,
        settings: Settings,
    ) -> Self {
        let probe = MediaProbe::new(&settings.limits, &settings.captions);
        let transcriber = Transcriber::new();
        Self {
            db,
            store,
            index,
            embedder,
            llm,
            tracker,
            probe,
            transcriber,
            settings,
        }
    }

    /// Re-read the video at a checkpoint; raise `Canceled` when flagged.
    fn checkpoint(&self, video_id: Uuid, step: &str) -> Result<Video> {
        let video = self
            .db
            .get_video(video_id)?
            .ok_or(ViskaError::Canceled)?; // a vanished row means someone deleted it
        if video.status == VideoStatus::Canceled {
            info!("Canceled at checkpoint: {} video={}", step, video_id);
            return Err(ViskaError::Canceled);
        }
        Ok(video)
    }

    /// Run the full pipeline for a video. Errors are converted to status
    /// transitions here; callers receive the outcome.
    #[instrument(skip(self), fields(video_id = %video_id))]
    pub async fn run(&self, video_id: Uuid, job_id: Uuid) -> Result<PipelineOutcome> {
        self.db
            .update_job_status(job_id, JobStatus::Running, 0.0, Some("Starting pipeline"), None)?;

        match self.run_stages(video_id, job_id).await {
            Ok(outcome) => {
                self.db.update_job_status(
                    job_id,
                    JobStatus::Completed,
                    100.0,
                    Some("Pipeline completed"),
                    None,
                )?;
                Ok(outcome)
            }
            Err(ViskaError::Canceled) => {
                self.db.update_job_status(
                    job_id,
                    JobStatus::Canceled,
                    0.0,
                    Some("Processing canceled"),
                    None,
                )?;
                Ok(PipelineOutcome::Canceled)
            }
            Err(e) => {
                let message = e.to_string();
                self.db.update_job_status(
                    job_id,
                    JobStatus::Failed,
                    0.0,
                    None,
                    Some(&message),
                )?;
                let _ = self
                    .db
                    .set_video_status(video_id, VideoStatus::Failed, 0.0, Some(&message));
                Err(e)
            }
        }
    }

    async fn run_stages(&self, video_id: Uuid, job_id: Uuid) -> Result<PipelineOutcome> {
        let video = self.checkpoint(video_id, "before_transcription")?;

        // S1: transcribe (captions fast path, else download + STT)
        self.db
            .update_job_status(job_id, JobStatus::Running, 5.0, Some("Checking for captions"), None)?;
        self.db
            .set_video_status(video_id, VideoStatus::Pending, 5.0, None)?;

        let caption_data = self.probe.captions(&video.source_id).await?;

        if let Some(captions) = caption_data {
            info!("Using captions for video={} (fast path)", video_id);
            self.db.update_job_status(
                job_id,
                JobStatus::Running,
                10.0,
                Some("Processing captions"),
                None,
            )?;
            self.db
                .set_video_status(video_id, VideoStatus::Transcribing, 10.0, None)?;
            self.transcript_from_captions(&video, captions).await?;
        } else {
            info!("No captions for video={}, falling back to speech-to-text", video_id);

            // S1a: download audio
            self.db.update_job_status(
                job_id,
                JobStatus::Running,
                10.0,
                Some("Downloading audio"),
                None,
            )?;
            let (audio_path, audio_mb) = with_retries(&self.db, job_id, &DOWNLOAD_BACKOFFS, || {
                self.download_stage(&video)
            })
            .await?;

            self.checkpoint(video_id, "after_download")?;

            // S1b: transcribe
            self.db.update_job_status(
                job_id,
                JobStatus::Running,
                30.0,
                Some("Transcribing audio"),
                None,
            )?;
            with_retries(&self.db, job_id, &TRANSCRIBE_BACKOFFS, || {
                self.transcribe_stage(&video, &audio_path, audio_mb)
            })
            .await?;
        }

        self.checkpoint(video_id, "after_transcription")?;

        // S2: chunk + enrich
        self.db.update_job_status(
            job_id,
            JobStatus::Running,
            60.0,
            Some("Chunking and enriching"),
            None,
        )?;
        let chunk_count = with_retries(&self.db, job_id, &STAGE_BACKOFFS, || {
            self.chunk_enrich_stage(video_id)
        })
        .await?;

        self.checkpoint(video_id, "after_chunk_enrich")?;

        // S3: embed + index
        self.db.update_job_status(
            job_id,
            JobStatus::Running,
            90.0,
            Some("Generating embeddings and indexing"),
            None,
        )?;
        let indexed = with_retries(&self.db, job_id, &STAGE_BACKOFFS, || {
            self.embed_index_stage(video_id)
        })
        .await?;

        Ok(PipelineOutcome::Completed {
            chunk_count,
            indexed,
        })
    }

    /// Caption fast path: build the transcript without download or STT.
    async fn transcript_from_captions(
        &self,
        video: &Video,
        captions: crate::ingest::CaptionData,
    ) -> Result<()> {
        self.db
            .set_video_status(video.id, VideoStatus::Transcribing, 50.0, None)?;

        let transcript = Transcript {
            video_id: video.id,
            full_text: captions.full_text,
            segments: captions.segments,
            language: captions.language.clone(),
            word_count: captions.word_count,
            duration_seconds: captions.duration_seconds,
            has_speaker_labels: false,
        };
        self.db.upsert_transcript(&transcript)?;

        let transcript_path = self
            .store
            .put_transcript(video.user_id, video.id, &transcript)?;
        // Language comes from the transcript builder, not source metadata.
        self.db.set_video_transcript_meta(
            video.id,
            "captions",
            &captions.language,
            Some(&transcript_path),
        )?;
        self.db
            .set_video_status(video.id, VideoStatus::Transcribing, 100.0, None)?;

        self.track_transcript_storage(video, &transcript_path);

        info!(
            "Caption transcript created for video={}, segments={}, words={}",
            video.id,
            transcript.segments.len(),
            transcript.word_count
        );
        Ok(())
    }

    /// S1a: download audio, then check and record storage usage.
    async fn download_stage(&self, video: &Video) -> Result<(String, f64)> {
        self.db
            .set_video_status(video.id, VideoStatus::Downloading, 10.0, None)?;

        let db = self.db.clone();
        let video_id = video.id;
        let (audio_path, audio_mb) = self
            .probe
            .download_audio(
                &video.source_url,
                video.user_id,
                video.id,
                &self.store,
                move |event| {
                    let progress = match event {
                        DownloadEvent::Started => 10.0,
                        DownloadEvent::Converting => 80.0,
                        DownloadEvent::Finished => 90.0,
                    };
                    let _ = db.set_video_status(video_id, VideoStatus::Downloading, progress, None);
                },
            )
            .await?;

        self.db.set_video_audio(video.id, &audio_path, audio_mb)?;
        self.db
            .set_video_status(video.id, VideoStatus::Downloading, 100.0, None)?;

        // Storage quota is checked once the size is known; a failure here is
        // fatal and the blob is removed again.
        if let Err(e) = self
            .tracker
            .check(video.user_id, QuotaKind::Storage, audio_mb)
        {
            let _ = self.store.delete_audio(video.user_id, video.id);
            return Err(e);
        }

        if let Err(e) = self.tracker.track_video_ingestion(
            video.user_id,
            video.id,
            video.duration_seconds.unwrap_or(0) as f64,
            audio_mb,
        ) {
            warn!("Failed to track ingestion for video={}: {}", video.id, e);
        }

        info!(
            "Download complete for video={}, size_mb={:.1}",
            video.id, audio_mb
        );
        Ok((audio_path, audio_mb))
    }

    /// S1b: speech-to-text with heartbeat, then persist the transcript.
    async fn transcribe_stage(&self, video: &Video, audio_path: &str, audio_mb: f64) -> Result<()> {
        self.db
            .set_video_status(video.id, VideoStatus::Transcribing, 10.0, None)?;

        let heartbeat = Heartbeat::spawn(self.db.clone(), video.id, video.duration_seconds);

        let db = self.db.clone();
        let video_id = video.id;
        let result = self
            .transcriber
            .transcribe(std::path::Path::new(audio_path), move |event| {
                if let TranscribeEvent::Processing = event {
                    let _ = db.set_video_status(video_id, VideoStatus::Transcribing, 80.0, None);
                }
            })
            .await;

        heartbeat.stop().await;
        let result = result?;

        let transcript = Transcript {
            video_id: video.id,
            full_text: result.full_text,
            segments: result.segments,
            language: result.language.clone(),
            word_count: result.word_count,
            duration_seconds: result.duration_seconds,
            has_speaker_labels: false,
        };
        let has_speakers = transcript.segments.iter().any(|s| s.speaker.is_some());
        let transcript = Transcript {
            has_speaker_labels: has_speakers,
            ..transcript
        };
        self.db.upsert_transcript(&transcript)?;

        let transcript_path = self
            .store
            .put_transcript(video.user_id, video.id, &transcript)?;
        self.db.set_video_transcript_meta(
            video.id,
            "whisper",
            &result.language,
            Some(&transcript_path),
        )?;
        self.db
            .set_video_status(video.id, VideoStatus::Transcribing, 100.0, None)?;

        self.track_transcript_storage(video, &transcript_path);

        // Audio is no longer needed once the transcript exists.
        if self.settings.limits.cleanup_audio_after_transcription {
            match self.store.delete_audio(video.user_id, video.id) {
                Ok(true) => {
                    if let Err(e) = self.tracker.track_storage_usage(
                        video.user_id,
                        -audio_mb,
                        "audio_cleaned",
                        Some(video.id),
                    ) {
                        warn!("Failed to credit audio cleanup for video={}: {}", video.id, e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Audio cleanup failed for video={}: {}", video.id, e),
            }
        }

        if let Err(e) = self.tracker.track_transcription(
            video.user_id,
            video.id,
            transcript.duration_seconds,
        ) {
            warn!("Failed to track transcription for video={}: {}", video.id, e);
        }

        info!("Transcription complete for video={}", video.id);
        Ok(())
    }

    fn track_transcript_storage(&self, video: &Video, transcript_path: &str) {
        let size_mb = std::fs::metadata(transcript_path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);
        if size_mb > 0.0 {
            if let Err(e) = self.tracker.track_storage_usage(
                video.user_id,
                size_mb,
                "transcript_saved",
                Some(video.id),
            ) {
                warn!(
                    "Failed to track transcript storage for video={}: {}",
                    video.id, e
                );
            }
        }
    }

    /// S2: chunk the transcript and enrich every chunk.
    async fn chunk_enrich_stage(&self, video_id: Uuid) -> Result<usize> {
        self.db
            .set_video_status(video_id, VideoStatus::Chunking, 10.0, None)?;

        let video = self
            .db
            .get_video(video_id)?
            .ok_or_else(|| ViskaError::InvalidInput(format!("Video {} not found", video_id)))?;
        let transcript = self
            .db
            .get_transcript(video_id)?
            .ok_or_else(|| ViskaError::Chunking("No transcript to chunk".to_string()))?;

        let chunker = Chunker::new(&self.settings.chunking);
        let mut chunks = chunker.chunk_transcript(
            &transcript.segments,
            video.chapters.as_deref(),
        );

        // Short clips can fail to produce any regular chunk.
        if chunks.is_empty() {
            if let Some(single) = chunker.single_chunk(&transcript.segments) {
                chunks.push(single);
            }
        }
        chunker.validate(&chunks)?;

        self.db
            .set_video_status(video_id, VideoStatus::Chunking, 40.0, None)?;

        let mut enricher = Enricher::new(&self.llm, &self.settings.enrichment);
        enricher.set_video_context(&video.title, video.description.as_deref());

        let db = self.db.clone();
        let enrichments = enricher
            .enrich_chunks(&chunks, |done, total| {
                let progress = 40.0 + (done as f64 / total as f64) * 50.0;
                let _ = db.set_video_status(video_id, VideoStatus::Enriching, progress, None);
            })
            .await;

        let now = Utc::now();
        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(enrichments.iter())
            .map(|(chunk, enrichment)| ChunkRecord {
                id: Uuid::new_v4(),
                video_id,
                user_id: video.user_id,
                chunk_index: chunk.chunk_index,
                text: chunk.text.clone(),
                token_count: chunk.token_count,
                start_timestamp: chunk.start_timestamp,
                end_timestamp: chunk.end_timestamp,
                speakers: chunk.speakers.clone(),
                chapter_title: chunk.chapter_title.clone(),
                chapter_index: chunk.chapter_index,
                title: Some(enrichment.title.clone()),
                summary: Some(enrichment.summary.clone()),
                keywords: enrichment.keywords.clone(),
                embedding_text: enrichment.embedding_text(&chunk.text),
                is_indexed: false,
                created_at: now,
            })
            .collect();

        self.db.insert_chunks(&records)?;
        self.db.set_video_chunk_count(video_id, records.len() as u32)?;

        // Video-level summary and key topics feed COVERAGE retrieval.
        let (summary, key_topics) = summarize_video(&records);
        self.db.set_video_summary(video_id, &summary, &key_topics)?;

        self.db
            .set_video_status(video_id, VideoStatus::Chunking, 90.0, None)?;

        info!(
            "Chunk/enrich complete for video={}, chunks={}",
            video_id,
            records.len()
        );
        Ok(records.len())
    }

    /// S3: embed unindexed chunks and upsert them into the vector index.
    async fn embed_index_stage(&self, video_id: Uuid) -> Result<usize> {
        self.db
            .set_video_status(video_id, VideoStatus::Indexing, 10.0, None)?;

        let video = self
            .db
            .get_video(video_id)?
            .ok_or_else(|| ViskaError::InvalidInput(format!("Video {} not found", video_id)))?;
        let chunks = self.db.chunks_for_video(video_id, true)?;

        if chunks.is_empty() {
            self.db
                .set_video_status(video_id, VideoStatus::Completed, 100.0, None)?;
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.embedding_text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        self.db
            .set_video_status(video_id, VideoStatus::Indexing, 60.0, None)?;

        self.index.ensure_collection(self.embedder.dims()).await?;

        let points: Vec<IndexedPoint> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, vector)| {
                IndexedPoint::new(
                    vector,
                    PointPayload {
                        user_id: chunk.user_id,
                        video_id: chunk.video_id,
                        chunk_index: chunk.chunk_index,
                        text: chunk.text.clone(),
                        start_timestamp: chunk.start_timestamp,
                        end_timestamp: chunk.end_timestamp,
                        title: chunk.title.clone(),
                        summary: chunk.summary.clone(),
                        keywords: chunk.keywords.clone(),
                        chapter_title: chunk.chapter_title.clone(),
                        speakers: chunk.speakers.clone(),
                    },
                )
            })
            .collect();

        let indexed = self.index.upsert(&points).await?;
        self.db.mark_chunks_indexed(video_id)?;
        self.db
            .set_video_status(video_id, VideoStatus::Completed, 100.0, None)?;

        if let Err(e) = self
            .tracker
            .track_embedding_generation(video.user_id, indexed as u64)
        {
            warn!("Failed to track embedding event for video={}: {}", video_id, e);
        }

        info!("Embed/index complete for video={}, indexed={}", video_id, indexed);
        Ok(indexed)
    }
}

/// Compose a video-level summary and key-topic list from enriched chunks:
/// the leading chunk summaries joined up to ~600 characters, and the five
/// most frequent enrichment keywords.
fn summarize_video(records: &[ChunkRecord]) -> (String, Vec<String>) {
    let mut summary = String::new();
    for record in records {
        let Some(chunk_summary) = &record.summary else {
            continue;
        };
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(chunk_summary);
        if summary.chars().count() >= 600 {
            summary = summary.chars().take(600).collect();
            break;
        }
    }

    let mut freq: HashMap<String, u32> = HashMap::new();
    for record in records {
        for keyword in &record.keywords {
            let kw = keyword.trim().to_lowercase();
            if !kw.is_empty() {
                *freq.entry(kw).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(String, u32)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let key_topics: Vec<String> = ranked.into_iter().take(5).map(|(kw, _)| kw).collect();

    (summary, key_topics)
}

/// Bounded worker pool dispatching pipelines, with opaque revocation handles.
pub struct PipelineWorkers {
    semaphore: Arc<Semaphore>,
    handles: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_handle: AtomicU64,
}

impl PipelineWorkers {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Dispatch a pipeline run. Returns the opaque task handle recorded on
    /// the job for later revocation.
    pub fn dispatch(&self, pipeline: Arc<Pipeline>, video_id: Uuid, job_id: Uuid) -> u64 {
        let handle_id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let semaphore = self.semaphore.clone();

        let join = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            if let Err(e) = pipeline.run(video_id, job_id).await {
                warn!("Pipeline for video {} failed: {}", video_id, e);
            }
        });

        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(handle_id, join);
        }
        handle_id
    }

    /// Best-effort revocation of an in-flight task. Returns whether a revoke
    /// was actually issued.
    pub fn revoke(&self, handle_id: u64) -> bool {
        if handle_id == 0 {
            return false;
        }
        let Ok(mut handles) = self.handles.lock() else {
            return false;
        };
        match handles.remove(&handle_id) {
            Some(join) if !join.is_finished() => {
                join.abort();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_stops_within_timeout() {
        let db = Arc::new(Database::in_memory().unwrap());
        let heartbeat = Heartbeat::spawn(db, Uuid::new_v4(), Some(60));

        let started = std::time::Instant::now();
        heartbeat.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_on_permanent_errors() {
        let db = Database::in_memory().unwrap();
        let job_id = Uuid::new_v4();
        let mut calls = 0u32;

        let result: Result<()> = with_retries(&db, job_id, &[1, 1], || {
            calls += 1;
            async { Err(ViskaError::InvalidInput("bad".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1, "permanent errors must not retry");
    }

    #[tokio::test]
    async fn test_with_retries_succeeds_after_transient_failure() {
        let db = Database::in_memory().unwrap();
        let job_id = Uuid::new_v4();
        let calls = std::cell::Cell::new(0u32);

        let result: Result<u32> = with_retries(&db, job_id, &[0, 0], || {
            let n = calls.get() + 1;
            calls.set(n);
            async move {
                if n < 2 {
                    Err(ViskaError::AudioDownload("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_revoke_unknown_handle_is_noop() {
        let workers = PipelineWorkers::new(2);
        assert!(!workers.revoke(0));
        assert!(!workers.revoke(42));
    }

    #[test]
    fn test_summarize_video_from_chunks() {
        let records: Vec<ChunkRecord> = (0..3)
            .map(|i| ChunkRecord {
                id: Uuid::new_v4(),
                video_id: Uuid::nil(),
                user_id: Uuid::nil(),
                chunk_index: i,
                text: "body".to_string(),
                token_count: 10,
                start_timestamp: 0.0,
                end_timestamp: 10.0,
                speakers: vec![],
                chapter_title: None,
                chapter_index: None,
                title: None,
                summary: Some(format!("Part {} covers topic {}.", i, i)),
                keywords: vec!["learning".to_string(), format!("topic-{}", i)],
                embedding_text: "body".to_string(),
                is_indexed: false,
                created_at: Utc::now(),
            })
            .collect();

        let (summary, key_topics) = summarize_video(&records);
        assert!(summary.contains("Part 0"));
        assert!(summary.chars().count() <= 600);
        // The keyword shared by all chunks ranks first.
        assert_eq!(key_topics[0], "learning");
        assert!(key_topics.len() <= 5);
    }
}
