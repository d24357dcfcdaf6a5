//! Media ingestion: source metadata, captions, audio download, and
//! speech-to-text transcription.

pub mod audio;
pub mod captions;
pub mod media;
pub mod transcribe;

pub use captions::parse_vtt;
pub use media::{extract_video_id, CaptionData, DownloadEvent, MediaMetadata, MediaProbe};
pub use transcribe::{TranscribeEvent, Transcriber, TranscriptionResult};
