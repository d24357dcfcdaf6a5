//! Viska - a multi-tenant RAG platform for video transcripts.
//!
//! The name comes from the Swedish word for "whisper."
//!
//! # Overview
//!
//! Viska ingests a video URL, produces a time-coded transcript (captions
//! when available, speech-to-text otherwise), splits it into semantic
//! chunks, enriches each chunk with a title/summary/keywords, stores text
//! and embeddings, and later answers questions by classifying query intent,
//! retrieving and reranking chunks, and calling an LLM with conversation
//! memory.
//!
//! # Architecture
//!
//! - `config` - Configuration management
//! - `models` - Core entity types
//! - `db` - Explicit data-access layer over SQLite
//! - `storage` - Blob storage for audio and transcripts
//! - `vector_store` - Vector index with MMR and video-guaranteed search
//! - `embedding` - Embedding generation (OpenAI or local lexical)
//! - `llm` - Routed chat completions with retries and streaming
//! - `rerank` - Cross-encoder reranking with identity degradation
//! - `ingest` - Media metadata, captions, audio download, transcription
//! - `pipeline` - The checkpointed, cancellable ingestion stage DAG
//! - `quota` - Per-user quotas and usage accounting
//! - `cleanup` - Periodic maintenance sweeps
//! - `query` - Intent classification and two-level retrieval
//! - `memory` - Conversation fact extraction, scoring, consolidation
//! - `insights` - Topic mind-map extraction
//! - `app` - Application assembly
//!
//! # Example
//!
//! ```rust,no_run
//! use viska::app::App;
//! use viska::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = App::new(Settings::load()?)?;
//!     let user = app.local_user()?;
//!
//!     let (video, _job) = app
//!         .submit_video(user.id, "https://youtu.be/dQw4w9WgXcQ")
//!         .await?;
//!     println!("Queued {}", video.id);
//!
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod insights;
pub mod llm;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod quota;
pub mod rerank;
pub mod storage;
pub mod vector_store;

pub use error::{Result, ViskaError};
