//! Configuration module for Viska.
//!
//! Handles loading and managing application settings.

mod settings;

pub use settings::{
    CaptionSettings, ChunkingSettings, EmbeddingProviderKind, EmbeddingSettings,
    EnrichmentSettings, GeneralSettings, LimitSettings, LlmProviderKind, LlmSettings,
    QuotaSettings, RerankingSettings, RetrievalSettings, Settings,
};
