//! Configuration settings for Viska.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub chunking: ChunkingSettings,
    pub embedding: EmbeddingSettings,
    pub llm: LlmSettings,
    pub retrieval: RetrievalSettings,
    pub reranking: RerankingSettings,
    pub enrichment: EnrichmentSettings,
    pub captions: CaptionSettings,
    pub limits: LimitSettings,
    pub quota: QuotaSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for the relational database and caches.
    pub data_dir: String,
    /// Root directory for audio and transcript blobs.
    pub storage_dir: String,
    /// Directory for temporary files.
    pub temp_dir: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Maximum concurrently running pipelines.
    pub pipeline_workers: usize,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.viska".to_string(),
            storage_dir: "~/.viska/storage".to_string(),
            temp_dir: "/tmp/viska".to_string(),
            log_level: "info".to_string(),
            pipeline_workers: 2,
        }
    }
}

/// Transcript chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub target_tokens: u32,
    pub min_tokens: u32,
    pub max_tokens: u32,
    pub overlap_tokens: u32,
    /// Hard wall-clock cap per chunk.
    pub max_duration_seconds: u32,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            target_tokens: 256,
            min_tokens: 16,
            max_tokens: 800,
            overlap_tokens: 80,
            max_duration_seconds: 90,
        }
    }
}

/// Embedding backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Deterministic local lexical embedder (no API key required).
    #[default]
    Local,
    /// OpenAI embeddings API.
    OpenAI,
}

/// Embedding generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Local,
            model: "text-embedding-3-small".to_string(),
            dimensions: 384,
            batch_size: 32,
        }
    }
}

/// Default LLM provider when the model name does not imply one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    #[default]
    OpenAI,
    Anthropic,
    Ollama,
}

/// LLM client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProviderKind,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub ollama_base_url: String,
    pub anthropic_base_url: String,
    /// Per-call timeout in seconds for chat completions.
    pub timeout_seconds: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::OpenAI,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1500,
            temperature: 0.7,
            ollama_base_url: "http://localhost:11434".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            timeout_seconds: 300,
        }
    }
}

/// Retrieval tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Initial pool size for vector search.
    pub top_k: usize,
    pub min_relevance_score: f32,
    pub fallback_relevance_score: f32,
    pub weak_context_threshold: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 20,
            min_relevance_score: 0.50,
            fallback_relevance_score: 0.15,
            weak_context_threshold: 0.40,
        }
    }
}

/// Cross-encoder reranking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankingSettings {
    pub enabled: bool,
    pub top_k: usize,
    /// HTTP scoring endpoint of a cross-encoder server.
    pub endpoint: String,
}

impl Default for RerankingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            top_k: 7,
            endpoint: "http://localhost:8787/rerank".to_string(),
        }
    }
}

/// Contextual enrichment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    pub enabled: bool,
    pub batch_size: usize,
    pub max_retries: u32,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            max_retries: 3,
        }
    }
}

/// Caption extraction settings (the fast transcription path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionSettings {
    pub enabled: bool,
    pub preferred_language: String,
}

impl Default for CaptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            preferred_language: "en".to_string(),
        }
    }
}

/// Hard limits on ingestible media.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_video_duration_seconds: u32,
    pub max_video_file_size_mb: u64,
    /// Delete the audio blob once transcription succeeded, crediting storage.
    pub cleanup_audio_after_transcription: bool,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_video_duration_seconds: 14_400, // 4 hours
            max_video_file_size_mb: 2048,
            cleanup_audio_after_transcription: true,
        }
    }
}

/// Free-tier quota defaults; paid tiers are fixed in the quota module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub free_tier_video_limit: u32,
    pub free_tier_minutes_limit: f64,
    pub free_tier_messages_limit: u32,
    pub free_tier_storage_mb_limit: f64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            free_tier_video_limit: 10,
            free_tier_minutes_limit: 1000.0,
            free_tier_messages_limit: 50,
            free_tier_storage_mb_limit: 1000.0,
        }
    }
}

impl Settings {
    /// Load settings from the default configuration file, then environment.
    pub fn load() -> crate::error::Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or the default location if None.
    pub fn load_from(path: Option<&PathBuf>) -> crate::error::Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        let mut settings = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Settings::default()
        };

        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::ViskaError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("viska")
            .join("config.toml")
    }

    /// Override recognized options from `VISKA_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        fn env<T: std::str::FromStr>(key: &str, into: &mut T) {
            if let Ok(raw) = std::env::var(key) {
                if let Ok(parsed) = raw.parse() {
                    *into = parsed;
                }
            }
        }

        env("VISKA_CHUNK_TARGET_TOKENS", &mut self.chunking.target_tokens);
        env("VISKA_CHUNK_MIN_TOKENS", &mut self.chunking.min_tokens);
        env("VISKA_CHUNK_MAX_TOKENS", &mut self.chunking.max_tokens);
        env("VISKA_CHUNK_OVERLAP_TOKENS", &mut self.chunking.overlap_tokens);
        env(
            "VISKA_CHUNK_MAX_DURATION_SECONDS",
            &mut self.chunking.max_duration_seconds,
        );
        env("VISKA_EMBEDDING_MODEL", &mut self.embedding.model);
        env("VISKA_EMBEDDING_BATCH_SIZE", &mut self.embedding.batch_size);
        env("VISKA_LLM_MODEL", &mut self.llm.model);
        env("VISKA_LLM_MAX_TOKENS", &mut self.llm.max_tokens);
        env("VISKA_LLM_TEMPERATURE", &mut self.llm.temperature);
        env("VISKA_RETRIEVAL_TOP_K", &mut self.retrieval.top_k);
        env(
            "VISKA_MIN_RELEVANCE_SCORE",
            &mut self.retrieval.min_relevance_score,
        );
        env(
            "VISKA_FALLBACK_RELEVANCE_SCORE",
            &mut self.retrieval.fallback_relevance_score,
        );
        env(
            "VISKA_WEAK_CONTEXT_THRESHOLD",
            &mut self.retrieval.weak_context_threshold,
        );
        env("VISKA_ENABLE_RERANKING", &mut self.reranking.enabled);
        env("VISKA_RERANKING_TOP_K", &mut self.reranking.top_k);
        env(
            "VISKA_ENABLE_CONTEXTUAL_ENRICHMENT",
            &mut self.enrichment.enabled,
        );
        env("VISKA_ENRICHMENT_BATCH_SIZE", &mut self.enrichment.batch_size);
        env(
            "VISKA_ENRICHMENT_MAX_RETRIES",
            &mut self.enrichment.max_retries,
        );
        env("VISKA_ENABLE_CAPTION_EXTRACTION", &mut self.captions.enabled);
        env(
            "VISKA_CAPTION_PREFERRED_LANGUAGE",
            &mut self.captions.preferred_language,
        );
        env(
            "VISKA_MAX_VIDEO_DURATION_SECONDS",
            &mut self.limits.max_video_duration_seconds,
        );
        env(
            "VISKA_MAX_VIDEO_FILE_SIZE_MB",
            &mut self.limits.max_video_file_size_mb,
        );
        env(
            "VISKA_CLEANUP_AUDIO_AFTER_TRANSCRIPTION",
            &mut self.limits.cleanup_audio_after_transcription,
        );
        env(
            "VISKA_FREE_TIER_VIDEO_LIMIT",
            &mut self.quota.free_tier_video_limit,
        );
        env(
            "VISKA_FREE_TIER_MINUTES_LIMIT",
            &mut self.quota.free_tier_minutes_limit,
        );
        env(
            "VISKA_FREE_TIER_MESSAGES_LIMIT",
            &mut self.quota.free_tier_messages_limit,
        );
        env(
            "VISKA_FREE_TIER_STORAGE_MB_LIMIT",
            &mut self.quota.free_tier_storage_mb_limit,
        );
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Get the expanded blob storage root.
    pub fn storage_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.storage_dir)
    }

    /// Get the expanded temp directory path.
    pub fn temp_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.temp_dir)
    }

    /// Path to the relational database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("viska.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.chunking.target_tokens, 256);
        assert_eq!(s.chunking.max_tokens, 800);
        assert_eq!(s.retrieval.top_k, 20);
        assert!(s.captions.enabled);
        assert!(!s.reranking.enabled);
    }

    #[test]
    fn test_toml_round_trip() {
        let s = Settings::default();
        let text = toml::to_string_pretty(&s).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back.chunking.overlap_tokens, s.chunking.overlap_tokens);
        assert_eq!(back.llm.model, s.llm.model);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let s: Settings = toml::from_str("[chunking]\ntarget_tokens = 128\n").unwrap();
        assert_eq!(s.chunking.target_tokens, 128);
        assert_eq!(s.chunking.max_tokens, 800);
        assert_eq!(s.embedding.batch_size, 32);
    }
}
