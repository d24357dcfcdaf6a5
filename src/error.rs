//! Error types for Viska.

use thiserror::Error;

/// Library-level error type for Viska operations.
#[derive(Error, Debug)]
pub enum ViskaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Media source error: {0}")]
    MediaSource(String),

    #[error("Video unavailable: {0}")]
    VideoUnavailable(String),

    #[error("Audio download failed: {0}")]
    AudioDownload(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Chunking failed: {0}")]
    Chunking(String),

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Reranking failed: {0}")]
    Rerank(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("OpenAI API error: {0}")]
    OpenAI(String),

    #[error("External tool not found: {0}. Please install it and ensure it's in your PATH.")]
    ToolNotFound(String),

    #[error("External tool failed: {0}")]
    ToolFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} quota exceeded: {used}/{limit}")]
    QuotaExceeded { kind: String, used: f64, limit: f64 },

    #[error("Processing canceled")]
    Canceled,
}

impl ViskaError {
    /// Whether a retry at the stage level could plausibly succeed.
    ///
    /// Quota, validation, and input errors are permanent; transport-level
    /// failures (network, external tools, provider APIs) are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ViskaError::AudioDownload(_)
                | ViskaError::Transcription(_)
                | ViskaError::Embedding(_)
                | ViskaError::VectorStore(_)
                | ViskaError::Llm(_)
                | ViskaError::OpenAI(_)
                | ViskaError::Http(_)
                | ViskaError::Io(_)
                | ViskaError::ToolFailed(_)
        )
    }
}

/// Result type alias for Viska operations.
pub type Result<T> = std::result::Result<T, ViskaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_display() {
        let err = ViskaError::QuotaExceeded {
            kind: "videos".to_string(),
            used: 10.0,
            limit: 10.0,
        };
        assert_eq!(err.to_string(), "videos quota exceeded: 10/10");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ViskaError::AudioDownload("403".into()).is_transient());
        assert!(ViskaError::Llm("timeout".into()).is_transient());
        assert!(!ViskaError::InvalidInput("bad url".into()).is_transient());
        assert!(!ViskaError::Canceled.is_transient());
        assert!(!ViskaError::QuotaExceeded {
            kind: "videos".into(),
            used: 2.0,
            limit: 2.0
        }
        .is_transient());
    }
}
