//! Embedding generation for semantic search and retrieval.
//!
//! Backends are a closed set of tagged variants: the OpenAI embeddings API
//! and a deterministic local lexical embedder that needs no API key. All
//! outputs are L2-normalized; single-text embeds go through a small LRU
//! cache.

mod lexical;

pub use lexical::LexicalEmbedder;

use crate::error::{Result, ViskaError};
use async_openai::types::{CreateEmbeddingRequestArgs, EmbeddingInput};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{debug, instrument};

const EMBED_CACHE_SIZE: usize = 1000;

/// Embedding backend.
pub enum EmbeddingBackend {
    OpenAi {
        client: async_openai::Client<async_openai::config::OpenAIConfig>,
        model: String,
        dimensions: usize,
    },
    Lexical(LexicalEmbedder),
}

/// Embedding client with caching and batch splitting.
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
    batch_size: usize,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingClient {
    /// OpenAI-backed client.
    pub fn openai(model: &str, dimensions: usize, batch_size: usize) -> Self {
        Self::with_backend(
            EmbeddingBackend::OpenAi {
                client: crate::llm::create_openai_client(),
                model: model.to_string(),
                dimensions,
            },
            batch_size,
        )
    }

    /// Deterministic local client (no API key; lexical, not semantic).
    pub fn lexical(dimensions: usize, batch_size: usize) -> Self {
        Self::with_backend(
            EmbeddingBackend::Lexical(LexicalEmbedder::new(dimensions)),
            batch_size,
        )
    }

    pub fn with_backend(backend: EmbeddingBackend, batch_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(EMBED_CACHE_SIZE).expect("nonzero cache size");
        Self {
            backend,
            batch_size: batch_size.max(1),
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Build the client described by the settings.
    pub fn from_settings(settings: &crate::config::EmbeddingSettings) -> Self {
        match settings.provider {
            crate::config::EmbeddingProviderKind::OpenAI => {
                Self::openai(&settings.model, settings.dimensions, settings.batch_size)
            }
            crate::config::EmbeddingProviderKind::Local => {
                Self::lexical(settings.dimensions, settings.batch_size)
            }
        }
    }

    /// Embedding dimensions.
    pub fn dims(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi { dimensions, .. } => *dimensions,
            EmbeddingBackend::Lexical(e) => e.dimensions(),
        }
    }

    /// Identity of the underlying model.
    pub fn model_id(&self) -> String {
        match &self.backend {
            EmbeddingBackend::OpenAi { model, .. } => model.clone(),
            EmbeddingBackend::Lexical(e) => format!("lexical-{}", e.dimensions()),
        }
    }

    /// Embed a single text, consulting the LRU cache first.
    #[instrument(skip(self, text))]
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(text) {
                return Ok(hit.clone());
            }
        }

        let embeddings = self.embed_uncached(&[text.to_string()]).await?;
        let embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| ViskaError::Embedding("Empty embedding response".to_string()))?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(text.to_string(), embedding.clone());
        }
        Ok(embedding)
    }

    /// Embed many texts, splitting into configured batch sizes.
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            all.extend(self.embed_uncached(batch).await?);
        }

        debug!("Generated {} embeddings", all.len());
        Ok(all)
    }

    async fn embed_uncached(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            EmbeddingBackend::OpenAi {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model)
                    .input(EmbeddingInput::StringArray(texts.to_vec()))
                    .dimensions(*dimensions as u32)
                    .build()
                    .map_err(|e| ViskaError::Embedding(format!("Failed to build request: {}", e)))?;

                let response = client
                    .embeddings()
                    .create(request)
                    .await
                    .map_err(|e| ViskaError::OpenAI(format!("Embedding API error: {}", e)))?;

                // Sort by index to ensure correct order
                let mut data: Vec<_> = response.data.into_iter().collect();
                data.sort_by_key(|e| e.index);

                Ok(data.into_iter().map(|d| normalize(d.embedding)).collect())
            }
            EmbeddingBackend::Lexical(embedder) => {
                Ok(texts.iter().map(|t| embedder.embed(t)).collect())
            }
        }
    }
}

/// Normalize a vector to unit length. Zero vectors pass through unchanged.
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for v in &mut vector {
            *v /= magnitude;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lexical_client_deterministic() {
        let client = EmbeddingClient::lexical(64, 8);
        let a = client.embed("hello world").await.unwrap();
        let b = client.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let client = EmbeddingClient::lexical(32, 2);
        let texts = vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string(),
        ];
        let batched = client.embed_batch(&texts).await.unwrap();
        assert_eq!(batched.len(), 3);
        let single = client.embed("second").await.unwrap();
        assert_eq!(batched[1], single);
    }

    #[tokio::test]
    async fn test_outputs_unit_length() {
        let client = EmbeddingClient::lexical(48, 8);
        let e = client.embed("the quick brown fox").await.unwrap();
        let magnitude: f32 = e.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_normalize_zero_vector() {
        let v = normalize(vec![0.0, 0.0]);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn test_model_id() {
        let client = EmbeddingClient::lexical(384, 8);
        assert_eq!(client.model_id(), "lexical-384");
        assert_eq!(client.dims(), 384);
    }
}
