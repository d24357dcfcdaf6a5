//! Cross-encoder reranking over an HTTP scoring endpoint.
//!
//! Sends (query, documents) pairs to a cross-encoder server and reassigns
//! chunk scores from its output. When the endpoint is unreachable or returns
//! garbage, reranking degrades to the identity ordering so retrieval keeps
//! working without it.

use crate::config::RerankingSettings;
use crate::vector_store::ScoredPoint;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

/// HTTP cross-encoder reranker.
pub struct Reranker {
    endpoint: String,
    http: reqwest::Client,
}

impl Reranker {
    pub fn new(settings: &RerankingSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            endpoint: settings.endpoint.clone(),
            http,
        }
    }

    /// Document text scored by the cross-encoder: chunk text plus any
    /// enrichment it carries.
    fn document_text(point: &ScoredPoint) -> String {
        let mut parts = Vec::new();
        if let Some(title) = &point.payload.title {
            parts.push(title.clone());
        }
        if let Some(summary) = &point.payload.summary {
            parts.push(summary.clone());
        }
        parts.push(point.payload.text.clone());
        parts.join(" ")
    }

    /// Rerank chunks against the query, returning the top `k` by new score.
    ///
    /// Empty input yields empty output. Any transport or decode failure
    /// degrades to the identity ordering truncated to `k`.
    #[instrument(skip(self, chunks), fields(count = chunks.len()))]
    pub async fn rerank(
        &self,
        query: &str,
        mut chunks: Vec<ScoredPoint>,
        k: usize,
    ) -> Vec<ScoredPoint> {
        if chunks.is_empty() {
            return chunks;
        }

        let documents: Vec<String> = chunks.iter().map(Self::document_text).collect();
        let body = serde_json::json!({
            "query": query,
            "documents": documents,
            "top_n": k,
        });

        let response = match self.http.post(&self.endpoint).json(&body).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("Reranker returned {}, using original order", r.status());
                chunks.truncate(k);
                return chunks;
            }
            Err(e) => {
                warn!("Reranker unavailable ({}), using original order", e);
                chunks.truncate(k);
                return chunks;
            }
        };

        let parsed: RerankResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Reranker response decode failed ({}), using original order", e);
                chunks.truncate(k);
                return chunks;
            }
        };

        let mut reranked: Vec<ScoredPoint> = Vec::with_capacity(k.min(chunks.len()));
        for result in parsed.results {
            if result.index < chunks.len() {
                let mut point = chunks[result.index].clone();
                point.score = result.relevance_score;
                reranked.push(point);
            }
        }

        reranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        reranked.truncate(k);

        debug!("Reranked to {} chunks", reranked.len());
        reranked
    }
}
