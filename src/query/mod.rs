//! The query pipeline: intent classification and two-level retrieval.

pub mod intent;
pub mod retriever;

pub use intent::{IntentClassification, IntentClassifier, QueryIntent, RecentMessage};
pub use retriever::{RetrievalResult, RetrievalType, Retriever, VideoSummary};
