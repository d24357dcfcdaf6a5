//! Application assembly: wires the injected collaborators together and
//! exposes the two end-to-end flows (submit a video, ask a question).
//!
//! There are no global singletons; everything is built here and handed down,
//! so tests can assemble the same graph from fakes.

use crate::cleanup::CleanupScheduler;
use crate::config::Settings;
use crate::db::Database;
use crate::embedding::EmbeddingClient;
use crate::error::{Result, ViskaError};
use crate::insights::InsightsEngine;
use crate::llm::{ChatMessage, LlmClient};
use crate::memory::{self, FactExtractor};
use crate::models::{
    Conversation, Job, JobStatus, MessageRole, StoredMessage, Tier, User, Video,
};
use crate::pipeline::cancel::Canceller;
use crate::pipeline::{Pipeline, PipelineWorkers};
use crate::query::{IntentClassifier, RecentMessage, RetrievalResult, Retriever};
use crate::quota::{QuotaKind, UsageTracker};
use crate::storage::BlobStore;
use crate::vector_store::{SqliteVectorIndex, VectorIndex};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Response to a question, with the retrieval behind it.
#[derive(Debug)]
pub struct AskResponse {
    pub answer: String,
    pub intent: crate::query::IntentClassification,
    pub retrieval: RetrievalResult,
    pub model: String,
}

/// The assembled application.
pub struct App {
    pub settings: Settings,
    pub db: Arc<Database>,
    pub store: Arc<BlobStore>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<EmbeddingClient>,
    pub llm: Arc<LlmClient>,
    pub tracker: Arc<UsageTracker>,
    pub workers: Arc<PipelineWorkers>,
    pub pipeline: Arc<Pipeline>,
    pub canceller: Arc<Canceller>,
    pub scheduler: Arc<CleanupScheduler>,
    pub classifier: IntentClassifier,
    pub retriever: Retriever,
    pub insights: InsightsEngine,
}

impl App {
    /// Build the application from settings, creating data directories and
    /// the durable stores.
    pub fn new(settings: Settings) -> Result<Self> {
        std::fs::create_dir_all(settings.data_dir())?;
        std::fs::create_dir_all(settings.temp_dir())?;

        let db = Arc::new(Database::open(&settings.database_path())?);
        let store = Arc::new(BlobStore::local(&settings.storage_dir())?);
        let index: Arc<dyn VectorIndex> = Arc::new(SqliteVectorIndex::new(
            &settings.data_dir().join("vectors.db"),
        )?);

        Self::with_components(settings, db, store, index)
    }

    /// Build the application around injected stores (used by tests).
    pub fn with_components(
        settings: Settings,
        db: Arc<Database>,
        store: Arc<BlobStore>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self> {
        let embedder = Arc::new(EmbeddingClient::from_settings(&settings.embedding));
        let llm = Arc::new(LlmClient::new(&settings.llm));
        let tracker = Arc::new(UsageTracker::new(db.clone(), &settings.quota));
        let workers = Arc::new(PipelineWorkers::new(settings.general.pipeline_workers));

        let pipeline = Arc::new(Pipeline::new(
            db.clone(),
            store.clone(),
            index.clone(),
            embedder.clone(),
            llm.clone(),
            tracker.clone(),
            settings.clone(),
        ));

        let canceller = Arc::new(Canceller::new(
            db.clone(),
            store.clone(),
            index.clone(),
            tracker.clone(),
            Some(workers.clone()),
            embedder.dims(),
        ));

        let scheduler = Arc::new(CleanupScheduler::new(
            db.clone(),
            store.clone(),
            canceller.clone(),
            embedder.dims(),
        ));

        let retriever = Retriever::new(db.clone(), index.clone(), &settings);
        let insights = InsightsEngine::new(
            db.clone(),
            index.clone(),
            embedder.clone(),
            llm.clone(),
        );

        Ok(Self {
            settings,
            db,
            store,
            index,
            embedder,
            llm,
            tracker,
            workers,
            pipeline,
            canceller,
            scheduler,
            classifier: IntentClassifier::new(),
            retriever,
            insights,
        })
    }

    /// Fetch or lazily create the single local user the CLI operates as.
    pub fn local_user(&self) -> Result<User> {
        const LOCAL_EMAIL: &str = "local@viska";
        let conn_user = User {
            id: Uuid::new_v5(&Uuid::NAMESPACE_DNS, LOCAL_EMAIL.as_bytes()),
            email: LOCAL_EMAIL.to_string(),
            tier: Tier::Free,
            is_admin: false,
            is_active: true,
            created_at: Utc::now(),
        };
        match self.db.get_user(conn_user.id)? {
            Some(user) => Ok(user),
            None => {
                self.db.insert_user(&conn_user)?;
                Ok(conn_user)
            }
        }
    }

    /// Submit a video URL for ingestion.
    ///
    /// Enforces the video quota and validates the media before any row is
    /// created; a quota failure leaves no Video and queues no Job.
    #[instrument(skip(self))]
    pub async fn submit_video(&self, user_id: Uuid, url: &str) -> Result<(Video, Job)> {
        self.tracker.check(user_id, QuotaKind::Videos, 1.0)?;

        let metadata = self.pipeline.probe.video_info(url).await?;
        let (ok, reason) = self.pipeline.probe.validate(&metadata);
        if !ok {
            return Err(ViskaError::InvalidInput(
                reason.unwrap_or_else(|| "Video failed validation".to_string()),
            ));
        }

        let mut video = Video::new(user_id, url, &metadata.source_id, &metadata.title);
        video.description = metadata.description.clone();
        video.channel_name = metadata.channel_name.clone();
        video.duration_seconds = metadata.duration_seconds;
        video.view_count = metadata.view_count;
        video.like_count = metadata.like_count;
        video.chapters = metadata.chapters.clone();
        self.db.insert_video(&video)?;

        let job = Job {
            id: Uuid::new_v4(),
            video_id: video.id,
            user_id,
            status: JobStatus::Queued,
            progress_percent: 0.0,
            current_step: None,
            task_handle: 0,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.db.insert_job(&job)?;

        let handle = self
            .workers
            .dispatch(self.pipeline.clone(), video.id, job.id);
        self.db.set_job_handle(job.id, handle)?;

        info!("Queued video {} (job {}, handle {})", video.id, job.id, handle);
        Ok((video, job))
    }

    /// Ask a question against a set of videos inside a conversation.
    ///
    /// Runs the full query pipeline: intent classification, retrieval,
    /// memory recall, answer generation, then memory extraction.
    #[instrument(skip(self, question))]
    pub async fn ask(
        &self,
        user_id: Uuid,
        conversation_id: Option<Uuid>,
        video_ids: &[Uuid],
        question: &str,
        mode: &str,
    ) -> Result<AskResponse> {
        self.tracker.check(user_id, QuotaKind::Messages, 1.0)?;

        let conversation = match conversation_id {
            Some(id) => self
                .db
                .get_conversation(id)?
                .ok_or_else(|| ViskaError::InvalidInput(format!("Conversation {} not found", id)))?,
            None => {
                let conversation = Conversation {
                    id: Uuid::new_v4(),
                    user_id,
                    title: question.chars().take(60).collect(),
                    selected_video_ids: video_ids.to_vec(),
                    message_count: 0,
                    token_total: 0,
                    created_at: Utc::now(),
                    last_message_at: None,
                };
                self.db.insert_conversation(&conversation)?;
                conversation
            }
        };

        // Memory recall before the turn.
        let scored_facts =
            memory::select_facts(&self.db, conversation.id, memory::DEFAULT_FACT_LIMIT)?;
        let fact_lines: Vec<String> = scored_facts
            .iter()
            .map(|(f, _)| format!("{}={}", f.key, f.value))
            .collect();

        let recent: Vec<RecentMessage> = self
            .db
            .recent_messages(conversation.id, 6)?
            .into_iter()
            .map(|m| RecentMessage {
                role: match m.role {
                    MessageRole::User => "user".to_string(),
                    MessageRole::Assistant => "assistant".to_string(),
                    MessageRole::System => "system".to_string(),
                },
                content: m.content,
            })
            .collect();

        // Intent, then retrieval.
        let intent = self
            .classifier
            .classify(&self.llm, question, mode, video_ids.len(), &recent, &fact_lines)
            .await;

        let query_embedding = self.embedder.embed(question).await?;
        let retrieval = self
            .retriever
            .retrieve(question, &query_embedding, &intent, video_ids, user_id, mode)
            .await?;

        // Answer generation.
        let facts_block = memory::format_facts_for_prompt(&scored_facts);
        let system = format!(
            "You are a helpful assistant answering questions about the user's video \
             library. Ground every claim in the provided context and cite sources by \
             their [Source N] markers. If the context does not contain the answer, say \
             so.{}",
            facts_block
        );
        let user_prompt = format!(
            "Question: {}\n\nContext from the selected videos:\n{}",
            question, retrieval.context
        );

        let messages = vec![ChatMessage::system(system), ChatMessage::user(user_prompt)];
        let response = self
            .llm
            .complete(&messages, None, None, None, true)
            .await?;

        // Persist the turn and update memory.
        let now = Utc::now();
        self.db.insert_message(&StoredMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            role: MessageRole::User,
            content: question.to_string(),
            tokens_in: Some(response.usage.input_tokens),
            tokens_out: None,
            model: None,
            provider: None,
            created_at: now,
        })?;
        self.db.insert_message(&StoredMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            role: MessageRole::Assistant,
            content: response.content.clone(),
            tokens_in: None,
            tokens_out: Some(response.usage.output_tokens),
            model: Some(response.model.clone()),
            provider: Some(response.provider.clone()),
            created_at: now,
        })?;

        let used_fact_ids: Vec<Uuid> = scored_facts.iter().map(|(f, _)| f.id).collect();
        memory::mark_accessed(&self.db, &used_fact_ids)?;

        if let Some(updated) = self.db.get_conversation(conversation.id)? {
            let extractor = FactExtractor::new(&self.llm);
            let _ = extractor
                .extract_facts(&self.db, &updated, question, &response.content)
                .await;
        }

        self.tracker.track_chat_message(user_id)?;

        Ok(AskResponse {
            answer: response.content,
            intent,
            retrieval,
            model: response.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::MemoryVectorIndex;

    fn test_app() -> (App, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(BlobStore::local(tmp.path()).unwrap());
        let index: Arc<dyn VectorIndex> = Arc::new(MemoryVectorIndex::new());

        let mut settings = Settings::default();
        settings.quota.free_tier_video_limit = 1;
        let app = App::with_components(settings, db, store, index).unwrap();
        (app, tmp)
    }

    #[tokio::test]
    async fn test_quota_block_leaves_no_rows() {
        let (app, _tmp) = test_app();
        let user = app.local_user().unwrap();

        // Exhaust the single-video quota.
        app.tracker
            .track_video_ingestion(user.id, Uuid::new_v4(), 60.0, 1.0)
            .unwrap();

        let err = app
            .submit_video(user.id, "https://youtu.be/dQw4w9WgXcQ")
            .await
            .unwrap_err();
        assert!(matches!(err, ViskaError::QuotaExceeded { .. }));

        // No video row was created and no job queued.
        assert!(app.db.list_user_videos(user.id).unwrap().is_empty());
    }

    #[test]
    fn test_local_user_is_stable() {
        let (app, _tmp) = test_app();
        let a = app.local_user().unwrap();
        let b = app.local_user().unwrap();
        assert_eq!(a.id, b.id);
    }
}
