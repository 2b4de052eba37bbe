//! Composition root and collaborator-facing API.
//!
//! [`MemoryEngine`] wires the configuration, canonical store, vector
//! index, LLM provider, queues, worker pools, and schedulers into one
//! unit; no module-level singletons anywhere. Collaborators (the chat
//! front-end, upload handling) talk to the engine through a handful of
//! methods; everything asynchronous happens on the engine's own workers.
//!
//! # Startup
//!
//! [`MemoryEngineBuilder::build`] refuses to start on fatal
//! misconfiguration: an unreachable database, an unknown LLM provider
//! name, or a failed vector-schema bootstrap.
//!
//! # Shutdown
//!
//! [`MemoryEngine::shutdown`] flips the shutdown signal, lets every worker
//! finish the job in hand, joins the scheduler tasks, and closes the
//! database pool last.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::episodes::{Consolidator, EpisodeAttacher};
use crate::llm::{LlmClient, LlmError, ProviderRegistry};
use crate::model::{MemoryStore, RawRecordDraft, SqliteMemoryStore, StoreError};
use crate::pipeline::{IngestionPipeline, PipelineError};
use crate::prompts::memory_context_block;
use crate::queue::{
    Job, JobError, JobHandler, QueueSet, QueueStats, RetryPolicy, scheduler, spawn_workers,
};
use crate::retrieval::{RetrieveOptions, RetrievedMemory, Retriever};
use crate::thoughts::ThoughtGenerator;
use crate::types::{ContentType, RawRecordId, RecordStatus};
use crate::vectors::{InMemoryVectorIndex, VectorClass, VectorError, VectorStore};

/// Engine-surface errors with HTTP-equivalent status hints.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    /// Caller error: the record was not created.
    #[error("invalid input: {0}")]
    #[diagnostic(code(engram::engine::invalid_input))]
    InvalidInput(String),

    /// Fatal wiring problem; the process should refuse to start.
    #[error("configuration error: {0}")]
    #[diagnostic(code(engram::engine::configuration))]
    Configuration(String),

    #[error(transparent)]
    #[diagnostic(code(engram::engine::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(engram::engine::vectors))]
    Vector(#[from] VectorError),

    #[error(transparent)]
    #[diagnostic(code(engram::engine::llm))]
    Llm(#[from] LlmError),

    #[error(transparent)]
    #[diagnostic(code(engram::engine::pipeline))]
    Pipeline(#[from] PipelineError),
}

impl EngineError {
    /// HTTP-equivalent status for synchronous surfaces.
    #[must_use]
    pub fn http_status_hint(&self) -> u16 {
        match self {
            EngineError::InvalidInput(_) => 400,
            EngineError::Configuration(_) => 500,
            EngineError::Store(_)
            | EngineError::Vector(_)
            | EngineError::Llm(_)
            | EngineError::Pipeline(_) => 502,
        }
    }
}

/// Builder for [`MemoryEngine`]. Collaborator-provided adapters override
/// the shipped defaults (sqlx SQLite store, in-memory vector index,
/// registry-resolved LLM provider).
pub struct MemoryEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn MemoryStore>>,
    vectors: Option<Arc<dyn VectorStore>>,
    llm: Option<Arc<dyn LlmClient>>,
    registry: ProviderRegistry,
}

impl MemoryEngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            vectors: None,
            llm: None,
            registry: ProviderRegistry::with_defaults(),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_vector_store(mut self, vectors: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Wire everything, bootstrap schemas, and start workers and
    /// schedulers.
    pub async fn build(self) -> Result<MemoryEngine, EngineError> {
        let config = self.config;

        let store: Arc<dyn MemoryStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                SqliteMemoryStore::connect(&config.database_url)
                    .await
                    .map_err(|e| EngineError::Configuration(e.to_string()))?,
            ),
        };

        let vectors: Arc<dyn VectorStore> = match self.vectors {
            Some(vectors) => vectors,
            None => Arc::new(InMemoryVectorIndex::new(config.embedding_dim)),
        };

        let llm: Arc<dyn LlmClient> = match self.llm {
            Some(llm) => llm,
            None => self
                .registry
                .resolve(&config.llm)
                .map_err(|e| EngineError::Configuration(e.to_string()))?,
        };

        if config.purge_legacy_classes {
            // One-time cleanup: drop the reserved classes so the bootstrap
            // below recreates them with the current property set.
            vectors.delete_class(VectorClass::KnowledgeNode).await?;
            vectors.delete_class(VectorClass::Relationship).await?;
        }
        vectors.ensure_schema().await?;

        let queues = Arc::new(QueueSet::new(
            config.queues.completed_history,
            config.queues.failed_history,
        ));

        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&llm),
            Arc::clone(&queues),
            &config,
        ));
        let attacher = Arc::new(EpisodeAttacher::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&llm),
            Arc::clone(&queues),
            &config,
        ));
        let consolidator = Arc::new(Consolidator::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&llm),
            &config,
        ));
        let thought_generator = Arc::new(ThoughtGenerator::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&llm),
            &config,
        ));
        let retriever = Arc::new(Retriever::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&llm),
            &config,
        ));

        let handler: Arc<dyn JobHandler> = Arc::new(EngineJobHandler {
            pipeline: Arc::clone(&pipeline),
            attacher: Arc::clone(&attacher),
            consolidator: Arc::clone(&consolidator),
            thought_generator: Arc::clone(&thought_generator),
            store: Arc::clone(&store),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = RetryPolicy::new(config.queues.max_attempts, config.queues.backoff_base);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for (queue, workers) in [
            (&queues.ingest, config.queues.ingest_workers),
            (&queues.attach, config.queues.attach_workers),
            (&queues.consolidate, config.queues.consolidate_workers),
            (&queues.thoughts, config.queues.thought_workers),
            (&queues.file_upload, config.queues.file_upload_workers),
        ] {
            tasks.extend(spawn_workers(
                Arc::clone(queue),
                Arc::clone(&handler),
                workers,
                config.queues.max_attempts,
                backoff,
                shutdown_rx.clone(),
            ));
        }

        // Nightly thought generation for every known user.
        {
            let store = Arc::clone(&store);
            let queues = Arc::clone(&queues);
            tasks.push(scheduler::spawn_daily(
                &config.thoughts.schedule,
                shutdown_rx.clone(),
                move || {
                    let store = Arc::clone(&store);
                    let queues = Arc::clone(&queues);
                    async move {
                        match store.list_user_ids().await {
                            Ok(users) => {
                                info!(users = users.len(), "nightly thought generation");
                                for user_id in users {
                                    queues.enqueue(Job::GenerateThoughts { user_id });
                                }
                            }
                            Err(err) => warn!(error = %err, "nightly user listing failed"),
                        }
                    }
                },
            ));
        }

        // Pending-vector sweeper.
        {
            let pipeline = Arc::clone(&pipeline);
            tasks.push(scheduler::spawn_interval(
                config.queues.sweep_interval,
                shutdown_rx,
                move || {
                    let pipeline = Arc::clone(&pipeline);
                    async move {
                        match pipeline.sweep_pending().await {
                            Ok(recovered) if recovered > 0 => {
                                info!(recovered, "sweeper recovered pending vectors");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "pending sweep failed"),
                        }
                    }
                },
            ));
        }

        Ok(MemoryEngine {
            store,
            vectors,
            llm,
            queues,
            pipeline,
            retriever,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine").finish_non_exhaustive()
    }
}

/// The memory engine: one handle owning the full substrate.
pub struct MemoryEngine {
    store: Arc<dyn MemoryStore>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    queues: Arc<QueueSet>,
    pipeline: Arc<IngestionPipeline>,
    retriever: Arc<Retriever>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryEngine {
    /// Start building an engine from `config`.
    #[must_use]
    pub fn builder(config: EngineConfig) -> MemoryEngineBuilder {
        MemoryEngineBuilder::new(config)
    }

    /// Persist a raw record and enqueue its ingestion.
    ///
    /// Empty content or a missing user id is a caller error and creates
    /// nothing. Document uploads route through the file-upload queue and
    /// bypass the importance gate.
    #[instrument(skip(self, draft), fields(user_id = %draft.user_id, content_type = %draft.content_type))]
    pub async fn ingest_raw_record(
        &self,
        mut draft: RawRecordDraft,
    ) -> Result<RawRecordId, EngineError> {
        if draft.user_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("missing userId".into()));
        }
        if draft.content.trim().is_empty() {
            return Err(EngineError::InvalidInput("empty content".into()));
        }
        if draft.content_type == ContentType::UploadedDocumentContent {
            draft.skip_importance_check = true;
        }

        let record = self.store.insert_raw_record(draft).await?;
        if record.processing_status == RecordStatus::Pending {
            let job = if record.content_type == ContentType::UploadedDocumentContent {
                Job::FileUpload {
                    record_id: record.id,
                }
            } else {
                Job::Ingest {
                    record_id: record.id,
                }
            };
            self.queues.enqueue(job);
        }
        Ok(record.id)
    }

    /// Rank a user's memories against a query.
    ///
    /// Backend failures degrade to an empty list (with a warning log); the
    /// chat surface never turns a retrieval hiccup into an error reply.
    pub async fn retrieve_memories(
        &self,
        user_id: &str,
        query: &str,
        options: &RetrieveOptions,
    ) -> Vec<RetrievedMemory> {
        match self.retriever.retrieve(user_id, query, options).await {
            Ok(memories) => memories,
            Err(err) => {
                warn!(error = %err, "retrieval failed, returning empty result");
                Vec::new()
            }
        }
    }

    /// Retrieve and format the memory-context block for a chat turn.
    pub async fn build_memory_context(&self, user_id: &str, query: &str) -> Option<String> {
        let memories = self
            .retrieve_memories(user_id, query, &RetrieveOptions::default())
            .await;
        if memories.is_empty() {
            return None;
        }
        let lines: Vec<String> = memories
            .iter()
            .map(|memory| match &memory.title {
                Some(title) => format!("{title}: {}", memory.content),
                None => memory.content.clone(),
            })
            .collect();
        Some(memory_context_block(&lines))
    }

    /// Queue a consolidation pass for the user. Idempotent: a pass already
    /// queued for the same user coalesces.
    pub fn trigger_consolidation(&self, user_id: &str) -> bool {
        self.queues.enqueue(Job::Consolidate {
            user_id: user_id.to_string(),
        })
    }

    /// Queue a thought-generation pass for the user. Idempotent like
    /// [`MemoryEngine::trigger_consolidation`].
    pub fn generate_thoughts_for_user(&self, user_id: &str) -> bool {
        self.queues.enqueue(Job::GenerateThoughts {
            user_id: user_id.to_string(),
        })
    }

    /// Run the pending-vector sweep immediately (also runs on the
    /// maintenance tick). Returns the number of recovered chunks.
    pub async fn run_pending_sweep(&self) -> Result<usize, EngineError> {
        Ok(self.pipeline.sweep_pending().await?)
    }

    /// Rebuild a user's vector shadows from the relational rows (DB wins).
    pub async fn rebuild_user_vectors(&self, user_id: &str) -> Result<usize, EngineError> {
        Ok(self.pipeline.rebuild_user_vectors(user_id).await?)
    }

    /// Point-in-time stats for every queue.
    #[must_use]
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.queues.stats()
    }

    /// Direct access to the LLM seam for chat collaborators.
    #[must_use]
    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// Direct access to the vector seam (admin tooling).
    #[must_use]
    pub fn vector_store(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    /// Stop workers and schedulers, drain, and close the store.
    pub async fn shutdown(&self) {
        info!("memory engine shutting down");
        self.shutdown_tx.send(true).ok();
        let drained: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };
        futures_util::future::join_all(drained).await;
        self.store.close().await;
        info!("memory engine stopped");
    }
}

/// Routes queue jobs to their components.
struct EngineJobHandler {
    pipeline: Arc<IngestionPipeline>,
    attacher: Arc<EpisodeAttacher>,
    consolidator: Arc<Consolidator>,
    thought_generator: Arc<ThoughtGenerator>,
    store: Arc<dyn MemoryStore>,
}

#[async_trait::async_trait]
impl JobHandler for EngineJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match job {
            Job::Ingest { record_id } | Job::FileUpload { record_id } => self
                .pipeline
                .process_record(*record_id)
                .await
                .map(|_| ())
                .map_err(|err| classify(err.is_retryable(), err.to_string())),
            Job::AttachEpisode { chunk_id, user_id } => self
                .attacher
                .attach(*chunk_id, user_id)
                .await
                .map(|_| ())
                .map_err(|err| classify(err.is_retryable(), err.to_string())),
            Job::Consolidate { user_id } => self
                .consolidator
                .consolidate_user(user_id)
                .await
                .map(|_| ())
                .map_err(|err| classify(err.is_retryable(), err.to_string())),
            Job::GenerateThoughts { user_id } => self
                .thought_generator
                .generate_for_user(user_id)
                .await
                .map(|_| ())
                .map_err(|err| classify(err.is_retryable(), err.to_string())),
        }
    }

    async fn on_exhausted(&self, job: &Job, error: &JobError) {
        // The original error lands on the record (truncated by the store).
        if let Job::Ingest { record_id } | Job::FileUpload { record_id } = job {
            if let Err(err) = self
                .store
                .mark_record_status(*record_id, RecordStatus::Error, Some(error.message()))
                .await
            {
                warn!(record_id = %record_id, error = %err, "failed to record ingest failure");
            }
        }
    }
}

fn classify(retryable: bool, message: String) -> JobError {
    if retryable {
        JobError::Transient(message)
    } else {
        JobError::Permanent(message)
    }
}
