//! Shared fixtures: a scripted mock LLM, a flaky vector store, and a
//! fully wired component harness over an in-memory database.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use engram::config::EngineConfig;
use engram::episodes::{Consolidator, EpisodeAttacher};
use engram::llm::{
    ChatOptions, ChatReply, CompletionOptions, ImageAnalysisRequest, LlmClient, LlmError,
};
use engram::model::{MemoryStore, NewEpisode, RawRecordDraft, SqliteMemoryStore};
use engram::pipeline::IngestionPipeline;
use engram::queue::QueueSet;
use engram::retrieval::Retriever;
use engram::thoughts::ThoughtGenerator;
use engram::types::ContentType;
use engram::vectors::{
    InMemoryVectorIndex, NearestHit, NearestQuery, VectorClass, VectorError, VectorObject,
    VectorStore,
};

/// Embedding dimension used across the integration suites. Small enough
/// to hand-author geometry, large enough to be non-trivial.
pub const DIM: usize = 4;

/// Scripted LLM double.
///
/// Replies are routed by prompt shape (the contract markers each template
/// carries), so one mock serves the importance evaluator, the narrators,
/// and the thought generator at once. Embeddings are deterministic
/// hash-derived unit vectors unless a text has an explicit override.
#[derive(Debug)]
pub struct MockLlm {
    dim: usize,
    importance_reply: Mutex<String>,
    narrative_reply: Mutex<String>,
    thought_reply: Mutex<String>,
    embeddings: Mutex<FxHashMap<String, Vec<f32>>>,
    fail_completions: AtomicBool,
    drop_one_embedding: AtomicBool,
    completion_calls: AtomicU32,
    embed_calls: AtomicU32,
}

impl MockLlm {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            importance_reply: Mutex::new("IMPORTANCE_SCORE: 0.8".to_string()),
            narrative_reply: Mutex::new(
                "Title: A remembered episode\n\nSummary: Things happened that mattered to \
                 the user and were recorded for later recall."
                    .to_string(),
            ),
            thought_reply: Mutex::new(
                "NAME: A recurring pattern\nDESCRIPTION: The user keeps returning to the \
                 same theme across several episodes.\nIMPORTANCE: 0.8"
                    .to_string(),
            ),
            embeddings: Mutex::new(FxHashMap::default()),
            fail_completions: AtomicBool::new(false),
            drop_one_embedding: AtomicBool::new(false),
            completion_calls: AtomicU32::new(0),
            embed_calls: AtomicU32::new(0),
        }
    }

    pub fn set_importance_reply(&self, reply: &str) {
        *self.importance_reply.lock().unwrap() = reply.to_string();
    }

    pub fn set_narrative_reply(&self, reply: &str) {
        *self.narrative_reply.lock().unwrap() = reply.to_string();
    }

    pub fn set_thought_reply(&self, reply: &str) {
        *self.thought_reply.lock().unwrap() = reply.to_string();
    }

    /// Pin the embedding for an exact text.
    pub fn set_embedding(&self, text: &str, vector: Vec<f32>) {
        self.embeddings
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
    }

    /// Make every completion fail with a timeout (heuristic-fallback path).
    pub fn fail_completions(&self, fail: bool) {
        self.fail_completions.store(fail, Ordering::SeqCst);
    }

    /// Drop one vector from the next embed batch (count-mismatch path).
    pub fn drop_one_embedding_once(&self) {
        self.drop_one_embedding.store(true, Ordering::SeqCst);
    }

    pub fn completion_calls(&self) -> u32 {
        self.completion_calls.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> u32 {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Deterministic unit vector from the text bytes.
    fn derive_vector(&self, text: &str) -> Vec<f32> {
        let mut components = Vec::with_capacity(self.dim);
        for salt in 0..self.dim {
            let mut acc: u64 = 1469598103934665603 ^ (salt as u64);
            for byte in text.bytes() {
                acc = acc.wrapping_mul(1099511628211) ^ u64::from(byte);
            }
            // Map into [-1, 1).
            components.push(((acc >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0) as f32);
        }
        let norm: f32 = components.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut components {
                *x /= norm;
            }
        }
        components
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn send_message(
        &self,
        _user_id: &str,
        _session_id: &str,
        message: &str,
        options: &ChatOptions,
    ) -> Result<ChatReply, LlmError> {
        let text = match &options.memory_context {
            Some(block) => format!("{block}\n\nUSER MESSAGE: {message}"),
            None => message.to_string(),
        };
        Ok(ChatReply { text })
    }

    async fn completion(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        self.completion_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_completions.load(Ordering::SeqCst) {
            return Err(LlmError::Timeout);
        }
        let reply = if prompt.contains("IMPORTANCE_SCORE") {
            self.importance_reply.lock().unwrap().clone()
        } else if prompt.contains("Summary:") {
            self.narrative_reply.lock().unwrap().clone()
        } else if prompt.contains("NAME:") {
            self.thought_reply.lock().unwrap().clone()
        } else {
            String::from("ok")
        };
        Ok(reply)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let overrides = self.embeddings.lock().unwrap();
        let mut vectors: Vec<Vec<f32>> = texts
            .iter()
            .map(|text| {
                overrides
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| self.derive_vector(text))
            })
            .collect();
        if self.drop_one_embedding.swap(false, Ordering::SeqCst) && !vectors.is_empty() {
            vectors.pop();
        }
        Ok(vectors)
    }

    async fn analyze_image(&self, _request: ImageAnalysisRequest) -> Result<ChatReply, LlmError> {
        Ok(ChatReply {
            text: "A photo of something memorable.".to_string(),
        })
    }
}

/// Vector store wrapper that can simulate an unreachable backend.
pub struct FlakyVectorStore {
    inner: InMemoryVectorIndex,
    fail_upserts: AtomicBool,
}

impl FlakyVectorStore {
    pub fn new(dim: usize) -> Self {
        Self {
            inner: InMemoryVectorIndex::new(dim),
            fail_upserts: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_upserts.store(unavailable, Ordering::SeqCst);
    }

    pub fn count(&self, class: VectorClass) -> usize {
        self.inner.count(class)
    }
}

#[async_trait]
impl VectorStore for FlakyVectorStore {
    async fn ensure_schema(&self) -> Result<(), VectorError> {
        self.inner.ensure_schema().await
    }

    async fn upsert_batch(
        &self,
        class: VectorClass,
        objects: Vec<VectorObject>,
    ) -> Result<(), VectorError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(VectorError::Unavailable("simulated outage".into()));
        }
        self.inner.upsert_batch(class, objects).await
    }

    async fn nearest(
        &self,
        class: VectorClass,
        vector: &[f32],
        query: &NearestQuery,
    ) -> Result<Vec<NearestHit>, VectorError> {
        self.inner.nearest(class, vector, query).await
    }

    async fn fetch(
        &self,
        class: VectorClass,
        id: Uuid,
    ) -> Result<Option<VectorObject>, VectorError> {
        self.inner.fetch(class, id).await
    }

    async fn delete_class(&self, class: VectorClass) -> Result<(), VectorError> {
        self.inner.delete_class(class).await
    }
}

/// Every component wired against one in-memory database, the flaky
/// vector index, and the mock LLM. Tests drive components directly so
/// behavior is deterministic (no settle delays, no worker races).
pub struct Harness {
    pub config: EngineConfig,
    pub store: Arc<dyn MemoryStore>,
    pub vectors: Arc<FlakyVectorStore>,
    pub llm: Arc<MockLlm>,
    pub queues: Arc<QueueSet>,
    pub pipeline: IngestionPipeline,
    pub attacher: EpisodeAttacher,
    pub consolidator: Consolidator,
    pub thoughts: ThoughtGenerator,
    pub retriever: Retriever,
}

pub async fn harness() -> Harness {
    let mut config = EngineConfig::default()
        .with_database_url("sqlite::memory:")
        .with_embedding_dim(DIM);
    config.attach.settle_delay = std::time::Duration::ZERO;
    config.queues.backoff_base = std::time::Duration::from_millis(5);

    let store: Arc<dyn MemoryStore> = Arc::new(
        SqliteMemoryStore::connect(&config.database_url)
            .await
            .expect("connect sqlite memory"),
    );
    let vectors = Arc::new(FlakyVectorStore::new(DIM));
    vectors.ensure_schema().await.expect("bootstrap classes");
    let llm = Arc::new(MockLlm::new(DIM));
    let queues = Arc::new(QueueSet::new(100, 100));

    let vectors_dyn: Arc<dyn VectorStore> = vectors.clone();
    let llm_dyn: Arc<dyn LlmClient> = llm.clone();

    Harness {
        pipeline: IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&vectors_dyn),
            Arc::clone(&llm_dyn),
            Arc::clone(&queues),
            &config,
        ),
        attacher: EpisodeAttacher::new(
            Arc::clone(&store),
            Arc::clone(&vectors_dyn),
            Arc::clone(&llm_dyn),
            Arc::clone(&queues),
            &config,
        ),
        consolidator: Consolidator::new(
            Arc::clone(&store),
            Arc::clone(&vectors_dyn),
            Arc::clone(&llm_dyn),
            &config,
        ),
        thoughts: ThoughtGenerator::new(
            Arc::clone(&store),
            Arc::clone(&vectors_dyn),
            Arc::clone(&llm_dyn),
            &config,
        ),
        retriever: Retriever::new(
            Arc::clone(&store),
            Arc::clone(&vectors_dyn),
            Arc::clone(&llm_dyn),
            &config,
        ),
        config,
        store,
        vectors,
        llm,
        queues,
    }
}

/// A chat draft for `user` with the given content.
pub fn chat_draft(user: &str, content: &str) -> RawRecordDraft {
    RawRecordDraft::new(user, "session-1", ContentType::UserChat, content)
}

/// Insert an episode with a fixed centroid and its shadow object.
pub async fn seed_episode(
    harness: &Harness,
    user: &str,
    title: &str,
    centroid: Vec<f32>,
) -> engram::model::Episode {
    let episode = harness
        .store
        .insert_episode(NewEpisode {
            user_id: user.to_string(),
            title: title.to_string(),
            narrative: format!("Narrative for {title}"),
            centroid: centroid.clone(),
        })
        .await
        .expect("insert episode");
    harness
        .vectors
        .upsert_batch(
            VectorClass::EpisodeEmbedding,
            vec![VectorObject::episode(episode.id, user, centroid)],
        )
        .await
        .expect("upsert episode shadow");
    episode
}

/// Insert a chunk row (with a parent record) plus its vector shadow, as
/// the pipeline would have left it.
pub async fn seed_chunk(
    harness: &Harness,
    user: &str,
    text: &str,
    importance: f64,
    vector: Vec<f32>,
) -> engram::model::Chunk {
    let record = harness
        .store
        .insert_raw_record(chat_draft(user, text))
        .await
        .expect("insert parent record");
    let mut chunks = harness
        .store
        .insert_chunks(vec![engram::model::NewChunk {
            raw_record_id: record.id,
            user_id: user.to_string(),
            session_id: "session-1".to_string(),
            text: text.to_string(),
            index: 0,
            token_count: 1,
            importance_score: importance,
            metadata: engram::model::ChunkMetadata {
                content_type: ContentType::UserChat,
                source_created_at: record.created_at,
                perspective_owner_id: user.to_string(),
                subject_id: user.to_string(),
                topic_key: None,
                force_important: false,
            },
        }])
        .await
        .expect("insert chunk");
    let chunk = chunks.remove(0);
    harness
        .store
        .set_chunk_vector(chunk.id, &vector)
        .await
        .expect("store chunk vector");
    harness
        .vectors
        .upsert_batch(
            VectorClass::ChunkEmbedding,
            vec![VectorObject::chunk(chunk.id, user, importance, vector)],
        )
        .await
        .expect("upsert chunk shadow");
    harness.store.get_chunk(chunk.id).await.unwrap().unwrap()
}

/// Ingest one record synchronously through the pipeline and return its id.
pub async fn ingest(harness: &Harness, draft: RawRecordDraft) -> engram::types::RawRecordId {
    let record = harness
        .store
        .insert_raw_record(draft)
        .await
        .expect("insert raw record");
    harness
        .pipeline
        .process_record(record.id)
        .await
        .expect("process record");
    record.id
}
