//! Ingestion pipeline: evaluate → chunk → persist → embed → index → attach.
//!
//! [`IngestionPipeline::process_record`] drives one raw record through the
//! full path, updating the record's status machine as it goes:
//!
//! ```text
//! pending ── empty / below gate ──────────────► skipped
//! pending ── embed batch mismatch ────────────► error
//! pending ── vector store unreachable ────────► pending (chunks pending_vector)
//! pending ── indexed, attach jobs enqueued ───► processed
//! ```
//!
//! The step sequence is resumable: a retried job finds the chunk rows it
//! already created and picks up at the embedding stage instead of building
//! a duplicate graph. Vector-store outages degrade to `pending_vector`
//! rows that [`IngestionPipeline::sweep_pending`] re-upserts from the
//! authoritative DB copies on the maintenance tick (DB wins).

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::chunking::{Chunker, estimate_tokens};
use crate::config::EngineConfig;
use crate::importance::ImportanceEvaluator;
use crate::llm::{LlmClient, LlmError};
use crate::model::{ChunkMetadata, MemoryStore, NewChunk, StoreError};
use crate::queue::{Job, QueueSet};
use crate::types::{ChunkStatus, RawRecordId, RecordStatus};
use crate::vectors::math::align_to_dim;
use crate::vectors::{VectorClass, VectorError, VectorObject, VectorStore};

/// Why a record left the pipeline without producing chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    EmptyContent,
    BelowImportanceGate,
    NothingToChunk,
}

/// Result of one pipeline pass over a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The record was already in a terminal state; nothing to do.
    AlreadyTerminal,
    Skipped(SkipReason),
    /// Embedding count mismatch; chunks are `embedding_error`, the record
    /// is `error`.
    EmbeddingFailed,
    /// Chunks embedded and stored, but the vector store was unreachable;
    /// the sweeper finishes the job.
    PendingVector { chunks: usize },
    /// Fully indexed; attach jobs are on the queue.
    Processed { chunks: usize },
}

/// Pipeline failures that abort the pass (and drive job retry).
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("raw record {0} not found")]
    #[diagnostic(code(engram::pipeline::record_missing))]
    RecordMissing(RawRecordId),

    #[error(transparent)]
    #[diagnostic(code(engram::pipeline::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(engram::pipeline::llm))]
    Llm(#[from] LlmError),

    #[error(transparent)]
    #[diagnostic(code(engram::pipeline::vectors))]
    Vector(#[from] VectorError),
}

impl PipelineError {
    /// Whether the enclosing job should retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::RecordMissing(_) => false,
            PipelineError::Store(err) => matches!(err, StoreError::Backend(_)),
            PipelineError::Llm(err) => err.is_retryable(),
            PipelineError::Vector(err) => err.is_retryable(),
        }
    }
}

/// Orchestrates one record's journey from raw content to indexed chunks.
pub struct IngestionPipeline {
    store: Arc<dyn MemoryStore>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    evaluator: ImportanceEvaluator,
    chunker: Chunker,
    queues: Arc<QueueSet>,
    importance_threshold: f64,
    embedding_dim: usize,
    vector_batch_size: usize,
    settle_delay: Duration,
}

impl IngestionPipeline {
    #[must_use]
    pub fn new(
        store: Arc<dyn MemoryStore>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmClient>,
        queues: Arc<QueueSet>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            evaluator: ImportanceEvaluator::new(Arc::clone(&llm), &config.importance),
            llm,
            chunker: Chunker::new(config.chunking),
            queues,
            importance_threshold: config.importance.threshold,
            embedding_dim: config.embedding_dim,
            vector_batch_size: config.vector_batch_size.max(1),
            settle_delay: config.attach.settle_delay,
        }
    }

    /// Run the pipeline for one stored record.
    #[instrument(skip(self), fields(record_id = %record_id))]
    pub async fn process_record(
        &self,
        record_id: RawRecordId,
    ) -> Result<IngestOutcome, PipelineError> {
        let record = self
            .store
            .get_raw_record(record_id)
            .await?
            .ok_or(PipelineError::RecordMissing(record_id))?;

        if record.processing_status.is_terminal() {
            return Ok(IngestOutcome::AlreadyTerminal);
        }

        if record.content.trim().is_empty() {
            self.store
                .mark_record_status(record.id, RecordStatus::Skipped, Some("empty content"))
                .await?;
            return Ok(IngestOutcome::Skipped(SkipReason::EmptyContent));
        }

        // Importance gate (set at most once on the record).
        let score = match record.importance_score {
            Some(score) => Some(score),
            None => {
                let score = self
                    .evaluator
                    .evaluate(&record.content, record.content_type)
                    .await;
                if let Some(score) = score {
                    self.store.set_record_importance(record.id, score).await?;
                }
                score
            }
        };
        let passes_gate = match score {
            _ if record.skip_importance_check => true,
            Some(score) => score >= self.importance_threshold,
            None => false,
        };
        if !passes_gate {
            self.store
                .mark_record_status(
                    record.id,
                    RecordStatus::Skipped,
                    Some("below importance threshold"),
                )
                .await?;
            return Ok(IngestOutcome::Skipped(SkipReason::BelowImportanceGate));
        }
        let importance = score.unwrap_or(0.0);

        // Chunk rows: reuse rows from an earlier attempt so retries never
        // duplicate the graph.
        let mut chunks = self.store.chunks_for_record(record.id).await?;
        if chunks.is_empty() {
            let pieces = self.chunker.chunk(&record.content);
            if pieces.is_empty() {
                self.store
                    .mark_record_status(record.id, RecordStatus::Skipped, Some("nothing to chunk"))
                    .await?;
                return Ok(IngestOutcome::Skipped(SkipReason::NothingToChunk));
            }
            let metadata = ChunkMetadata {
                content_type: record.content_type,
                source_created_at: record.created_at,
                perspective_owner_id: record.perspective_owner_id.clone(),
                subject_id: record.subject_id.clone(),
                topic_key: record.topic_key.clone(),
                force_important: record.skip_importance_check,
            };
            let new_chunks = pieces
                .into_iter()
                .enumerate()
                .map(|(index, text)| NewChunk {
                    raw_record_id: record.id,
                    user_id: record.user_id.clone(),
                    session_id: record.session_id.clone(),
                    token_count: estimate_tokens(&text),
                    text,
                    index: index as u32,
                    importance_score: importance,
                    metadata: metadata.clone(),
                })
                .collect();
            chunks = self.store.insert_chunks(new_chunks).await?;
        }

        // One embedding batch for the whole record.
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = match self.embed_batch(&texts).await {
            Ok(embeddings) => embeddings,
            Err(LlmError::Malformed(message)) => {
                // Count mismatch or unusable payload: not retryable, fail
                // the record but keep the raw content.
                let ids: Vec<_> = chunks.iter().map(|c| c.id).collect();
                self.store
                    .set_chunks_status(&ids, ChunkStatus::EmbeddingError)
                    .await?;
                self.store
                    .mark_record_status(record.id, RecordStatus::Error, Some(&message))
                    .await?;
                return Ok(IngestOutcome::EmbeddingFailed);
            }
            Err(err) => return Err(err.into()),
        };

        // Persist authoritative vectors on the rows first; the shadow
        // index is rebuilt from these on any divergence.
        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            self.store.set_chunk_vector(chunk.id, embedding).await?;
        }

        let shadows: Vec<VectorObject> = chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, embedding)| {
                VectorObject::chunk(
                    chunk.id,
                    &chunk.user_id,
                    chunk.importance_score,
                    embedding.clone(),
                )
            })
            .collect();

        let ids: Vec<_> = chunks.iter().map(|c| c.id).collect();
        if let Err(err) = self.upsert_shadows(VectorClass::ChunkEmbedding, shadows).await {
            if err.is_retryable() {
                warn!(error = %err, "vector store unreachable, parking chunks pending_vector");
                self.store
                    .set_chunks_status(&ids, ChunkStatus::PendingVector)
                    .await?;
                // Record intentionally stays pending for the sweeper.
                return Ok(IngestOutcome::PendingVector { chunks: ids.len() });
            }
            return Err(err.into());
        }

        self.store
            .set_chunks_status(&ids, ChunkStatus::Processed)
            .await?;
        self.store
            .mark_record_status(record.id, RecordStatus::Processed, None)
            .await?;

        // Attach jobs go out in index order, delayed so the vector index
        // settles before the first read.
        for chunk in &chunks {
            self.queues.enqueue_after(
                Job::AttachEpisode {
                    chunk_id: chunk.id,
                    user_id: record.user_id.clone(),
                },
                self.settle_delay,
            );
        }

        info!(chunks = chunks.len(), "record processed");
        Ok(IngestOutcome::Processed {
            chunks: chunks.len(),
        })
    }

    /// Embed with the provider, normalizing every vector to the configured
    /// dimension. A count mismatch surfaces as [`LlmError::Malformed`].
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let embeddings = self.llm.embed_batch(texts).await?;
        if embeddings.len() != texts.len() {
            return Err(LlmError::Malformed(format!(
                "embedding count mismatch: {} texts, {} vectors",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings
            .into_iter()
            .map(|v| align_to_dim(&v, self.embedding_dim))
            .collect())
    }

    async fn upsert_shadows(
        &self,
        class: VectorClass,
        shadows: Vec<VectorObject>,
    ) -> Result<(), VectorError> {
        for batch in shadows.chunks(self.vector_batch_size) {
            self.vectors.upsert_batch(class, batch.to_vec()).await?;
        }
        Ok(())
    }

    /// Re-upsert `pending_vector` chunks from their authoritative DB rows,
    /// promote completed records, and re-drive pending records whose
    /// ingest job was lost.
    #[instrument(skip(self))]
    pub async fn sweep_pending(&self) -> Result<usize, PipelineError> {
        let parked = self
            .store
            .chunks_with_status(ChunkStatus::PendingVector, 500)
            .await?;
        let mut recovered = 0usize;
        let mut touched_records = Vec::new();

        for chunk in parked {
            let Some(vector) = chunk.vector.clone() else {
                // No authoritative copy; send the chunk back through the
                // embedding stage via its record.
                warn!(chunk_id = %chunk.id, "pending_vector chunk has no stored vector");
                continue;
            };
            let shadow = VectorObject::chunk(
                chunk.id,
                &chunk.user_id,
                chunk.importance_score,
                align_to_dim(&vector, self.embedding_dim),
            );
            match self
                .vectors
                .upsert_batch(VectorClass::ChunkEmbedding, vec![shadow])
                .await
            {
                Ok(()) => {
                    self.store
                        .set_chunks_status(&[chunk.id], ChunkStatus::Processed)
                        .await?;
                    self.queues.enqueue_after(
                        Job::AttachEpisode {
                            chunk_id: chunk.id,
                            user_id: chunk.user_id.clone(),
                        },
                        self.settle_delay,
                    );
                    touched_records.push(chunk.raw_record_id);
                    recovered += 1;
                }
                Err(err) if err.is_retryable() => {
                    // Still unreachable; try again next tick.
                    warn!(error = %err, "vector store still unavailable during sweep");
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        touched_records.sort();
        touched_records.dedup();
        for record_id in touched_records {
            self.store.mark_record_processed_if_complete(record_id).await?;
        }

        // Records whose ingest job never ran (e.g. process restart between
        // insert and enqueue) get a fresh job.
        for record in self.store.pending_records(100).await? {
            let chunks = self.store.chunks_for_record(record.id).await?;
            if chunks.is_empty() {
                self.queues.enqueue(Job::Ingest {
                    record_id: record.id,
                });
            }
        }

        Ok(recovered)
    }

    /// Rebuild a user's shadow objects from the authoritative rows.
    #[instrument(skip(self))]
    pub async fn rebuild_user_vectors(&self, user_id: &str) -> Result<usize, PipelineError> {
        let mut upserted = 0usize;

        let chunk_shadows: Vec<VectorObject> = self
            .store
            .chunks_with_vectors(user_id)
            .await?
            .into_iter()
            .filter_map(|chunk| {
                let vector = chunk.vector.as_deref()?;
                Some(VectorObject::chunk(
                    chunk.id,
                    &chunk.user_id,
                    chunk.importance_score,
                    align_to_dim(vector, self.embedding_dim),
                ))
            })
            .collect();
        upserted += chunk_shadows.len();
        self.upsert_shadows(VectorClass::ChunkEmbedding, chunk_shadows)
            .await?;

        let episode_shadows: Vec<VectorObject> = self
            .store
            .episodes_for_user(user_id)
            .await?
            .into_iter()
            .map(|episode| {
                VectorObject::episode(
                    episode.id,
                    &episode.user_id,
                    align_to_dim(&episode.centroid, self.embedding_dim),
                )
            })
            .collect();
        upserted += episode_shadows.len();
        self.upsert_shadows(VectorClass::EpisodeEmbedding, episode_shadows)
            .await?;

        let thought_shadows: Vec<VectorObject> = self
            .store
            .thoughts_for_user(user_id)
            .await?
            .into_iter()
            .map(|thought| {
                VectorObject::thought(
                    thought.id,
                    &thought.user_id,
                    thought.importance,
                    align_to_dim(&thought.vector, self.embedding_dim),
                )
            })
            .collect();
        upserted += thought_shadows.len();
        self.upsert_shadows(VectorClass::ThoughtEmbedding, thought_shadows)
            .await?;

        Ok(upserted)
    }
}
