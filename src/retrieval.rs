//! Multi-stage semantic retrieval.
//!
//! One query embedding feeds three stages:
//!
//! 1. **Episodes**: nearest episode centroids; each hit contributes the
//!    episode itself (with narrative) plus up to ten linked chunks, which
//!    inherit 0.9× the episode's certainty;
//! 2. **Chunks**: if the candidate pool is still short of the limit, a
//!    direct chunk nearest-neighbor filtered by the importance floor;
//! 3. **Thoughts**: a lower-floor nearest-neighbor over insights, at
//!    most three.
//!
//! Candidates deduplicate by entity id (best similarity wins), rank by
//! similarity, and truncate to the limit. Every stage carries the
//! mandatory user filter, and every DB hydration re-checks ownership, so
//! a result can never cross users. Orphan shadows (vector hits without a
//! DB row) are silently skipped.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, RetrievalConfig};
use crate::llm::{LlmClient, LlmError};
use crate::model::{MemoryStore, StoreError};
use crate::types::EpisodeId;
use crate::vectors::math::align_to_dim;
use crate::vectors::{NearestQuery, VectorClass, VectorError, VectorStore};

/// What kind of memory a result row is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Episode,
    Chunk,
    Thought,
}

/// One ranked retrieval result.
#[derive(Clone, Debug)]
pub struct RetrievedMemory {
    pub kind: MemoryKind,
    pub id: Uuid,
    /// Episode title or thought name; chunks have none of their own.
    pub title: Option<String>,
    /// Narrative, chunk text, or thought description.
    pub content: String,
    pub similarity: f64,
    /// For chunks surfaced through an episode: the episode's identity.
    pub episode_id: Option<EpisodeId>,
    pub episode_title: Option<String>,
}

/// Per-call options; unset fields fall back to the configured defaults.
#[derive(Clone, Copy, Debug)]
pub struct RetrieveOptions {
    pub limit: Option<usize>,
    pub min_importance: Option<f64>,
    pub certainty: Option<f64>,
    pub include_episodes: bool,
    pub include_chunks: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            limit: None,
            min_importance: None,
            certainty: None,
            include_episodes: true,
            include_chunks: true,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RetrieveError {
    #[error(transparent)]
    #[diagnostic(code(engram::retrieval::llm))]
    Llm(#[from] LlmError),

    #[error(transparent)]
    #[diagnostic(code(engram::retrieval::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(engram::retrieval::vectors))]
    Vector(#[from] VectorError),
}

/// Three-stage retriever.
pub struct Retriever {
    store: Arc<dyn MemoryStore>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    config: RetrievalConfig,
    embedding_dim: usize,
}

impl Retriever {
    #[must_use]
    pub fn new(
        store: Arc<dyn MemoryStore>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmClient>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            llm,
            config: config.retrieval,
            embedding_dim: config.embedding_dim,
        }
    }

    /// Rank a user's memories against a free-text query.
    #[instrument(skip(self, query), fields(user_id))]
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievedMemory>, RetrieveError> {
        if query.trim().is_empty() || user_id.trim().is_empty() {
            return Ok(Vec::new());
        }

        let limit = options.limit.unwrap_or(self.config.limit).max(1);
        let min_importance = options.min_importance.unwrap_or(self.config.min_importance);
        let certainty = options.certainty.unwrap_or(self.config.certainty);

        // One embedding serves all three classes.
        let mut embedded = self.llm.embed_batch(&[query.to_string()]).await?;
        let Some(query_vector) = embedded.pop() else {
            warn!("query embedding came back empty");
            return Ok(Vec::new());
        };
        let query_vector = align_to_dim(&query_vector, self.embedding_dim);

        let mut candidates: Vec<RetrievedMemory> = Vec::new();

        if options.include_episodes {
            self.episode_stage(user_id, &query_vector, limit, certainty, &mut candidates)
                .await?;
        }

        if options.include_chunks && candidates.len() < limit {
            let remaining = limit - candidates.len();
            self.chunk_stage(
                user_id,
                &query_vector,
                remaining,
                certainty,
                min_importance,
                &mut candidates,
            )
            .await?;
        }

        self.thought_stage(user_id, &query_vector, certainty, &mut candidates)
            .await?;

        // Best similarity wins on duplicate entities.
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut seen: FxHashSet<Uuid> = FxHashSet::default();
        candidates.retain(|item| seen.insert(item.id));
        candidates.truncate(limit);

        debug!(results = candidates.len(), "retrieval complete");
        Ok(candidates)
    }

    async fn episode_stage(
        &self,
        user_id: &str,
        query_vector: &[f32],
        limit: usize,
        certainty: f64,
        candidates: &mut Vec<RetrievedMemory>,
    ) -> Result<(), RetrieveError> {
        let hits = self
            .vectors
            .nearest(
                VectorClass::EpisodeEmbedding,
                query_vector,
                &NearestQuery::new(user_id, limit, certainty),
            )
            .await?;

        for hit in hits {
            let Some(episode_id) = hit.back_ref(VectorClass::EpisodeEmbedding) else {
                continue;
            };
            let Some(episode) = self.store.get_episode(episode_id).await? else {
                // Orphan shadow: the index outlived the row.
                continue;
            };
            if episode.user_id != user_id {
                warn!(episode_id = %episode.id, "episode shadow crossed users, skipping");
                continue;
            }

            candidates.push(RetrievedMemory {
                kind: MemoryKind::Episode,
                id: episode.id,
                title: Some(episode.title.clone()),
                content: episode.narrative.clone(),
                similarity: hit.certainty,
                episode_id: None,
                episode_title: None,
            });

            let linked = self
                .store
                .chunks_for_episode(episode.id, self.config.episode_chunk_fanout)
                .await?;
            for chunk in linked {
                candidates.push(RetrievedMemory {
                    kind: MemoryKind::Chunk,
                    id: chunk.id,
                    title: None,
                    content: chunk.text,
                    similarity: hit.certainty * self.config.episode_chunk_similarity_scale,
                    episode_id: Some(episode.id),
                    episode_title: Some(episode.title.clone()),
                });
            }
        }
        Ok(())
    }

    async fn chunk_stage(
        &self,
        user_id: &str,
        query_vector: &[f32],
        remaining: usize,
        certainty: f64,
        min_importance: f64,
        candidates: &mut Vec<RetrievedMemory>,
    ) -> Result<(), RetrieveError> {
        let hits = self
            .vectors
            .nearest(
                VectorClass::ChunkEmbedding,
                query_vector,
                &NearestQuery::new(user_id, remaining, certainty)
                    .with_min_importance(min_importance),
            )
            .await?;

        for hit in hits {
            let Some(chunk_id) = hit.back_ref(VectorClass::ChunkEmbedding) else {
                continue;
            };
            let Some(chunk) = self.store.get_chunk(chunk_id).await? else {
                continue;
            };
            if chunk.user_id != user_id {
                warn!(chunk_id = %chunk.id, "chunk shadow crossed users, skipping");
                continue;
            }
            candidates.push(RetrievedMemory {
                kind: MemoryKind::Chunk,
                id: chunk.id,
                title: None,
                content: chunk.text,
                similarity: hit.certainty,
                episode_id: None,
                episode_title: None,
            });
        }
        Ok(())
    }

    async fn thought_stage(
        &self,
        user_id: &str,
        query_vector: &[f32],
        certainty: f64,
        candidates: &mut Vec<RetrievedMemory>,
    ) -> Result<(), RetrieveError> {
        let hits = self
            .vectors
            .nearest(
                VectorClass::ThoughtEmbedding,
                query_vector,
                &NearestQuery::new(
                    user_id,
                    self.config.thought_limit,
                    certainty * self.config.thought_certainty_scale,
                ),
            )
            .await?;

        for hit in hits {
            let Some(thought_id) = hit.back_ref(VectorClass::ThoughtEmbedding) else {
                continue;
            };
            let Some(thought) = self.store.get_thought(thought_id).await? else {
                continue;
            };
            if thought.user_id != user_id {
                warn!(thought_id = %thought.id, "thought shadow crossed users, skipping");
                continue;
            }
            candidates.push(RetrievedMemory {
                kind: MemoryKind::Thought,
                id: thought.id,
                title: Some(thought.name),
                content: thought.description,
                similarity: hit.certainty,
                episode_id: None,
                episode_title: None,
            });
        }
        Ok(())
    }
}
