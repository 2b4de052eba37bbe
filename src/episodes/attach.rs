//! Online episode attachment.
//!
//! Runs once per freshly indexed chunk. The decision ladder, in order:
//!
//! 1. **multi-attach**: every recent episode whose centroid similarity is
//!    at or above the multi-attach threshold gets a link;
//! 2. **primary attach**: otherwise the best candidate at or above the
//!    primary threshold gets the single link;
//! 3. **seed**: otherwise, if the best similarity is below the seed
//!    threshold and the chunk clears the importance gate, a new episode is
//!    born with the chunk vector as its centroid;
//! 4. **orphan**: otherwise the chunk stays unlinked and a consolidation
//!    trigger is queued for the user.
//!
//! Centroid updates ride the store's link transaction; the episode shadow
//! re-upsert afterwards is best-effort (DB wins, rebuild reconciles).

use std::sync::Arc;

use chrono::Utc;
use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{AttachConfig, EngineConfig};
use crate::llm::LlmClient;
use crate::model::{Episode, MemoryStore, NewEpisode, StoreError};
use crate::queue::{Job, QueueSet, RetryPolicy, with_policy};
use crate::types::{ChunkId, EpisodeId};
use crate::vectors::math::{align_to_dim, cosine_similarity};
use crate::vectors::{VectorClass, VectorError, VectorObject, VectorStore};

/// What the attacher decided for one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachDecision {
    MultiAttached(Vec<EpisodeId>),
    Attached(EpisodeId),
    Seeded(EpisodeId),
    Orphaned,
}

#[derive(Debug, Error, Diagnostic)]
pub enum AttachError {
    #[error("chunk {0} not found")]
    #[diagnostic(code(engram::attach::chunk_missing))]
    ChunkMissing(ChunkId),

    /// The chunk's vector never became visible in the vector store.
    #[error("vector for chunk {0} not yet visible")]
    #[diagnostic(
        code(engram::attach::vector_not_visible),
        help("The upsert may still be settling; the job retries with backoff.")
    )]
    VectorNotVisible(ChunkId),

    #[error(transparent)]
    #[diagnostic(code(engram::attach::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(engram::attach::vectors))]
    Vector(#[from] VectorError),
}

impl AttachError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            AttachError::ChunkMissing(_) => false,
            AttachError::VectorNotVisible(_) => true,
            AttachError::Store(err) => matches!(err, StoreError::Backend(_)),
            AttachError::Vector(err) => err.is_retryable(),
        }
    }
}

enum FetchError {
    Miss,
    Store(VectorError),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Miss => f.write_str("vector not yet visible"),
            FetchError::Store(err) => err.fmt(f),
        }
    }
}

/// Per-chunk episode membership decider.
pub struct EpisodeAttacher {
    store: Arc<dyn MemoryStore>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    queues: Arc<QueueSet>,
    config: AttachConfig,
    embedding_dim: usize,
    importance_threshold: f64,
}

impl EpisodeAttacher {
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
            llm,
            queues,
            config: config.attach,
            embedding_dim: config.embedding_dim,
            importance_threshold: config.importance.threshold,
        }
    }

    /// Decide episode membership for one chunk.
    #[instrument(skip(self), fields(chunk_id = %chunk_id, user_id))]
    pub async fn attach(&self, chunk_id: ChunkId, user_id: &str) -> Result<AttachDecision, AttachError> {
        let chunk = self
            .store
            .get_chunk(chunk_id)
            .await?
            .ok_or(AttachError::ChunkMissing(chunk_id))?;
        if chunk.user_id != user_id {
            // A mis-addressed job never crosses user boundaries.
            return Err(AttachError::ChunkMissing(chunk_id));
        }

        let vector = self.fetch_chunk_vector(chunk_id).await?;
        let vector = align_to_dim(&vector, self.embedding_dim);

        let since = Utc::now()
            - chrono::Duration::from_std(self.config.episode_time_window)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let candidates = self
            .store
            .recent_episodes(user_id, since, self.config.max_candidates)
            .await?;

        let scored = self.score_candidates(&vector, &candidates);
        let best_similarity = scored
            .iter()
            .map(|(_, sim)| *sim)
            .fold(None, |best: Option<f64>, sim| {
                Some(best.map_or(sim, |b| b.max(sim)))
            });

        // Every episode at or above the multi-attach band absorbs the
        // chunk; the centroid folds the vector in once per link.
        let qualifying: Vec<&Episode> = scored
            .iter()
            .filter(|(_, sim)| *sim >= self.config.multi_attach)
            .map(|(episode, _)| *episode)
            .collect();
        match qualifying.len() {
            1 => {
                let episode = qualifying[0];
                self.link(chunk_id, episode, &vector).await?;
                debug!(episode_id = %episode.id, best = ?best_similarity, "chunk attached");
                return Ok(AttachDecision::Attached(episode.id));
            }
            n if n > 1 => {
                let mut linked = Vec::with_capacity(n);
                for episode in qualifying {
                    self.link(chunk_id, episode, &vector).await?;
                    linked.push(episode.id);
                }
                info!(count = linked.len(), "chunk multi-attached");
                return Ok(AttachDecision::MultiAttached(linked));
            }
            _ => {}
        }

        // Below the multi band: a best candidate clearing the primary
        // threshold still takes the chunk (meaningful when configured
        // with primary below multi, the older operating point).
        if let Some((episode, sim)) = scored
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            if *sim >= self.config.primary_attach {
                self.link(chunk_id, episode, &vector).await?;
                debug!(episode_id = %episode.id, similarity = *sim, "chunk attached (primary)");
                return Ok(AttachDecision::Attached(episode.id));
            }
        }

        // force_important only bypasses the ingestion gate; seeding is
        // decided on the chunk's own importance.
        let important = chunk.importance_score >= self.importance_threshold;
        let far_from_everything =
            best_similarity.is_none_or(|sim| sim < self.config.seed_threshold);

        if far_from_everything && important {
            let episode_id = self.seed_episode(chunk_id, &chunk.text, user_id, &vector).await?;
            info!(episode_id = %episode_id, "chunk seeded a new episode");
            return Ok(AttachDecision::Seeded(episode_id));
        }

        // In the dead band (or unimportant): leave orphaned and let the
        // consolidator look at the user's backlog.
        self.queues.enqueue(Job::Consolidate {
            user_id: user_id.to_string(),
        });
        debug!(best = ?best_similarity, "chunk orphaned");
        Ok(AttachDecision::Orphaned)
    }

    /// Read the chunk's vector from the store, retrying while the upsert
    /// settles.
    async fn fetch_chunk_vector(&self, chunk_id: ChunkId) -> Result<Vec<f32>, AttachError> {
        let policy = RetryPolicy::new(
            self.config.vector_fetch_attempts.max(1),
            std::time::Duration::from_millis(500),
        )
        .with_jitter();
        let vectors = &self.vectors;
        let result = with_policy(
            policy,
            |err: &FetchError| match err {
                FetchError::Miss => true,
                FetchError::Store(e) => e.is_retryable(),
            },
            || async move {
                match vectors.fetch(VectorClass::ChunkEmbedding, chunk_id).await {
                    Ok(Some(object)) => Ok(object.vector),
                    Ok(None) => Err(FetchError::Miss),
                    Err(err) => Err(FetchError::Store(err)),
                }
            },
        )
        .await;
        match result {
            Ok(vector) => Ok(vector),
            Err(FetchError::Miss) => Err(AttachError::VectorNotVisible(chunk_id)),
            Err(FetchError::Store(err)) => Err(AttachError::Vector(err)),
        }
    }

    /// Similarities against candidate centroids; undecodable centroids are
    /// skipped, not fatal.
    fn score_candidates<'a>(
        &self,
        vector: &[f32],
        candidates: &'a [Episode],
    ) -> Vec<(&'a Episode, f64)> {
        candidates
            .iter()
            .filter_map(|episode| {
                if episode.centroid.is_empty() {
                    warn!(episode_id = %episode.id, "episode has an empty centroid, skipping");
                    return None;
                }
                let centroid = align_to_dim(&episode.centroid, self.embedding_dim);
                match cosine_similarity(vector, &centroid) {
                    Some(sim) => Some((episode, sim)),
                    None => {
                        warn!(episode_id = %episode.id, "centroid dimension mismatch, skipping");
                        None
                    }
                }
            })
            .collect()
    }

    /// Link and refresh the episode's shadow with the updated centroid.
    async fn link(
        &self,
        chunk_id: ChunkId,
        episode: &Episode,
        vector: &[f32],
    ) -> Result<(), AttachError> {
        let outcome = self
            .store
            .attach_chunk_to_episode(chunk_id, episode.id, vector)
            .await?;
        if outcome.inserted {
            self.refresh_episode_shadow(episode.id, &episode.user_id, outcome.centroid)
                .await;
        }
        Ok(())
    }

    /// Create an episode around the chunk: centroid starts as the chunk
    /// vector and the founding link takes membership from 0 to 1.
    async fn seed_episode(
        &self,
        chunk_id: ChunkId,
        chunk_text: &str,
        user_id: &str,
        vector: &[f32],
    ) -> Result<EpisodeId, AttachError> {
        let (title, narrative) = super::generate_narrative(&self.llm, chunk_text).await;
        let episode = self
            .store
            .insert_episode(NewEpisode {
                user_id: user_id.to_string(),
                title,
                narrative,
                centroid: vector.to_vec(),
            })
            .await?;
        self.store
            .attach_chunk_to_episode(chunk_id, episode.id, vector)
            .await?;
        self.refresh_episode_shadow(episode.id, user_id, vector.to_vec())
            .await;
        Ok(episode.id)
    }

    /// Best-effort shadow refresh; the DB centroid is authoritative and
    /// the rebuild path reconciles on divergence.
    async fn refresh_episode_shadow(&self, episode_id: EpisodeId, user_id: &str, centroid: Vec<f32>) {
        let shadow = VectorObject::episode(
            episode_id,
            user_id,
            align_to_dim(&centroid, self.embedding_dim),
        );
        if let Err(err) = self
            .vectors
            .upsert_batch(VectorClass::EpisodeEmbedding, vec![shadow])
            .await
        {
            warn!(episode_id = %episode_id, error = %err, "episode shadow refresh failed");
        }
    }
}
