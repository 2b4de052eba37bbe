//! Nightly thought generation: cross-episode insights.
//!
//! Runs per user on the daily schedule (and on manual trigger). Recent
//! episodes are greedily clustered by centroid similarity; each cluster is
//! summarized by the LLM into a named insight with its own importance,
//! embedded, persisted, and linked back to its source episodes with
//! cosine weights.
//!
//! Provider hiccups degrade per cluster, never per run: an unusable reply
//! skips that cluster and the rest proceed.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{EngineConfig, ThoughtConfig};
use crate::llm::{CompletionOptions, LlmClient, LlmError};
use crate::model::{Episode, EpisodeThoughtLink, MemoryStore, NewThought, StoreError};
use crate::prompts::{parse_thought_reply, thought_prompt};
use crate::vectors::math::{align_to_dim, cosine_similarity};
use crate::vectors::{VectorClass, VectorError, VectorObject, VectorStore};

/// What one generation pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThoughtReport {
    pub episodes_considered: usize,
    pub clusters: usize,
    pub thoughts_created: usize,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ThoughtError {
    #[error(transparent)]
    #[diagnostic(code(engram::thoughts::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(engram::thoughts::vectors))]
    Vector(#[from] VectorError),

    /// Embedding the insight text failed; the run retries as a whole.
    #[error(transparent)]
    #[diagnostic(code(engram::thoughts::llm))]
    Llm(#[from] LlmError),
}

impl ThoughtError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ThoughtError::Store(err) => matches!(err, StoreError::Backend(_)),
            ThoughtError::Vector(err) => err.is_retryable(),
            ThoughtError::Llm(err) => err.is_retryable(),
        }
    }
}

/// Cross-episode insight generator.
pub struct ThoughtGenerator {
    store: Arc<dyn MemoryStore>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    config: ThoughtConfig,
    embedding_dim: usize,
}

impl ThoughtGenerator {
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
            config: config.thoughts.clone(),
            embedding_dim: config.embedding_dim,
        }
    }

    /// Run one generation pass for `user_id`.
    #[instrument(skip(self))]
    pub async fn generate_for_user(&self, user_id: &str) -> Result<ThoughtReport, ThoughtError> {
        let episodes = self
            .store
            .latest_episodes(user_id, self.config.max_recent_episodes)
            .await?;
        let clusters = self.cluster_episodes(&episodes);
        let already_linked: rustc_hash::FxHashSet<_> = self
            .store
            .episode_ids_with_thoughts(user_id)
            .await?
            .into_iter()
            .collect();
        let mut report = ThoughtReport {
            episodes_considered: episodes.len(),
            clusters: clusters.len(),
            thoughts_created: 0,
        };

        for cluster in &clusters {
            // A cluster made entirely of episodes that already feed a
            // thought has nothing new to say; re-runs are idempotent.
            if cluster
                .iter()
                .all(|&i| already_linked.contains(&episodes[i].id))
            {
                debug!("cluster already covered by existing thoughts, skipping");
                continue;
            }
            let summaries = cluster
                .iter()
                .map(|&i| format!("{}\n{}", episodes[i].title, episodes[i].narrative))
                .collect::<Vec<_>>()
                .join("\n\n---\n\n");

            let reply = match self
                .llm
                .completion(
                    &thought_prompt(&summaries),
                    &CompletionOptions {
                        max_tokens: Some(512),
                        temperature: Some(0.5),
                        ..CompletionOptions::default()
                    },
                )
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(error = %err, "thought completion failed, skipping cluster");
                    continue;
                }
            };

            let Some(parsed) = parse_thought_reply(&reply) else {
                warn!("unusable thought reply, skipping cluster");
                continue;
            };
            if parsed.importance < self.config.min_importance {
                debug!(
                    importance = parsed.importance,
                    "thought below importance floor, skipping"
                );
                continue;
            }

            let embed_text = format!("{}: {}", parsed.name, parsed.description);
            let mut embedded = self.llm.embed_batch(&[embed_text]).await?;
            let Some(vector) = embedded.pop() else {
                warn!("embedding returned nothing for thought, skipping cluster");
                continue;
            };
            let vector = align_to_dim(&vector, self.embedding_dim);

            let thought = self
                .store
                .insert_thought(NewThought {
                    user_id: user_id.to_string(),
                    name: parsed.name,
                    description: parsed.description,
                    vector: vector.clone(),
                    importance: parsed.importance,
                })
                .await?;

            for &index in cluster {
                let episode = &episodes[index];
                // Weight from the raw centroid: a dimension mismatch is
                // informative and pins the weight to 0.5.
                let weight = cosine_similarity(&vector, &episode.centroid).unwrap_or(0.5);
                self.store
                    .link_episode_thought(EpisodeThoughtLink {
                        episode_id: episode.id,
                        thought_id: thought.id,
                        weight,
                    })
                    .await?;
            }

            self.vectors
                .upsert_batch(
                    VectorClass::ThoughtEmbedding,
                    vec![VectorObject::thought(
                        thought.id,
                        user_id,
                        thought.importance,
                        vector,
                    )],
                )
                .await?;

            info!(thought_id = %thought.id, episodes = cluster.len(), "thought created");
            report.thoughts_created += 1;
        }

        Ok(report)
    }

    /// Greedy clustering by centroid similarity: each unprocessed episode
    /// seeds a cluster and pulls in every other unprocessed episode at or
    /// above the similarity floor. Clusters below the size floor drop.
    fn cluster_episodes(&self, episodes: &[Episode]) -> Vec<Vec<usize>> {
        let n = episodes.len();
        let mut processed = vec![false; n];
        let mut clusters = Vec::new();

        for seed in 0..n {
            if processed[seed] {
                continue;
            }
            processed[seed] = true;
            let mut cluster = vec![seed];
            let seed_centroid = align_to_dim(&episodes[seed].centroid, self.embedding_dim);
            for other in 0..n {
                if processed[other] {
                    continue;
                }
                let other_centroid = align_to_dim(&episodes[other].centroid, self.embedding_dim);
                let Some(sim) = cosine_similarity(&seed_centroid, &other_centroid) else {
                    continue;
                };
                if sim >= self.config.episode_similarity_min {
                    processed[other] = true;
                    cluster.push(other);
                }
            }
            if cluster.len() >= self.config.min_episodes {
                clusters.push(cluster);
            }
        }
        clusters
    }
}
