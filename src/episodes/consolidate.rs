//! Batch consolidation of orphan chunks.
//!
//! Triggered per user when orphan events accumulate. Orphans with an
//! authoritative vector are density-clustered (DBSCAN over cosine
//! distance); each surviving cluster becomes an episode with an LLM
//! narrative and bulk chunk links. Noise points stay orphaned and get
//! another chance on the next trigger, which makes repeated runs with no
//! new orphans naturally idempotent.
//!
//! Per-user serialization is enforced upstream: consolidation jobs carry a
//! user-keyed coalescing key and drain through a single worker.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::{ConsolidationConfig, EngineConfig};
use crate::llm::LlmClient;
use crate::model::{Chunk, MemoryStore, NewEpisode, StoreError};
use crate::vectors::math::{align_to_dim, l2_normalize, mean_vector};
use crate::vectors::{VectorClass, VectorError, VectorObject, VectorStore};

use super::dbscan::{DbscanParams, cluster};

/// What one consolidation pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Orphans with a usable vector that entered clustering.
    pub orphans_considered: usize,
    pub episodes_created: usize,
    /// Points left unclustered this pass.
    pub noise: usize,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConsolidateError {
    #[error(transparent)]
    #[diagnostic(code(engram::consolidate::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(engram::consolidate::vectors))]
    Vector(#[from] VectorError),
}

impl ConsolidateError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsolidateError::Store(err) => matches!(err, StoreError::Backend(_)),
            ConsolidateError::Vector(err) => err.is_retryable(),
        }
    }
}

/// Orphan-chunk clustering into episodes.
pub struct Consolidator {
    store: Arc<dyn MemoryStore>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    config: ConsolidationConfig,
    embedding_dim: usize,
}

impl Consolidator {
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
            config: config.consolidation,
            embedding_dim: config.embedding_dim,
        }
    }

    /// Run one consolidation pass for `user_id`.
    #[instrument(skip(self))]
    pub async fn consolidate_user(
        &self,
        user_id: &str,
    ) -> Result<ConsolidationReport, ConsolidateError> {
        let orphans = self.store.orphan_chunks(user_id).await?;

        // Only chunks whose authoritative vector is present can cluster.
        let mut members: Vec<&Chunk> = Vec::new();
        let mut vectors: Vec<Vec<f32>> = Vec::new();
        for chunk in &orphans {
            if let Some(vector) = &chunk.vector {
                members.push(chunk);
                vectors.push(align_to_dim(vector, self.embedding_dim));
            }
        }

        if members.len() < self.config.orphan_threshold {
            debug!(
                orphans = members.len(),
                threshold = self.config.orphan_threshold,
                "below consolidation threshold"
            );
            return Ok(ConsolidationReport {
                orphans_considered: members.len(),
                ..ConsolidationReport::default()
            });
        }

        let clusters = cluster(
            &vectors,
            DbscanParams {
                epsilon: self.config.dbscan_epsilon,
                min_points: self.config.dbscan_min_points,
            },
        );

        let clustered_points: usize = clusters.iter().map(Vec::len).sum();
        let mut created = 0usize;

        for cluster_members in clusters {
            let take = cluster_members
                .len()
                .min(self.config.max_chunks_per_episode);
            let selected = &cluster_members[..take];

            let Some(mut centroid) =
                mean_vector(&selected.iter().map(|&i| vectors[i].clone()).collect::<Vec<_>>())
            else {
                continue;
            };
            l2_normalize(&mut centroid);

            let member_text = self.concatenate_members(&members, selected);
            let (title, narrative) =
                super::generate_narrative(&self.llm, &member_text).await;

            let episode = self
                .store
                .insert_episode(NewEpisode {
                    user_id: user_id.to_string(),
                    title,
                    narrative,
                    centroid: centroid.clone(),
                })
                .await?;

            let chunk_ids: Vec<_> = selected.iter().map(|&i| members[i].id).collect();
            self.store.link_chunks_bulk(episode.id, &chunk_ids).await?;

            self.vectors
                .upsert_batch(
                    VectorClass::EpisodeEmbedding,
                    vec![VectorObject::episode(episode.id, user_id, centroid)],
                )
                .await?;

            info!(episode_id = %episode.id, chunks = chunk_ids.len(), "episode consolidated");
            created += 1;
        }

        Ok(ConsolidationReport {
            orphans_considered: members.len(),
            episodes_created: created,
            noise: members.len() - clustered_points,
        })
    }

    /// Member texts joined under the narrative prompt's character budget.
    fn concatenate_members(&self, members: &[&Chunk], selected: &[usize]) -> String {
        let mut joined = String::new();
        for &index in selected {
            if !joined.is_empty() {
                joined.push_str("\n\n");
            }
            joined.push_str(&members[index].text);
            if joined.chars().count() >= self.config.text_budget_chars {
                break;
            }
        }
        if joined.chars().count() > self.config.text_budget_chars {
            joined = joined.chars().take(self.config.text_budget_chars).collect();
        }
        joined
    }
}
