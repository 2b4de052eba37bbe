//! Canonical entities and their persistence contract.
//!
//! The relational store is the source of truth for identity and
//! relationships; vector shadows are a rebuildable index. This module owns
//! the entity types ([`RawRecord`], [`Chunk`], [`Episode`], [`Thought`] and
//! their links), the [`MemoryStore`] trait the pipeline programs against,
//! and the shipped sqlx SQLite implementation.
//!
//! # Lifecycle invariants
//!
//! - A raw record's status only moves `pending → {processed|skipped|error}`
//!   and never leaves a terminal state; its importance is set at most once.
//! - Chunk order within a record is dense and stable (`chunk_index` starts
//!   at 0 and increments by 1).
//! - A `ChunkEpisode` link never spans users; the store refuses the write.
//! - Episode centroids are recomputed inside the same transaction as the
//!   link insert, from the membership count in `chunk_episodes`.

pub mod sqlite;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ChunkId, ChunkStatus, ContentType, EpisodeId, RawRecordId, RecordStatus, SessionId, ThoughtId,
    UserId,
};

pub use sqlite::SqliteMemoryStore;
pub use store::{MemoryStore, StoreError};

/// A single ingested item, exactly as the collaborator handed it over.
#[derive(Clone, Debug)]
pub struct RawRecord {
    pub id: RawRecordId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub content_type: ContentType,
    pub content: String,
    pub perspective_owner_id: String,
    pub subject_id: String,
    pub topic_key: Option<String>,
    pub importance_score: Option<f64>,
    pub processing_status: RecordStatus,
    pub skip_importance_check: bool,
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
}

/// Collaborator-facing input for [`MemoryStore::insert_raw_record`].
///
/// Perspective owner and subject default to the user; uploads typically set
/// `skip_importance_check` so extracted document content bypasses the gate.
#[derive(Clone, Debug)]
pub struct RawRecordDraft {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub content_type: ContentType,
    pub content: String,
    pub perspective_owner_id: Option<String>,
    pub subject_id: Option<String>,
    pub topic_key: Option<String>,
    pub importance_score: Option<f64>,
    pub skip_importance_check: bool,
    /// Optional idempotency key; a duplicate insert returns the existing
    /// record instead of creating a parallel graph.
    pub dedup_key: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl RawRecordDraft {
    pub fn new(
        user_id: impl Into<UserId>,
        session_id: impl Into<SessionId>,
        content_type: ContentType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            content_type,
            content: content.into(),
            perspective_owner_id: None,
            subject_id: None,
            topic_key: None,
            importance_score: None,
            skip_importance_check: false,
            dedup_key: None,
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_topic_key(mut self, topic_key: impl Into<String>) -> Self {
        self.topic_key = Some(topic_key.into());
        self
    }

    #[must_use]
    pub fn with_importance(mut self, score: f64) -> Self {
        self.importance_score = Some(score);
        self
    }

    #[must_use]
    pub fn with_skip_importance_check(mut self, skip: bool) -> Self {
        self.skip_importance_check = skip;
        self
    }

    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_perspective(
        mut self,
        owner: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        self.perspective_owner_id = Some(owner.into());
        self.subject_id = Some(subject.into());
        self
    }
}

/// Structured chunk metadata.
///
/// A fixed record instead of an ad hoc map: the boundary validates it once
/// and everything downstream gets typed fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub content_type: ContentType,
    pub source_created_at: DateTime<Utc>,
    pub perspective_owner_id: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_key: Option<String>,
    /// The parent record bypassed the ingestion importance gate (set only
    /// for uploaded document content). Provenance only; no later decision
    /// keys off it.
    #[serde(default)]
    pub force_important: bool,
}

/// A semantic slice of one raw record; the unit of embedding and retrieval.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub id: ChunkId,
    pub raw_record_id: RawRecordId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub text: String,
    /// 0-based, dense and stable within the parent record.
    pub index: u32,
    pub token_count: u32,
    /// Inherited from the parent record at creation time.
    pub importance_score: f64,
    pub vector: Option<Vec<f32>>,
    pub processing_status: ChunkStatus,
    pub metadata: ChunkMetadata,
    pub created_at: DateTime<Utc>,
}

/// Input for a chunk row; ids and timestamps are assigned by the store.
#[derive(Clone, Debug)]
pub struct NewChunk {
    pub raw_record_id: RawRecordId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub text: String,
    pub index: u32,
    pub token_count: u32,
    pub importance_score: f64,
    pub metadata: ChunkMetadata,
}

/// A coherent, user-scoped cluster of chunks with a generated narrative.
#[derive(Clone, Debug)]
pub struct Episode {
    pub id: EpisodeId,
    pub user_id: UserId,
    pub title: String,
    pub narrative: String,
    /// Arithmetic mean of all linked chunk vectors.
    pub centroid: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Input for an episode row.
#[derive(Clone, Debug)]
pub struct NewEpisode {
    pub user_id: UserId,
    pub title: String,
    pub narrative: String,
    pub centroid: Vec<f32>,
}

/// A cross-episode insight.
#[derive(Clone, Debug)]
pub struct Thought {
    pub id: ThoughtId,
    pub user_id: UserId,
    pub name: String,
    pub description: String,
    pub vector: Vec<f32>,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
}

/// Input for a thought row.
#[derive(Clone, Debug)]
pub struct NewThought {
    pub user_id: UserId,
    pub name: String,
    pub description: String,
    pub vector: Vec<f32>,
    pub importance: f64,
}

/// Weighted link between a thought and one of its source episodes.
#[derive(Clone, Debug)]
pub struct EpisodeThoughtLink {
    pub episode_id: EpisodeId,
    pub thought_id: ThoughtId,
    /// Cosine similarity between the thought vector and the episode
    /// centroid at creation time; 0.5 when the dimensions disagreed.
    pub weight: f64,
}

/// Result of a transactional chunk→episode link.
#[derive(Clone, Debug)]
pub struct AttachOutcome {
    /// False when the link already existed; the centroid is untouched then.
    pub inserted: bool,
    /// Episode member count after the operation.
    pub member_count: u64,
    /// Centroid after the operation.
    pub centroid: Vec<f32>,
}
