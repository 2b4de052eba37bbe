//! The persistence contract for canonical entities.
//!
//! `MemoryStore` is the only seam allowed to mutate canonical state. All
//! multi-row writes that must be observed together (link insert + centroid
//! update) happen inside one transaction in the implementation; vector
//! shadows are explicitly outside that transaction and reconciled by the
//! sweeper (DB wins).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use thiserror::Error;

use crate::types::{ChunkId, ChunkStatus, EpisodeId, RawRecordId, RecordStatus, ThoughtId, UserId};

use super::{
    AttachOutcome, Chunk, Episode, EpisodeThoughtLink, NewChunk, NewEpisode, NewThought,
    RawRecord, RawRecordDraft, Thought,
};

/// Errors surfaced by store implementations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("{what} not found")]
    #[diagnostic(code(engram::store::not_found))]
    NotFound { what: &'static str },

    /// A link would span two users; the write is refused.
    #[error("cross-user link refused: chunk belongs to {chunk_user}, episode to {episode_user}")]
    #[diagnostic(
        code(engram::store::user_mismatch),
        help("Episodes only ever contain chunks of their own user.")
    )]
    UserMismatch {
        chunk_user: UserId,
        episode_user: UserId,
    },

    /// Raw-record content or identity failed boundary validation.
    #[error("invalid input: {0}")]
    #[diagnostic(code(engram::store::invalid_input))]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    #[diagnostic(code(engram::store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    #[diagnostic(
        code(engram::store::backend),
        help("Check the database URL and that migrations have run.")
    )]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound { what: "row" },
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// CRUD and batch operations over the canonical entities.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    // ---- raw records ----

    /// Insert a pending raw record. When the draft carries a `dedup_key`
    /// that already exists, the existing record is returned unchanged.
    async fn insert_raw_record(&self, draft: RawRecordDraft) -> Result<RawRecord, StoreError>;

    async fn get_raw_record(&self, id: RawRecordId) -> Result<Option<RawRecord>, StoreError>;

    /// Record the importance score, once. A record that already carries a
    /// score keeps it.
    async fn set_record_importance(&self, id: RawRecordId, score: f64) -> Result<(), StoreError>;

    /// Transition a pending record to `status`. Terminal records are left
    /// untouched (the transition silently no-ops), preserving the
    /// monotonic state machine.
    async fn mark_record_status(
        &self,
        id: RawRecordId,
        status: RecordStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Append/replace the error note without touching the status. The one
    /// mutation allowed after a record reaches a terminal state.
    async fn record_error_note(&self, id: RawRecordId, error: &str) -> Result<(), StoreError>;

    /// Mark a pending record processed once none of its chunks remain in a
    /// transitional status. Returns true when the transition happened.
    async fn mark_record_processed_if_complete(
        &self,
        id: RawRecordId,
    ) -> Result<bool, StoreError>;

    // ---- chunks ----

    /// Insert chunk rows with status `pending`. Indexes are taken from the
    /// input and must be dense per record.
    async fn insert_chunks(&self, chunks: Vec<NewChunk>) -> Result<Vec<Chunk>, StoreError>;

    async fn get_chunk(&self, id: ChunkId) -> Result<Option<Chunk>, StoreError>;

    /// Persist the embedding on the chunk row (authoritative copy).
    async fn set_chunk_vector(&self, id: ChunkId, vector: &[f32]) -> Result<(), StoreError>;

    async fn set_chunks_status(
        &self,
        ids: &[ChunkId],
        status: ChunkStatus,
    ) -> Result<(), StoreError>;

    async fn chunks_for_record(&self, record_id: RawRecordId) -> Result<Vec<Chunk>, StoreError>;

    /// Chunks of `user_id` not linked to any episode, oldest first.
    async fn orphan_chunks(&self, user_id: &str) -> Result<Vec<Chunk>, StoreError>;

    /// Chunks currently in `status`, oldest first, across users. Drives the
    /// pending-vector sweeper.
    async fn chunks_with_status(
        &self,
        status: ChunkStatus,
        limit: usize,
    ) -> Result<Vec<Chunk>, StoreError>;

    /// Chunks linked to an episode, by link insertion order.
    async fn chunks_for_episode(
        &self,
        episode_id: EpisodeId,
        limit: usize,
    ) -> Result<Vec<Chunk>, StoreError>;

    // ---- episodes ----

    async fn insert_episode(&self, episode: NewEpisode) -> Result<Episode, StoreError>;

    async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>, StoreError>;

    /// The user's newest episodes created at or after `since`.
    async fn recent_episodes(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Episode>, StoreError>;

    /// The user's newest episodes regardless of age.
    async fn latest_episodes(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Episode>, StoreError>;

    /// Transactionally link a chunk to an episode and fold `chunk_vector`
    /// into the centroid with the online mean rule. The membership count is
    /// derived from `chunk_episodes` inside the same transaction. Linking
    /// an already-linked pair is a no-op with `inserted == false`.
    ///
    /// Refuses cross-user links with [`StoreError::UserMismatch`].
    async fn attach_chunk_to_episode(
        &self,
        chunk_id: ChunkId,
        episode_id: EpisodeId,
        chunk_vector: &[f32],
    ) -> Result<AttachOutcome, StoreError>;

    /// Transactionally link a batch of chunks to a freshly consolidated
    /// episode whose centroid was computed from the full member set.
    async fn link_chunks_bulk(
        &self,
        episode_id: EpisodeId,
        chunk_ids: &[ChunkId],
    ) -> Result<(), StoreError>;

    async fn episode_member_count(&self, episode_id: EpisodeId) -> Result<u64, StoreError>;

    // ---- thoughts ----

    async fn insert_thought(&self, thought: NewThought) -> Result<Thought, StoreError>;

    async fn get_thought(&self, id: ThoughtId) -> Result<Option<Thought>, StoreError>;

    async fn link_episode_thought(&self, link: EpisodeThoughtLink) -> Result<(), StoreError>;

    async fn thought_links(
        &self,
        thought_id: ThoughtId,
    ) -> Result<Vec<EpisodeThoughtLink>, StoreError>;

    /// Episode ids of `user_id` that already link to at least one thought.
    /// Re-running generation skips clusters made only of these.
    async fn episode_ids_with_thoughts(
        &self,
        user_id: &str,
    ) -> Result<Vec<EpisodeId>, StoreError>;

    // ---- maintenance ----

    /// Every user id that owns raw records. Drives the nightly scheduler.
    async fn list_user_ids(&self) -> Result<Vec<UserId>, StoreError>;

    /// Raw records still pending, oldest first; the sweeper re-drives them.
    async fn pending_records(&self, limit: usize) -> Result<Vec<RawRecord>, StoreError>;

    /// All of a user's chunks that carry a vector, for index rebuilds.
    async fn chunks_with_vectors(&self, user_id: &str) -> Result<Vec<Chunk>, StoreError>;

    /// All of a user's episodes, for index rebuilds.
    async fn episodes_for_user(&self, user_id: &str) -> Result<Vec<Episode>, StoreError>;

    /// All of a user's thoughts, for index rebuilds.
    async fn thoughts_for_user(&self, user_id: &str) -> Result<Vec<Thought>, StoreError>;

    /// Drain in-flight statements and close the underlying pool.
    async fn close(&self);
}
