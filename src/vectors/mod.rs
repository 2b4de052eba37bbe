//! Vector-store adapter: typed classes, shadow objects, and the
//! [`VectorStore`] trait the engine programs against.
//!
//! The relational store owns identity and relationships; the vector store
//! is a rebuildable index of embedding shadows. Three classes are written
//! by the core: [`VectorClass::ChunkEmbedding`], [`VectorClass::EpisodeEmbedding`],
//! and [`VectorClass::ThoughtEmbedding`], each carrying a back-reference to its
//! DB row, the owning `userId`, and an `importance` projection for filtered
//! queries. Two further classes are bootstrapped but reserved for external
//! collaborators and never written here.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │ VectorStore trait │
//!                  │   (async CRUD)    │
//!                  └────────┬──────────┘
//!                           │
//!              ┌────────────┴────────────┐
//!              ▼                         ▼
//!     ┌────────────────┐       ┌─────────────────┐
//!     │ InMemoryVector │       │    (external)   │
//!     │     Index      │       │ Weaviate/pgvec… │
//!     └────────────────┘       └─────────────────┘
//! ```
//!
//! Every query carries a mandatory `userId` filter; cross-user reads are
//! unrepresentable at this seam. An orphan shadow (no DB row behind the
//! back-reference) is a read-time skip for callers, never an error.

pub mod math;
pub mod memory;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryVectorIndex;

/// Property key carrying the owning user on every shadow object.
pub const PROP_USER_ID: &str = "userId";
/// Property key carrying the importance projection.
pub const PROP_IMPORTANCE: &str = "importance";

/// The typed classes the store hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VectorClass {
    ChunkEmbedding,
    EpisodeEmbedding,
    ThoughtEmbedding,
    /// Reserved for a future knowledge-graph collaborator; bootstrapped,
    /// never written by the core.
    KnowledgeNode,
    /// Reserved; see [`VectorClass::KnowledgeNode`].
    Relationship,
}

impl VectorClass {
    /// Stable class name used by adapters as table/collection identifier.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            VectorClass::ChunkEmbedding => "ChunkEmbedding",
            VectorClass::EpisodeEmbedding => "EpisodeEmbedding",
            VectorClass::ThoughtEmbedding => "ThoughtEmbedding",
            VectorClass::KnowledgeNode => "KnowledgeNode",
            VectorClass::Relationship => "Relationship",
        }
    }

    /// Property holding the relational back-reference for this class.
    /// Reserved classes have no back-reference.
    #[must_use]
    pub fn back_ref_property(&self) -> Option<&'static str> {
        match self {
            VectorClass::ChunkEmbedding => Some("chunkDbId"),
            VectorClass::EpisodeEmbedding => Some("episodeDbId"),
            VectorClass::ThoughtEmbedding => Some("thoughtDbId"),
            VectorClass::KnowledgeNode | VectorClass::Relationship => None,
        }
    }

    /// Every class the schema bootstrap creates.
    #[must_use]
    pub fn all() -> [VectorClass; 5] {
        [
            VectorClass::ChunkEmbedding,
            VectorClass::EpisodeEmbedding,
            VectorClass::ThoughtEmbedding,
            VectorClass::KnowledgeNode,
            VectorClass::Relationship,
        ]
    }
}

impl std::fmt::Display for VectorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One shadow object slated for upsert. Ids are caller-supplied so the
/// operation is idempotent per DB row.
#[derive(Clone, Debug)]
pub struct VectorObject {
    pub id: Uuid,
    /// JSON object of filterable projections (back-ref, `userId`,
    /// `importance`, plus class-specific fields).
    pub properties: Value,
    pub vector: Vec<f32>,
}

impl VectorObject {
    /// Shadow for a chunk row.
    #[must_use]
    pub fn chunk(chunk_id: Uuid, user_id: &str, importance: f64, vector: Vec<f32>) -> Self {
        Self {
            id: chunk_id,
            properties: serde_json::json!({
                "chunkDbId": chunk_id.to_string(),
                PROP_USER_ID: user_id,
                PROP_IMPORTANCE: importance,
            }),
            vector,
        }
    }

    /// Shadow for an episode centroid.
    #[must_use]
    pub fn episode(episode_id: Uuid, user_id: &str, vector: Vec<f32>) -> Self {
        Self {
            id: episode_id,
            properties: serde_json::json!({
                "episodeDbId": episode_id.to_string(),
                PROP_USER_ID: user_id,
            }),
            vector,
        }
    }

    /// Shadow for a thought vector.
    #[must_use]
    pub fn thought(thought_id: Uuid, user_id: &str, importance: f64, vector: Vec<f32>) -> Self {
        Self {
            id: thought_id,
            properties: serde_json::json!({
                "thoughtDbId": thought_id.to_string(),
                PROP_USER_ID: user_id,
                PROP_IMPORTANCE: importance,
            }),
            vector,
        }
    }
}

/// Nearest-neighbor query. The user filter is mandatory by construction.
#[derive(Clone, Debug)]
pub struct NearestQuery {
    pub user_id: String,
    pub limit: usize,
    /// Hits below this certainty are dropped by the adapter.
    pub min_certainty: f64,
    /// Optional importance floor, applied against [`PROP_IMPORTANCE`].
    pub min_importance: Option<f64>,
}

impl NearestQuery {
    #[must_use]
    pub fn new(user_id: impl Into<String>, limit: usize, min_certainty: f64) -> Self {
        Self {
            user_id: user_id.into(),
            limit,
            min_certainty,
            min_importance: None,
        }
    }

    #[must_use]
    pub fn with_min_importance(mut self, floor: f64) -> Self {
        self.min_importance = Some(floor);
        self
    }
}

/// One nearest-neighbor hit.
#[derive(Clone, Debug)]
pub struct NearestHit {
    pub id: Uuid,
    pub properties: Value,
    /// Cosine similarity clamped to `[0, 1]`; adapters using a different
    /// native metric convert before returning.
    pub certainty: f64,
}

impl NearestHit {
    /// Extract the relational back-reference for `class`, when present and
    /// well-formed. Malformed shadows are skippable, not fatal.
    #[must_use]
    pub fn back_ref(&self, class: VectorClass) -> Option<Uuid> {
        let key = class.back_ref_property()?;
        self.properties
            .get(key)
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// Errors surfaced by vector-store adapters.
#[derive(Debug, Error, Diagnostic)]
pub enum VectorError {
    /// The backing engine cannot be reached; retryable, and ingestion
    /// degrades to `pending_vector` rows swept later.
    #[error("vector store unavailable: {0}")]
    #[diagnostic(
        code(engram::vectors::unavailable),
        help("The ingestion pipeline marks chunks pending_vector and the sweeper retries.")
    )]
    Unavailable(String),

    /// An upserted vector does not match the configured dimension.
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    #[diagnostic(code(engram::vectors::dimension))]
    DimensionMismatch { expected: usize, got: usize },

    /// The class was never bootstrapped on this adapter.
    #[error("unknown vector class: {0}")]
    #[diagnostic(
        code(engram::vectors::unknown_class),
        help("Call ensure_schema() during startup before issuing writes.")
    )]
    UnknownClass(&'static str),

    #[error("vector store backend error: {0}")]
    #[diagnostic(code(engram::vectors::backend))]
    Backend(String),
}

impl VectorError {
    /// Whether a retry against the same adapter can reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, VectorError::Unavailable(_) | VectorError::Backend(_))
    }
}

/// Adapter contract for the vector index.
///
/// Implementations must scope every read by `query.user_id` and reject
/// vectors whose dimension differs from the configured `D`. Failures are
/// surfaced as [`VectorError`]s, never silently dropped.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotently create the classes in [`VectorClass::all`] and add any
    /// missing property fields. Safe to call on every startup.
    async fn ensure_schema(&self) -> Result<(), VectorError>;

    /// Insert or replace the given objects, keyed by their ids.
    async fn upsert_batch(
        &self,
        class: VectorClass,
        objects: Vec<VectorObject>,
    ) -> Result<(), VectorError>;

    /// Nearest neighbors of `vector` within `class`, filtered and floored
    /// per `query`, ordered by descending certainty.
    async fn nearest(
        &self,
        class: VectorClass,
        vector: &[f32],
        query: &NearestQuery,
    ) -> Result<Vec<NearestHit>, VectorError>;

    /// Fetch one object by id, if present.
    async fn fetch(&self, class: VectorClass, id: Uuid) -> Result<Option<VectorObject>, VectorError>;

    /// Drop an entire class. Used once at startup for legacy cleanup.
    async fn delete_class(&self, class: VectorClass) -> Result<(), VectorError>;
}
