//! Core types for the Engram memory engine.
//!
//! This module defines the fundamental vocabulary shared by every component:
//! what kinds of content enter the engine, and which lifecycle states raw
//! records and chunks move through.
//!
//! # Key Types
//!
//! - [`ContentType`]: The provenance of an ingested record
//! - [`RecordStatus`]: Raw-record lifecycle (`pending` to a terminal state)
//! - [`ChunkStatus`]: Chunk embedding/indexing lifecycle
//!
//! # Examples
//!
//! ```rust
//! use engram::types::{ContentType, RecordStatus};
//!
//! let kind = ContentType::UserChat;
//! assert_eq!(kind.encode(), "user_chat");
//! assert_eq!(ContentType::decode("user_chat"), Some(kind));
//!
//! assert!(!RecordStatus::Pending.is_terminal());
//! assert!(RecordStatus::Processed.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of the human the memory belongs to.
pub type UserId = String;

/// Opaque identifier of one conversation session.
pub type SessionId = String;

/// Identifier of a persisted raw record.
pub type RawRecordId = Uuid;

/// Identifier of a persisted chunk.
pub type ChunkId = Uuid;

/// Identifier of a persisted episode.
pub type EpisodeId = Uuid;

/// Identifier of a persisted thought.
pub type ThoughtId = Uuid;

/// The provenance of a raw record entering the ingestion pipeline.
///
/// The content type drives the importance prompt that is rendered for the
/// record and the heuristic fallback scoring (file uploads carry a flat
/// importance bonus, chat turns are scored on their own signal).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// A message typed by the user in a chat session.
    UserChat,
    /// The assistant's reply in a chat session.
    AiResponse,
    /// The event noting that a file was uploaded (name, kind, size).
    UploadedFileEvent,
    /// Extracted text content of an uploaded document.
    UploadedDocumentContent,
    /// The textual analysis produced for an uploaded image.
    ImageAnalysis,
}

impl ContentType {
    /// Encode into the persisted snake_case string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ContentType::UserChat => "user_chat",
            ContentType::AiResponse => "ai_response",
            ContentType::UploadedFileEvent => "uploaded_file_event",
            ContentType::UploadedDocumentContent => "uploaded_document_content",
            ContentType::ImageAnalysis => "image_analysis",
        }
    }

    /// Decode the persisted string form. Unknown strings yield `None`;
    /// stored rows never round-trip through a lossy fallback.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        match raw {
            "user_chat" => Some(ContentType::UserChat),
            "ai_response" => Some(ContentType::AiResponse),
            "uploaded_file_event" => Some(ContentType::UploadedFileEvent),
            "uploaded_document_content" => Some(ContentType::UploadedDocumentContent),
            "image_analysis" => Some(ContentType::ImageAnalysis),
            _ => None,
        }
    }

    /// Whether this record originated from a file upload.
    #[must_use]
    pub fn is_file_upload(&self) -> bool {
        matches!(
            self,
            ContentType::UploadedFileEvent | ContentType::UploadedDocumentContent
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Lifecycle state of a raw record.
///
/// Transitions are monotonic: `Pending` moves to exactly one of the three
/// terminal states and never leaves it. The store enforces this in its
/// update statements; callers observing a terminal status can rely on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Created, not yet run through the pipeline (or awaiting vector retry).
    Pending,
    /// Fully chunked, embedded, and indexed.
    Processed,
    /// Dropped before chunking (empty content or below the importance gate).
    Skipped,
    /// The pipeline gave up after exhausting retries.
    Error,
}

impl RecordStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processed => "processed",
            RecordStatus::Skipped => "skipped",
            RecordStatus::Error => "error",
        }
    }

    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RecordStatus::Pending),
            "processed" => Some(RecordStatus::Processed),
            "skipped" => Some(RecordStatus::Skipped),
            "error" => Some(RecordStatus::Error),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Lifecycle state of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Row created, embedding not yet attempted.
    Pending,
    /// The embedding batch failed for this chunk's record.
    EmbeddingError,
    /// Embedded and stored in the DB row, but the vector-store upsert has
    /// not succeeded yet; the periodic sweeper retries from the DB row.
    PendingVector,
    /// Embedded and indexed in the vector store.
    Processed,
}

impl ChunkStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::EmbeddingError => "embedding_error",
            ChunkStatus::PendingVector => "pending_vector",
            ChunkStatus::Processed => "processed",
        }
    }

    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ChunkStatus::Pending),
            "embedding_error" => Some(ChunkStatus::EmbeddingError),
            "pending_vector" => Some(ChunkStatus::PendingVector),
            "processed" => Some(ChunkStatus::Processed),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}
