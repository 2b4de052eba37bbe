//! # Engram: Long-Term Personal Memory for Conversational AI
//!
//! Engram is the memory substrate behind a conversational companion: it
//! ingests utterances and documents incrementally, scores them for
//! importance, splits the keepers into semantic chunks, embeds and indexes
//! every chunk, grows user-scoped **episodes** around related chunks, and
//! periodically derives higher-order **thoughts** across episodes. At read
//! time a free-text query returns a ranked blend of episodes, chunks, and
//! thoughts scoped to one user.
//!
//! ## Core Concepts
//!
//! - **RawRecord**: one ingested item (chat turn, reply, upload event,
//!   document content, image analysis) with a monotonic status machine
//! - **Chunk**: a semantic slice of a record; the unit of embedding and
//!   retrieval
//! - **Episode**: a coherent cluster of one user's chunks with a generated
//!   title, narrative, and centroid vector
//! - **Thought**: a cross-episode insight with weighted episode links
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use engram::config::EngineConfig;
//! use engram::engine::MemoryEngine;
//! use engram::model::RawRecordDraft;
//! use engram::retrieval::RetrieveOptions;
//! use engram::types::ContentType;
//!
//! # async fn example() -> Result<(), engram::engine::EngineError> {
//! let engine = MemoryEngine::builder(
//!     EngineConfig::from_env().with_database_url("sqlite://memory.db"),
//! )
//! .build()
//! .await?;
//!
//! // Write path: store the turn, everything else happens on workers.
//! engine
//!     .ingest_raw_record(RawRecordDraft::new(
//!         "user-1",
//!         "session-9",
//!         ContentType::UserChat,
//!         "We're planning a trip to Lisbon with Maria in May.",
//!     ))
//!     .await?;
//!
//! // Read path: ranked episodes, chunks, and thoughts for one user.
//! let memories = engine
//!     .retrieve_memories("user-1", "trip plans", &RetrieveOptions::default())
//!     .await;
//! for memory in memories {
//!     println!("{:?} {:.2} {}", memory.kind, memory.similarity, memory.content);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  ingest_raw_record ──► memory.ingest ──► evaluate ─ chunk ─ embed ─ index
//!                                                                │
//!                                     memory.attachEpisode ◄─────┘ (per chunk)
//!                                        │ link / seed / orphan
//!                                        ▼
//!                              memory.consolidate (per user, DBSCAN)
//!
//!  nightly 03:00 ──► memory.generateThoughts (per user)
//!  every 5 min  ──► pending-vector sweeper (DB wins over the index)
//! ```
//!
//! The relational store is the source of truth; the vector store is a
//! rebuildable shadow index behind [`vectors::VectorStore`]. The LLM
//! provider, the vector engine, and the job broker are all injectable
//! seams; the shipped defaults (sqlx SQLite, in-memory index,
//! OpenAI-compatible HTTP provider) run the whole engine in one process.
//!
//! ## Module Guide
//!
//! - [`engine`] - Composition root and the collaborator-facing API
//! - [`config`] - Every tunable, with environment overrides
//! - [`model`] - Canonical entities and the persistence contract
//! - [`vectors`] - Vector classes, the store trait, and vector math
//! - [`llm`] - Provider seam, registry, and the OpenAI-compatible client
//! - [`pipeline`] - The ingestion pipeline and the pending sweeper
//! - [`episodes`] - Online attachment, batch consolidation, DBSCAN
//! - [`thoughts`] - Nightly cross-episode insight generation
//! - [`retrieval`] - The three-stage retriever
//! - [`queue`] - Job queues, worker pools, retry, scheduling
//! - [`prompts`] - Prompt templates and tolerant reply parsers

pub mod chunking;
pub mod config;
pub mod engine;
pub mod episodes;
pub mod importance;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod queue;
pub mod retrieval;
pub mod telemetry;
pub mod thoughts;
pub mod types;
pub mod vectors;
