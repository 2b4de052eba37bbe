//! Engine configuration: every tunable the pipeline honors, with defaults
//! and environment overrides.
//!
//! Defaults follow the pinned values from the design review. All knobs are
//! plain fields so deployments can select different operating points without
//! code edits; [`EngineConfig::from_env`] layers `ENGRAM_*` environment
//! variables (loaded through `dotenvy`) over the defaults.
//!
//! ```rust
//! use engram::config::EngineConfig;
//!
//! let cfg = EngineConfig::default()
//!     .with_database_url("sqlite::memory:")
//!     .with_embedding_dim(8);
//! assert_eq!(cfg.chunking.max_chars, 2000);
//! assert_eq!(cfg.attach.primary_attach, 0.80);
//! ```

use std::time::Duration;

/// Canonical embedding dimension; vectors of other sizes are expanded or
/// truncated at component boundaries.
pub const DEFAULT_EMBEDDING_DIM: usize = 1536;

/// Top-level configuration consumed by the composition root.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// SQLx database URL for the relational store.
    pub database_url: String,
    /// Dimension every persisted vector is normalized to.
    pub embedding_dim: usize,
    /// Vector-store batch size for shadow upserts.
    pub vector_batch_size: usize,
    /// Drop legacy vector classes once during startup schema bootstrap.
    pub purge_legacy_classes: bool,
    pub llm: LlmConfig,
    pub chunking: ChunkingConfig,
    pub importance: ImportanceConfig,
    pub attach: AttachConfig,
    pub consolidation: ConsolidationConfig,
    pub thoughts: ThoughtConfig,
    pub retrieval: RetrievalConfig,
    pub queues: QueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://engram.db".to_string(),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            vector_batch_size: 25,
            purge_legacy_classes: false,
            llm: LlmConfig::default(),
            chunking: ChunkingConfig::default(),
            importance: ImportanceConfig::default(),
            attach: AttachConfig::default(),
            consolidation: ConsolidationConfig::default(),
            thoughts: ThoughtConfig::default(),
            retrieval: RetrievalConfig::default(),
            queues: QueueConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Resolve configuration from the environment, layering `ENGRAM_*`
    /// variables over the defaults. A `.env` file is honored when present.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("ENGRAM_DATABASE_URL") {
            cfg.database_url = url;
        }
        read_env("ENGRAM_EMBEDDING_DIM", &mut cfg.embedding_dim);
        read_env("ENGRAM_VECTOR_BATCH_SIZE", &mut cfg.vector_batch_size);
        if let Ok(url) = std::env::var("ENGRAM_LLM_BASE_URL") {
            cfg.llm.base_url = url;
        }
        if let Ok(key) = std::env::var("ENGRAM_LLM_API_KEY") {
            cfg.llm.api_key = Some(key);
        }
        if let Ok(name) = std::env::var("ENGRAM_LLM_PROVIDER") {
            cfg.llm.provider = name;
        }
        if let Ok(model) = std::env::var("ENGRAM_LLM_CHAT_MODEL") {
            cfg.llm.chat_model = model;
        }
        if let Ok(model) = std::env::var("ENGRAM_LLM_EMBEDDING_MODEL") {
            cfg.llm.embedding_model = model;
        }
        read_env("ENGRAM_IMPORTANCE_THRESHOLD", &mut cfg.importance.threshold);
        read_env("ENGRAM_PRIMARY_ATTACH", &mut cfg.attach.primary_attach);
        read_env("ENGRAM_MULTI_ATTACH", &mut cfg.attach.multi_attach);
        read_env("ENGRAM_SEED_THRESHOLD", &mut cfg.attach.seed_threshold);
        read_env(
            "ENGRAM_CONSOLIDATION_THRESHOLD",
            &mut cfg.consolidation.orphan_threshold,
        );
        read_env("ENGRAM_DBSCAN_EPSILON", &mut cfg.consolidation.dbscan_epsilon);
        read_env(
            "ENGRAM_DBSCAN_MIN_POINTS",
            &mut cfg.consolidation.dbscan_min_points,
        );
        cfg
    }

    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    #[must_use]
    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    #[must_use]
    pub fn with_llm(mut self, llm: LlmConfig) -> Self {
        self.llm = llm;
        self
    }
}

fn read_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(value) = raw.parse::<T>() {
            *slot = value;
        }
    }
}

/// LLM provider selection and endpoint settings.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    /// Registered provider name; unknown names fail engine startup.
    pub provider: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub completion_model: String,
    pub embedding_model: String,
    /// Deadline applied to every provider call.
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai-compatible".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            completion_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Character budgets for the semantic splitter.
#[derive(Clone, Copy, Debug)]
pub struct ChunkingConfig {
    /// Chunks shorter than this are merged into a neighbor.
    pub min_chars: usize,
    /// Hard-split size for single segments that exceed `max_chars`.
    pub target_chars: usize,
    /// No produced chunk exceeds this, except a final hard-split remainder.
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chars: 100,
            target_chars: 800,
            max_chars: 2000,
        }
    }
}

/// Importance gate settings.
#[derive(Clone, Copy, Debug)]
pub struct ImportanceConfig {
    /// Records scoring below this (and not bypassed) are skipped.
    /// A score exactly at the threshold passes.
    pub threshold: f64,
    /// Recent-decision cache lifetime.
    pub cache_ttl: Duration,
}

impl Default for ImportanceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.4,
            cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Online episode-attachment thresholds.
#[derive(Clone, Copy, Debug)]
pub struct AttachConfig {
    /// Best-candidate similarity required for a single-episode link.
    pub primary_attach: f64,
    /// Similarity at or above which every candidate is linked.
    pub multi_attach: f64,
    /// Below this (best candidate), an important chunk seeds a new episode.
    pub seed_threshold: f64,
    /// Newest-episode candidate count.
    pub max_candidates: usize,
    /// Candidate episodes must have been created within this window.
    pub episode_time_window: Duration,
    /// Vector-store read retries while the upsert settles.
    pub vector_fetch_attempts: u32,
    /// Delivery delay on attach jobs so vector indexing settles first.
    pub settle_delay: Duration,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            primary_attach: 0.80,
            multi_attach: 0.70,
            seed_threshold: 0.60,
            max_candidates: 5,
            episode_time_window: Duration::from_secs(7 * 24 * 60 * 60),
            vector_fetch_attempts: 3,
            settle_delay: Duration::from_secs(5),
        }
    }
}

/// Batch consolidation of orphan chunks.
#[derive(Clone, Copy, Debug)]
pub struct ConsolidationConfig {
    /// Minimum orphan count before clustering runs.
    pub orphan_threshold: usize,
    /// DBSCAN epsilon over cosine distance (`1 - cos`).
    pub dbscan_epsilon: f64,
    /// DBSCAN minimum cluster size.
    pub dbscan_min_points: usize,
    /// Members beyond this are left for the next pass.
    pub max_chunks_per_episode: usize,
    /// Character budget for the narrative prompt's concatenated text.
    pub text_budget_chars: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            orphan_threshold: 2,
            dbscan_epsilon: 0.30,
            dbscan_min_points: 2,
            max_chunks_per_episode: 30,
            text_budget_chars: 6000,
        }
    }
}

/// Nightly thought generation.
#[derive(Clone, Debug)]
pub struct ThoughtConfig {
    /// Minimum cluster size that yields a thought.
    pub min_episodes: usize,
    /// Centroid similarity for greedy episode clustering.
    pub episode_similarity_min: f64,
    /// Thoughts below this importance are discarded.
    pub min_importance: f64,
    /// Daily schedule, cron form. Only `M H * * *` daily schedules are
    /// interpreted; anything else falls back to 03:00 local.
    pub schedule: String,
    /// Episodes considered per user per run, newest first.
    pub max_recent_episodes: usize,
}

impl Default for ThoughtConfig {
    fn default() -> Self {
        Self {
            min_episodes: 2,
            episode_similarity_min: 0.65,
            min_importance: 0.5,
            schedule: "0 3 * * *".to_string(),
            max_recent_episodes: 50,
        }
    }
}

/// Retrieval defaults; per-call options override these.
#[derive(Clone, Copy, Debug)]
pub struct RetrievalConfig {
    pub limit: usize,
    /// Direct chunk hits below this importance are filtered out.
    pub min_importance: f64,
    /// Base certainty floor for nearest-neighbor queries.
    pub certainty: f64,
    /// Linked chunks fetched per episode hit.
    pub episode_chunk_fanout: usize,
    /// Linked chunks inherit this share of the episode's certainty.
    pub episode_chunk_similarity_scale: f64,
    /// Thought queries use this share of the base certainty floor.
    pub thought_certainty_scale: f64,
    /// Thought hits retained per query.
    pub thought_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            min_importance: 0.45,
            certainty: 0.65,
            episode_chunk_fanout: 10,
            episode_chunk_similarity_scale: 0.9,
            thought_certainty_scale: 0.75,
            thought_limit: 3,
        }
    }
}

/// Queue worker counts, retry policy, and sweep cadence.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    pub ingest_workers: usize,
    pub attach_workers: usize,
    pub consolidate_workers: usize,
    pub thought_workers: usize,
    pub file_upload_workers: usize,
    /// Delivery attempts per job before it is dead-lettered.
    pub max_attempts: u32,
    /// Exponential backoff base between attempts.
    pub backoff_base: Duration,
    /// Completed-job history retained for stats.
    pub completed_history: usize,
    /// Failed-job history retained for stats.
    pub failed_history: usize,
    /// Pending-vector sweeper cadence.
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ingest_workers: 5,
            attach_workers: 5,
            consolidate_workers: 1,
            thought_workers: 1,
            file_upload_workers: 2,
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            completed_history: 1000,
            failed_history: 5000,
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}
