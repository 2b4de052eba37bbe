//! Importance evaluation with a deterministic fallback.
//!
//! Scores a `(content, type)` pair in `[0, 1]` via a short LLM completion.
//! The evaluator never fails the pipeline: provider errors, unparsable
//! replies, and out-of-range numbers all fall back to a heuristic, and
//! recent decisions are served from a short-lived content-hash cache so a
//! burst of identical turns costs one provider call.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHasher};
use tracing::{debug, warn};

use crate::config::ImportanceConfig;
use crate::llm::{CompletionOptions, LlmClient};
use crate::prompts::{importance_prompt, parse_importance_reply};
use crate::types::ContentType;

/// Cache prune trigger; entries past the TTL are dropped when the map
/// grows beyond this.
const CACHE_PRUNE_LEN: usize = 1024;

struct CacheEntry {
    score: f64,
    inserted_at: Instant,
}

/// LLM-backed importance scorer with heuristic fallback.
pub struct ImportanceEvaluator {
    llm: Arc<dyn LlmClient>,
    ttl: Duration,
    cache: Mutex<FxHashMap<u64, CacheEntry>>,
}

impl ImportanceEvaluator {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, config: &ImportanceConfig) -> Self {
        Self {
            llm,
            ttl: config.cache_ttl,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Score `content` for long-term importance.
    ///
    /// Infallible by policy: every failure path degrades to
    /// [`heuristic_score`]. `None` is reserved for content the evaluator
    /// refuses to score at all; the shipped policy never produces it, but
    /// callers must treat `None` as "skip further processing".
    pub async fn evaluate(&self, content: &str, content_type: ContentType) -> Option<f64> {
        if content.trim().is_empty() {
            return Some(0.0);
        }

        let key = cache_key(content, content_type);
        if let Some(score) = self.cached(key) {
            debug!(score, "importance served from cache");
            return Some(score);
        }

        let prompt = importance_prompt(content, content_type);
        let options = CompletionOptions {
            max_tokens: Some(16),
            temperature: Some(0.0),
            ..CompletionOptions::default()
        };
        let score = match self.llm.completion(&prompt, &options).await {
            Ok(reply) => match parse_importance_reply(&reply) {
                Some(score) => score,
                None => {
                    warn!(reply = %reply.chars().take(80).collect::<String>(),
                          "unparsable importance reply, using heuristic");
                    heuristic_score(content, content_type)
                }
            },
            Err(err) => {
                warn!(error = %err, "importance completion failed, using heuristic");
                heuristic_score(content, content_type)
            }
        };

        self.remember(key, score);
        Some(score)
    }

    fn cached(&self, key: u64) -> Option<f64> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(&key)?;
        (entry.inserted_at.elapsed() <= self.ttl).then_some(entry.score)
    }

    fn remember(&self, key: u64, score: f64) {
        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= CACHE_PRUNE_LEN {
                let ttl = self.ttl;
                cache.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
            }
            cache.insert(
                key,
                CacheEntry {
                    score,
                    inserted_at: Instant::now(),
                },
            );
        }
    }
}

fn cache_key(content: &str, content_type: ContentType) -> u64 {
    let mut hasher = FxHasher::default();
    content.hash(&mut hasher);
    content_type.encode().hash(&mut hasher);
    hasher.finish()
}

/// Deterministic fallback scoring.
///
/// Base 0.3; +0.4 for file-upload sources; +0.1 for length over 200;
/// +0.1 for a question mark (non-file content); +0.1 for digits; up to
/// +0.2 for proper-noun density; capped at 0.9.
#[must_use]
pub fn heuristic_score(content: &str, content_type: ContentType) -> f64 {
    let mut score = 0.3;
    let is_file = content_type.is_file_upload();
    if is_file {
        score += 0.4;
    }
    if content.len() > 200 {
        score += 0.1;
    }
    if !is_file && content.contains('?') {
        score += 0.1;
    }
    if content.chars().any(|c| c.is_ascii_digit()) {
        score += 0.1;
    }
    score += proper_noun_bonus(content);
    score.min(0.9)
}

/// Density of capitalized words outside sentence-initial position, scaled
/// into a bonus of at most 0.2.
fn proper_noun_bonus(content: &str) -> f64 {
    let mut words = 0usize;
    let mut proper = 0usize;
    let mut sentence_start = true;
    for token in content.split_whitespace() {
        if let Some(first) = token.chars().next() {
            if first.is_alphabetic() {
                words += 1;
                if first.is_uppercase() && !sentence_start {
                    proper += 1;
                }
            }
        }
        sentence_start = token.ends_with(['.', '!', '?', ':']);
    }
    if words == 0 {
        return 0.0;
    }
    ((proper as f64 / words as f64) * 0.5).min(0.2)
}
