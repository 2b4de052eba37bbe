//! Episode formation: online attachment of fresh chunks and batch
//! consolidation of orphans.
//!
//! Two paths create and grow episodes:
//!
//! - [`attach::EpisodeAttacher`] runs per chunk as soon as its embedding is
//!   indexed, deciding between multi-attach, primary attach, seeding a new
//!   episode, or leaving the chunk orphaned.
//! - [`consolidate::Consolidator`] runs per user when orphan chunks
//!   accumulate, density-clustering them into new episodes.
//!
//! Both paths narrate episodes through the same LLM prompt and share the
//! deterministic fallback below, so a provider outage degrades titles, not
//! the pipeline.

pub mod attach;
pub mod consolidate;
pub mod dbscan;

use std::sync::Arc;

use tracing::warn;

use crate::llm::{CompletionOptions, LlmClient};
use crate::prompts::{
    NARRATIVE_MAX_WORDS, TITLE_MAX_CHARS, narrative_prompt, parse_narrative_reply,
};

pub use attach::{AttachDecision, EpisodeAttacher};
pub use consolidate::{ConsolidationReport, Consolidator};
pub use dbscan::{DbscanParams, cluster};

/// Generate `(title, narrative)` for an episode from its member text.
///
/// Provider failures and unparsable replies degrade to a deterministic
/// extract of the source text; episode creation never fails on narration.
pub(crate) async fn generate_narrative(llm: &Arc<dyn LlmClient>, member_text: &str) -> (String, String) {
    let prompt = narrative_prompt(member_text);
    let options = CompletionOptions {
        max_tokens: Some(512),
        temperature: Some(0.4),
        ..CompletionOptions::default()
    };
    match llm.completion(&prompt, &options).await {
        Ok(reply) => parse_narrative_reply(&reply).unwrap_or_else(|| {
            warn!("unparsable narrative reply, using fallback");
            fallback_narrative(member_text)
        }),
        Err(err) => {
            warn!(error = %err, "narrative completion failed, using fallback");
            fallback_narrative(member_text)
        }
    }
}

/// Title from the leading words, narrative from the clamped text itself.
fn fallback_narrative(member_text: &str) -> (String, String) {
    let trimmed = member_text.trim();
    let title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    let narrative: String = trimmed
        .split_whitespace()
        .take(NARRATIVE_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    (title, narrative)
}
