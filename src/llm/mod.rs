//! LLM adapter: one uniform seam for chat, short completions, embeddings,
//! and multimodal image analysis.
//!
//! The engine never talks to a provider SDK directly; everything flows
//! through [`LlmClient`]. Providers register by name in
//! [`registry::ProviderRegistry`] and an unknown name is a configuration
//! error at startup, never a silent fallback.
//!
//! Errors carry a retryability hint ([`LlmError::is_retryable`]); the
//! pipeline layer decides whether to retry, degrade, or skip.

pub mod openai;
pub mod registry;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::types::{SessionId, UserId};

pub use openai::OpenAiCompatClient;
pub use registry::ProviderRegistry;

/// Options for a multi-turn chat call.
#[derive(Clone, Debug, Default)]
pub struct ChatOptions {
    /// Override the configured chat model.
    pub model: Option<String>,
    /// Retrieved-memory block; when present it is prepended verbatim and
    /// the user text follows after a `USER MESSAGE:` marker.
    pub memory_context: Option<String>,
    pub temperature: Option<f64>,
}

impl ChatOptions {
    #[must_use]
    pub fn with_memory_context(mut self, block: impl Into<String>) -> Self {
        self.memory_context = Some(block.into());
        self
    }
}

/// Options for a short one-shot completion.
#[derive(Clone, Debug, Default)]
pub struct CompletionOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// A provider reply; only the text is consumed by the core.
#[derive(Clone, Debug)]
pub struct ChatReply {
    pub text: String,
}

/// Input for multimodal image analysis.
#[derive(Clone, Debug)]
pub struct ImageAnalysisRequest {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub image_bytes: Vec<u8>,
    pub mime_type: String,
    pub user_message: Option<String>,
}

/// Typed provider failures with a retryability hint.
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    /// The configured deadline elapsed.
    #[error("llm call timed out")]
    #[diagnostic(code(engram::llm::timeout))]
    Timeout,

    /// Connection-level failure (DNS, TLS, refused).
    #[error("llm transport error: {0}")]
    #[diagnostic(code(engram::llm::transport))]
    Transport(String),

    /// Non-success HTTP status from the provider.
    #[error("llm provider returned {status}: {message}")]
    #[diagnostic(code(engram::llm::http))]
    Http { status: u16, message: String },

    /// The provider replied but the body was not in the expected shape.
    #[error("malformed llm response: {0}")]
    #[diagnostic(code(engram::llm::malformed))]
    Malformed(String),

    /// Provider wiring is wrong (unknown name, missing key). Fatal at
    /// startup, never retried.
    #[error("llm configuration error: {0}")]
    #[diagnostic(
        code(engram::llm::configuration),
        help("Check the provider name and credentials in the engine config.")
    )]
    Configuration(String),
}

impl LlmError {
    /// Whether the same call can reasonably succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::Transport(_) => true,
            LlmError::Http { status, .. } => *status == 429 || *status >= 500,
            LlmError::Malformed(_) | LlmError::Configuration(_) => false,
        }
    }
}

/// Uniform provider contract consumed by the core.
#[async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    /// Multi-turn chat. When `options.memory_context` is set the provider
    /// receives the block verbatim, followed by `USER MESSAGE: <text>`.
    async fn send_message(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
        options: &ChatOptions,
    ) -> Result<ChatReply, LlmError>;

    /// One-shot completion for scoring and summarization prompts.
    async fn completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, LlmError>;

    /// Embed a batch of texts; one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Describe an image, optionally steered by a user message.
    async fn analyze_image(&self, request: ImageAnalysisRequest) -> Result<ChatReply, LlmError>;
}
