//! OpenAI-compatible HTTP provider.
//!
//! Speaks the `/chat/completions` and `/embeddings` wire shapes that the
//! OpenAI API and its many self-hosted lookalikes share. All requests run
//! under the configured deadline; timeouts and transport failures map to
//! retryable [`LlmError`] variants.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::LlmConfig;

use super::{
    ChatOptions, ChatReply, CompletionOptions, ImageAnalysisRequest, LlmClient, LlmError,
};

/// Reqwest-backed client for OpenAI-compatible endpoints.
#[derive(Debug)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiCompatClient {
    /// Build a client from provider settings. Fails when the HTTP client
    /// cannot be constructed (TLS backend unavailable).
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, LlmError> {
        let mut request = self.http.post(self.endpoint(path)).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                message: message.chars().take(500).collect(),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))
    }

    async fn chat(&self, model: &str, messages: Value, temperature: Option<f64>, max_tokens: Option<u32>) -> Result<String, LlmError> {
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(t) = temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = max_tokens {
            body["max_tokens"] = json!(m);
        }
        let reply = self.post("chat/completions", body).await?;
        let text = reply
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.pointer("/message/content"))
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".into()))?;
        Ok(text.to_string())
    }
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn send_message(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
        options: &ChatOptions,
    ) -> Result<ChatReply, LlmError> {
        debug!(user_id, session_id, "llm chat call");
        // The memory block is prepended verbatim; the marker keeps the
        // user's actual turn unambiguous for the provider.
        let content = match &options.memory_context {
            Some(block) => format!("{block}\n\nUSER MESSAGE: {message}"),
            None => message.to_string(),
        };
        let model = options.model.as_deref().unwrap_or(&self.config.chat_model);
        let text = self
            .chat(
                model,
                json!([{ "role": "user", "content": content }]),
                options.temperature,
                None,
            )
            .await?;
        Ok(ChatReply { text })
    }

    async fn completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let model = options
            .model
            .as_deref()
            .unwrap_or(&self.config.completion_model);
        self.chat(
            model,
            json!([{ "role": "user", "content": prompt }]),
            options.temperature,
            options.max_tokens,
        )
        .await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .post(
                "embeddings",
                json!({
                    "model": self.config.embedding_model,
                    "input": texts,
                }),
            )
            .await?;
        let data = reply
            .get("data")
            .cloned()
            .ok_or_else(|| LlmError::Malformed("missing data".into()))?;
        let mut data: Vec<EmbeddingDatum> =
            serde_json::from_value(data).map_err(|e| LlmError::Malformed(e.to_string()))?;
        if data.len() != texts.len() {
            return Err(LlmError::Malformed(format!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                data.len()
            )));
        }
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    async fn analyze_image(&self, request: ImageAnalysisRequest) -> Result<ChatReply, LlmError> {
        debug!(
            user_id = %request.user_id,
            session_id = %request.session_id,
            mime = %request.mime_type,
            "llm image analysis"
        );
        let data_url = format!(
            "data:{};base64,{}",
            request.mime_type,
            BASE64.encode(&request.image_bytes)
        );
        let prompt = request
            .user_message
            .as_deref()
            .unwrap_or("Describe this image in detail, noting anything personally meaningful.");
        let messages = json!([{
            "role": "user",
            "content": [
                { "type": "text", "text": prompt },
                { "type": "image_url", "image_url": { "url": data_url } },
            ],
        }]);
        let text = self.chat(&self.config.chat_model, messages, None, None).await?;
        Ok(ChatReply { text })
    }
}
