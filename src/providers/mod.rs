//! Per-provider adapters behind a single capability interface.
//!
//! Each backend implements [`ChatProvider`]: model enumeration with a static
//! fallback, non-streaming completion, and a streaming completion that emits
//! canonical SSE lines. All translation is done inside the adapter; nothing
//! provider-specific leaks past this module boundary.

pub mod anthropic;
pub mod gemini;
pub mod grok;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::schema::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkChoice, ChunkDelta,
    FinishReason, ModelInfo, Role,
};

/// Substituted when a provider requires `max_tokens` and the request omits it.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// The end-of-stream sentinel terminating every canonical stream.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// A finite, single-pass stream of serialized SSE lines
/// (`"data: {json}\n\n"`, terminated by the `[DONE]` sentinel).
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Identity tag for each backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
    Google,
    Xai,
}

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Xai => "xai",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Capability interface implemented by one adapter per backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Enumerate available models. Never fails: any live-listing failure
    /// falls back to the provider's static model list.
    async fn list_models(&self) -> Vec<ModelInfo>;

    /// Look up one model by id: live API first, then a linear scan of the
    /// static fallback list, then `GatewayError::ModelNotFound`.
    async fn get_model(&self, id: &str) -> Result<ModelInfo>;

    /// Non-streaming completion. Exactly one choice at index 0.
    async fn create_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse>;

    /// Streaming completion as canonical SSE lines.
    async fn create_stream_completion(&self, request: &ChatCompletionRequest)
        -> Result<ChunkStream>;
}

/// Per-stream identity: `id`, `created`, and `model` are fixed once at stream
/// start and repeated unchanged on every chunk.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub id: String,
    pub created: u64,
    pub model: String,
}

impl StreamContext {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: crate::schema::unix_timestamp(),
            model: model.to_string(),
        }
    }

    /// A chunk carrying one content increment, no finish reason.
    pub fn content_chunk(&self, content: &str) -> ChatCompletionChunk {
        self.chunk(
            ChunkDelta {
                role: Some(Role::Assistant),
                content: Some(content.to_string()),
            },
            None,
        )
    }

    /// The terminal chunk: empty delta, non-null finish reason.
    pub fn finish_chunk(&self, reason: FinishReason) -> ChatCompletionChunk {
        self.chunk(ChunkDelta::default(), Some(reason))
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

/// Serialize one chunk as an SSE data line.
pub fn sse_data(chunk: &ChatCompletionChunk) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(chunk)?))
}

/// Synthesize a canonical completion id. Providers that already report an id
/// get it re-stamped under the `chatcmpl-` prefix; others get a generated one.
pub fn completion_id(provider_id: Option<&str>) -> String {
    match provider_id {
        Some(id) if !id.is_empty() => {
            format!("chatcmpl-{}", id.trim_start_matches("chatcmpl-"))
        }
        _ => format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_context_fixed_identity() {
        let ctx = StreamContext::new("test-model");
        let a = ctx.content_chunk("A");
        let b = ctx.finish_chunk(FinishReason::Stop);
        assert_eq!(a.id, b.id);
        assert_eq!(a.created, b.created);
        assert_eq!(a.model, "test-model");
        assert!(a.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn test_finish_chunk_has_empty_delta() {
        let ctx = StreamContext::new("m");
        let chunk = ctx.finish_chunk(FinishReason::Stop);
        assert!(chunk.choices[0].delta.content.is_none());
        assert!(chunk.choices[0].delta.role.is_none());
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_sse_data_framing() {
        let ctx = StreamContext::new("m");
        let line = sse_data(&ctx.content_chunk("hi")).unwrap();
        assert!(line.starts_with("data: {"));
        assert!(line.ends_with("\n\n"));
    }

    #[test]
    fn test_completion_id_restamps_prefix() {
        assert_eq!(completion_id(Some("abc")), "chatcmpl-abc");
        assert_eq!(completion_id(Some("chatcmpl-abc")), "chatcmpl-abc");
        assert!(completion_id(None).starts_with("chatcmpl-"));
    }
}
