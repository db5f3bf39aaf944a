//! Anthropic Messages API adapter.
//!
//! Translates canonical requests into the Messages wire format (system
//! instruction out-of-band, `max_tokens` mandatory), normalizes completed
//! responses, and runs a state machine over the Messages SSE event grammar
//! (`message_start`, `content_block_*`, `message_delta`, `message_stop`) to
//! produce canonical chunks.

use chrono::{DateTime, Utc};
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{
    sse_data, ChatProvider, ChunkStream, ProviderKind, StreamContext, DEFAULT_MAX_TOKENS, SSE_DONE,
};
use crate::error::{GatewayError, Result};
use crate::schema::{
    unix_timestamp, ChatCompletionRequest, ChatCompletionResponse, FinishReason, ModelInfo, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Fallback model ids used when the live listing is unreachable.
const FALLBACK_MODELS: &[&str] = &[
    "claude-opus-4-5-20251101",
    "claude-haiku-4-5-20251001",
    "claude-sonnet-4-5-20250929",
    "claude-opus-4-1-20250805",
    "claude-opus-4-20250514",
    "claude-sonnet-4-20250514",
    "claude-3-7-sonnet-20250219",
    "claude-3-5-haiku-20241022",
    "claude-3-haiku-20240307",
];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct WireTurn {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    #[serde(default)]
    content: Vec<WireContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireModelsResponse {
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireStreamEvent {
    MessageStart,
    Ping,
    ContentBlockStart,
    ContentBlockDelta { delta: WireDelta },
    ContentBlockStop,
    MessageDelta { delta: WireMessageDelta },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Build the Messages wire request. System messages are extracted into the
/// dedicated `system` field; `max_tokens` is required by the API so the
/// canonical default is substituted when absent.
fn build_request(req: &ChatCompletionRequest, stream: bool) -> WireRequest {
    let messages = req
        .conversation_turns()
        .map(|m| WireTurn {
            role: match m.role {
                crate::schema::Role::Assistant => "assistant".to_string(),
                _ => "user".to_string(),
            },
            content: m.content.clone(),
        })
        .collect();

    WireRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: req.system_instruction().map(str::to_string),
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: req.stop_sequences(),
        stream: stream.then_some(true),
    }
}

/// Map an Anthropic stop reason onto the canonical finish-reason enum.
fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Normalize a completed Messages response: text blocks joined by a single
/// space, first candidate only, usage reconstructed from input/output tokens.
fn normalize_response(resp: &WireResponse, model: &str) -> ChatCompletionResponse {
    let content = resp
        .content
        .iter()
        .filter_map(|block| match block {
            WireContentBlock::Text { text } => Some(text.as_str()),
            WireContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join(" ");

    ChatCompletionResponse::single_choice(
        super::completion_id(Some(&resp.id)),
        model.to_string(),
        content,
        map_stop_reason(resp.stop_reason.as_deref()),
        Usage::from_counts(resp.usage.input_tokens, resp.usage.output_tokens),
    )
}

// ---------------------------------------------------------------------------
// Streaming state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Finished,
}

/// Consumes the Messages event grammar and emits at most one canonical chunk
/// per event: `content_block_delta` text becomes a content chunk,
/// `message_stop` becomes the terminal chunk, housekeeping events are
/// swallowed. Nothing is emitted after the terminal chunk.
struct StreamTranslator {
    ctx: StreamContext,
    state: StreamState,
    stop_reason: Option<String>,
}

impl StreamTranslator {
    fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            state: StreamState::Open,
            stop_reason: None,
        }
    }

    fn on_event(&mut self, event: &WireStreamEvent) -> Option<crate::schema::ChatCompletionChunk> {
        if self.state == StreamState::Finished {
            return None;
        }
        match event {
            WireStreamEvent::ContentBlockDelta {
                delta: WireDelta::TextDelta { text },
            } => Some(self.ctx.content_chunk(text)),
            WireStreamEvent::MessageDelta { delta } => {
                // stop_reason arrives here, one event before message_stop
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason.clone();
                }
                None
            }
            WireStreamEvent::MessageStop => {
                self.state = StreamState::Finished;
                let reason = map_stop_reason(self.stop_reason.as_deref());
                Some(self.ctx.finish_chunk(reason))
            }
            _ => None,
        }
    }

    fn is_finished(&self) -> bool {
        self.state == StreamState::Finished
    }

    /// Close the stream if the upstream ended without a `message_stop`.
    fn finish(&mut self) -> Option<crate::schema::ChatCompletionChunk> {
        if self.state == StreamState::Finished {
            return None;
        }
        self.state = StreamState::Finished;
        Some(self.ctx.finish_chunk(FinishReason::Stop))
    }
}

fn translate_stream<E>(
    events: impl Stream<
            Item = std::result::Result<
                eventsource_stream::Event,
                eventsource_stream::EventStreamError<E>,
            >,
        > + Send
        + 'static,
    ctx: StreamContext,
) -> impl Stream<Item = Result<String>> + Send + 'static
where
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut translator = StreamTranslator::new(ctx);
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    tracing::error!(error = %e, "anthropic stream transport failure");
                    yield Err(GatewayError::stream(format!("upstream stream failed: {e}")));
                    return;
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }

            let parsed: WireStreamEvent = match serde_json::from_str(data) {
                Ok(ev) => ev,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unparseable anthropic event");
                    continue;
                }
            };

            if let Some(chunk) = translator.on_event(&parsed) {
                yield sse_data(&chunk);
            }
            if translator.is_finished() {
                break;
            }
        }

        // Upstream closed cleanly without message_stop; still terminate properly.
        if let Some(chunk) = translator.finish() {
            yield sse_data(&chunk);
        }
        yield Ok(SSE_DONE.to_string());
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, api_key: String, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn fallback_models(&self) -> Vec<ModelInfo> {
        let created = unix_timestamp();
        FALLBACK_MODELS
            .iter()
            .map(|id| ModelInfo::new(*id, created, "anthropic"))
            .collect()
    }

    async fn fetch_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(self.url("/v1/models?limit=100"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await?
            .error_for_status()?;

        let parsed: WireModelsResponse = response.json().await?;
        Ok(parsed
            .data
            .into_iter()
            .map(|m| {
                let created = u64::try_from(m.created_at.timestamp()).unwrap_or(0);
                ModelInfo::new(m.id, created, "anthropic")
            })
            .collect())
    }

    async fn fetch_model(&self, id: &str) -> Result<ModelInfo> {
        let response = self
            .client
            .get(self.url(&format!("/v1/models/{id}")))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await?
            .error_for_status()?;

        let model: WireModel = response.json().await?;
        let created = u64::try_from(model.created_at.timestamp()).unwrap_or(0);
        Ok(ModelInfo::new(model.id, created, "anthropic"))
    }

    async fn send_messages(&self, wire: &WireRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url("/v1/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(wire)
            .send()
            .await
            .map_err(|e| GatewayError::provider(format!("anthropic request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(provider = "anthropic", status = %status, "upstream returned error");
            return Err(GatewayError::provider(format!(
                "anthropic returned status {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        match self.fetch_models().await {
            Ok(models) => {
                tracing::info!(provider = "anthropic", count = models.len(), "fetched models");
                models
            }
            Err(e) => {
                tracing::warn!(provider = "anthropic", error = %e, "live listing failed, using fallback list");
                self.fallback_models()
            }
        }
    }

    async fn get_model(&self, id: &str) -> Result<ModelInfo> {
        match self.fetch_model(id).await {
            Ok(model) => Ok(model),
            Err(e) => {
                tracing::warn!(provider = "anthropic", model = id, error = %e, "live lookup failed");
                self.fallback_models()
                    .into_iter()
                    .find(|m| m.id == id)
                    .ok_or_else(|| GatewayError::model_not_found(id))
            }
        }
    }

    async fn create_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let wire = build_request(request, false);
        let response = self.send_messages(&wire).await?;
        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::provider(format!("failed to parse anthropic response: {e}")))?;
        Ok(normalize_response(&parsed, &request.model))
    }

    async fn create_stream_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream> {
        let wire = build_request(request, true);
        let response = self.send_messages(&wire).await?;

        let ctx = StreamContext::new(&request.model);
        let events = response.bytes_stream().eventsource();
        Ok(Box::pin(translate_stream(events, ctx)))
    }
}
