//! xAI Grok adapter.
//!
//! Grok speaks the OpenAI wire format, so translation is mostly
//! re-stamping: optional parameters are forwarded only when set, responses
//! are re-normalized onto the canonical finish-reason table, and streamed
//! chunks are re-issued under the gateway's own stream identity. Keep-alive
//! chunks with no choices are swallowed.

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{sse_data, ChatProvider, ChunkStream, ProviderKind, StreamContext, SSE_DONE};
use crate::error::{GatewayError, Result};
use crate::schema::{
    unix_timestamp, ChatCompletionRequest, ChatCompletionResponse, FinishReason, ModelInfo, Role,
    Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";

const FALLBACK_MODELS: &[&str] = &[
    "grok-2-latest",
    "grok-2",
    "grok-2-vision-latest",
    "grok-2-vision-1212",
    "grok-beta",
    "grok-vision-beta",
];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: Role,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    delta: WireChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireModelsResponse {
    #[serde(default)]
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    created: u64,
    #[serde(default)]
    owned_by: String,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn build_request(req: &ChatCompletionRequest, stream: bool) -> WireRequest {
    WireRequest {
        model: req.model.clone(),
        messages: req
            .messages
            .iter()
            .map(|m| WireMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect(),
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        stop: req.stop_sequences(),
        stream,
    }
}

/// Even an OpenAI-format provider gets its finish reason re-mapped through
/// the canonical table; unrecognized values collapse to `stop`.
fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn normalize_response(resp: &WireResponse, model: &str) -> ChatCompletionResponse {
    let choice = resp.choices.first();
    let content = choice
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    let finish_reason = map_finish_reason(choice.and_then(|c| c.finish_reason.as_deref()));

    let usage = resp
        .usage
        .as_ref()
        .map(|u| Usage::from_counts(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    ChatCompletionResponse::single_choice(
        super::completion_id(Some(&resp.id)),
        model.to_string(),
        content,
        finish_reason,
        usage,
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

/// Re-issues provider chunks under the gateway's stream identity. A provider
/// chunk can carry both a content delta and a finish reason; those split into
/// a content chunk followed by the terminal chunk.
struct StreamTranslator {
    ctx: StreamContext,
    state: StreamState,
}

impl StreamTranslator {
    fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            state: StreamState::Open,
        }
    }

    fn on_chunk(&mut self, chunk: &WireChunk) -> Vec<crate::schema::ChatCompletionChunk> {
        if self.state == StreamState::Finished {
            return Vec::new();
        }
        // Keep-alive chunks with no choices carry nothing.
        let Some(choice) = chunk.choices.first() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        if let Some(content) = choice.delta.content.as_deref() {
            if !content.is_empty() {
                out.push(self.ctx.content_chunk(content));
            }
        }
        if let Some(reason) = choice.finish_reason.as_deref() {
            self.state = StreamState::Finished;
            out.push(self.ctx.finish_chunk(map_finish_reason(Some(reason))));
        }
        out
    }

    fn is_finished(&self) -> bool {
        self.state == StreamState::Finished
    }

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
                    tracing::error!(error = %e, "grok stream transport failure");
                    yield Err(GatewayError::stream(format!("upstream stream failed: {e}")));
                    return;
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }

            let parsed: WireChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unparseable grok chunk");
                    continue;
                }
            };

            for chunk in translator.on_chunk(&parsed) {
                yield sse_data(&chunk);
            }
            if translator.is_finished() {
                break;
            }
        }

        if let Some(chunk) = translator.finish() {
            yield sse_data(&chunk);
        }
        yield Ok(SSE_DONE.to_string());
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct GrokProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GrokProvider {
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
            .map(|id| ModelInfo::new(*id, created, "xai"))
            .collect()
    }

    async fn fetch_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(self.url("/models"))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?;

        let parsed: WireModelsResponse = response.json().await?;
        Ok(parsed
            .data
            .into_iter()
            .map(|m| {
                let owned_by = if m.owned_by.is_empty() {
                    "xai".to_string()
                } else {
                    m.owned_by
                };
                ModelInfo::new(m.id, m.created, owned_by)
            })
            .collect())
    }

    async fn fetch_model(&self, id: &str) -> Result<ModelInfo> {
        let response = self
            .client
            .get(self.url(&format!("/models/{id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?;

        let model: WireModel = response.json().await?;
        let owned_by = if model.owned_by.is_empty() {
            "xai".to_string()
        } else {
            model.owned_by
        };
        Ok(ModelInfo::new(model.id, model.created, owned_by))
    }

    async fn send_completions(&self, wire: &WireRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(wire)
            .send()
            .await
            .map_err(|e| GatewayError::provider(format!("grok request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(provider = "xai", status = %status, "upstream returned error");
            return Err(GatewayError::provider(format!(
                "grok returned status {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatProvider for GrokProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Xai
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        match self.fetch_models().await {
            Ok(models) => {
                tracing::info!(provider = "xai", count = models.len(), "fetched models");
                models
            }
            Err(e) => {
                tracing::warn!(provider = "xai", error = %e, "live listing failed, using fallback list");
                self.fallback_models()
            }
        }
    }

    async fn get_model(&self, id: &str) -> Result<ModelInfo> {
        match self.fetch_model(id).await {
            Ok(model) => Ok(model),
            Err(e) => {
                tracing::warn!(provider = "xai", model = id, error = %e, "live lookup failed");
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
        let response = self.send_completions(&wire).await?;
        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::provider(format!("failed to parse grok response: {e}")))?;
        Ok(normalize_response(&parsed, &request.model))
    }

    async fn create_stream_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream> {
        let wire = build_request(request, true);
        let response = self.send_completions(&wire).await?;

        let ctx = StreamContext::new(&request.model);
        let events = response.bytes_stream().eventsource();
        Ok(Box::pin(translate_stream(events, ctx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ChatMessage, StopSequences};

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "grok-2".to_string(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hi".to_string(),
            }],
            temperature: 1.0,
            top_p: None,
            max_tokens: None,
            stream: false,
            stop: None,
        }
    }

    #[test]
    fn test_unset_params_omitted_on_wire() {
        let json = serde_json::to_value(build_request(&request(), false)).unwrap();
        assert!(json.get("top_p").is_none());
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("stop").is_none());
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_stop_string_forwarded_as_sequence() {
        let mut req = request();
        req.stop = Some(StopSequences::One("\n".to_string()));
        let wire = build_request(&req, true);
        assert_eq!(wire.stop, Some(vec!["\n".to_string()]));
        assert!(wire.stream);
    }

    #[test]
    fn test_normalize_response_restamps_id() {
        let wire: WireResponse = serde_json::from_str(
            r#"{"id":"abc123","object":"chat.completion","created":1,"model":"grok-2",
                "choices":[{"index":0,"message":{"role":"assistant","content":"Hello"},"finish_reason":"length"}],
                "usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#,
        )
        .unwrap();

        let resp = normalize_response(&wire, "grok-2");
        assert_eq!(resp.id, "chatcmpl-abc123");
        assert_eq!(resp.choices[0].message.content, "Hello");
        assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Length));
        assert_eq!(resp.usage.total_tokens, 12);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(
            map_finish_reason(Some("content_filter")),
            FinishReason::ContentFilter
        );
        assert_eq!(map_finish_reason(Some("tool_calls")), FinishReason::Stop);
    }

    #[test]
    fn test_stream_translator_skips_empty_choice_chunks() {
        let mut translator = StreamTranslator::new(StreamContext::new("m"));

        let keepalive: WireChunk = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(translator.on_chunk(&keepalive).is_empty());

        let content: WireChunk = serde_json::from_str(
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"A"},"finish_reason":null}]}"#,
        )
        .unwrap();
        let out = translator.on_chunk(&content);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].choices[0].delta.content.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_transport_failure_aborts_without_terminal_chunk() {
        let events = futures::stream::iter(vec![
            Ok(eventsource_stream::Event {
                event: "message".to_string(),
                data: r#"{"choices":[{"index":0,"delta":{"content":"A"},"finish_reason":null}]}"#
                    .to_string(),
                id: String::new(),
                retry: None,
            }),
            Err(eventsource_stream::EventStreamError::Transport(
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"),
            )),
        ]);

        let out: Vec<Result<String>> = translate_stream(events, StreamContext::new("m"))
            .collect()
            .await;

        // The upstream [DONE] never arrived, and the failure must not be
        // papered over with a finish chunk or the gateway's own sentinel.
        assert_eq!(out.len(), 2);
        assert!(out[0].as_ref().unwrap().contains("\"content\":\"A\""));
        assert!(matches!(out[1], Err(GatewayError::Stream { .. })));
    }

    #[test]
    fn test_stream_translator_splits_trailing_finish() {
        let mut translator = StreamTranslator::new(StreamContext::new("m"));

        let combined: WireChunk = serde_json::from_str(
            r#"{"choices":[{"index":0,"delta":{"content":"B"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        let out = translator.on_chunk(&combined);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].choices[0].delta.content.as_deref(), Some("B"));
        assert!(out[0].choices[0].finish_reason.is_none());
        assert_eq!(out[1].choices[0].finish_reason, Some(FinishReason::Stop));
        assert!(translator.is_finished());
        assert!(translator.finish().is_none());
    }
}
