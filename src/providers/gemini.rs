//! Google Gemini adapter over the Generative Language REST API.
//!
//! Role mapping matters here: the canonical `assistant` role is renamed
//! `model`, plain text is wrapped in `parts`, and the system instruction goes
//! into the dedicated `systemInstruction` field. The streaming protocol has
//! no explicit terminal event, so the terminal chunk is synthesized when the
//! provider stream ends.

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{sse_data, ChatProvider, ChunkStream, ProviderKind, StreamContext, SSE_DONE};
use crate::error::{GatewayError, Result};
use crate::schema::{
    unix_timestamp, ChatCompletionRequest, ChatCompletionResponse, FinishReason, ModelInfo, Role,
    Usage,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const FALLBACK_MODELS: &[&str] = &["gemini-1.5-pro", "gemini-1.5-flash", "gemini-1.0-pro"];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    generation_config: WireGenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

/// Parts carrying anything other than text (function calls, inline data)
/// deserialize with `text: None` and are skipped during normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    candidate_count: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct WireModelsResponse {
    #[serde(default)]
    models: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireModel {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn build_request(req: &ChatCompletionRequest) -> WireRequest {
    let contents = req
        .conversation_turns()
        .map(|m| WireContent {
            role: Some(match m.role {
                Role::Assistant => "model".to_string(),
                _ => "user".to_string(),
            }),
            parts: vec![WirePart {
                text: Some(m.content.clone()),
            }],
        })
        .collect();

    let system_instruction = req.system_instruction().map(|text| WireContent {
        role: None,
        parts: vec![WirePart {
            text: Some(text.to_string()),
        }],
    });

    WireRequest {
        contents,
        system_instruction,
        generation_config: WireGenerationConfig {
            candidate_count: 1,
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: req.max_tokens,
            stop_sequences: req.stop_sequences(),
        },
    }
}

/// Fixed mapping from Gemini finish reasons to the canonical enum. Safety and
/// recitation blocks both count as content filtering.
fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn candidate_text(candidate: &WireCandidate) -> String {
    candidate
        .content
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.text.as_deref())
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_response(resp: &WireResponse, model: &str) -> ChatCompletionResponse {
    let candidate = resp.candidates.first();
    let content = candidate.map(candidate_text).unwrap_or_default();
    let finish_reason =
        map_finish_reason(candidate.and_then(|c| c.finish_reason.as_deref()));

    // Gemini does not always report usage; zeros mean "unknown", not omitted.
    let usage = resp
        .usage_metadata
        .as_ref()
        .map(|u| Usage::from_counts(u.prompt_token_count, u.candidates_token_count))
        .unwrap_or_default();

    ChatCompletionResponse::single_choice(
        super::completion_id(None),
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

/// Each streamed chunk's candidate text becomes one content chunk. The last
/// seen finish reason is held back and used for the synthesized terminal
/// chunk once the provider closes the stream.
struct StreamTranslator {
    ctx: StreamContext,
    state: StreamState,
    finish_reason: FinishReason,
}

impl StreamTranslator {
    fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            state: StreamState::Open,
            finish_reason: FinishReason::Stop,
        }
    }

    fn on_chunk(&mut self, chunk: &WireResponse) -> Option<crate::schema::ChatCompletionChunk> {
        if self.state == StreamState::Finished {
            return None;
        }
        let candidate = chunk.candidates.first()?;
        if let Some(reason) = candidate.finish_reason.as_deref() {
            self.finish_reason = map_finish_reason(Some(reason));
        }
        let text = candidate_text(candidate);
        if text.is_empty() {
            return None;
        }
        Some(self.ctx.content_chunk(&text))
    }

    fn finish(&mut self) -> Option<crate::schema::ChatCompletionChunk> {
        if self.state == StreamState::Finished {
            return None;
        }
        self.state = StreamState::Finished;
        Some(self.ctx.finish_chunk(self.finish_reason))
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
                    tracing::error!(error = %e, "gemini stream transport failure");
                    yield Err(GatewayError::stream(format!("upstream stream failed: {e}")));
                    return;
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }

            let parsed: WireResponse = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unparseable gemini chunk");
                    continue;
                }
            };

            if let Some(chunk) = translator.on_chunk(&parsed) {
                yield sse_data(&chunk);
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

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, api_key: String, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    fn generate_url(&self, model: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/models/{model}:generateContent?key={}", self.api_key)
    }

    fn stream_url(&self, model: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!(
            "{base}/models/{model}:streamGenerateContent?alt=sse&key={}",
            self.api_key
        )
    }

    fn fallback_models(&self) -> Vec<ModelInfo> {
        let created = unix_timestamp();
        FALLBACK_MODELS
            .iter()
            .map(|id| ModelInfo::new(*id, created, "google"))
            .collect()
    }

    async fn fetch_models(&self) -> Result<Vec<ModelInfo>> {
        let base = self.base_url.trim_end_matches('/');
        let response = self
            .client
            .get(format!("{base}/models?key={}", self.api_key))
            .send()
            .await?
            .error_for_status()?;

        let parsed: WireModelsResponse = response.json().await?;
        let created = unix_timestamp();
        Ok(parsed
            .models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods
                    .iter()
                    .any(|method| method == "generateContent")
            })
            .map(|m| ModelInfo::new(strip_model_prefix(&m.name), created, "google"))
            .collect())
    }

    async fn fetch_model(&self, id: &str) -> Result<ModelInfo> {
        let base = self.base_url.trim_end_matches('/');
        let name = if id.starts_with("models/") {
            id.to_string()
        } else {
            format!("models/{id}")
        };
        let response = self
            .client
            .get(format!("{base}/{name}?key={}", self.api_key))
            .send()
            .await?
            .error_for_status()?;

        let model: WireModel = response.json().await?;
        Ok(ModelInfo::new(
            strip_model_prefix(&model.name),
            unix_timestamp(),
            "google",
        ))
    }

    async fn send_generate(&self, url: &str, wire: &WireRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .json(wire)
            .send()
            .await
            .map_err(|e| GatewayError::provider(format!("gemini request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(provider = "google", status = %status, "upstream returned error");
            return Err(GatewayError::provider(format!(
                "gemini returned status {status}: {body}"
            )));
        }
        Ok(response)
    }
}

fn strip_model_prefix(name: &str) -> &str {
    name.strip_prefix("models/").unwrap_or(name)
}

#[async_trait::async_trait]
impl ChatProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        match self.fetch_models().await {
            Ok(models) => {
                tracing::info!(provider = "google", count = models.len(), "fetched models");
                models
            }
            Err(e) => {
                tracing::warn!(provider = "google", error = %e, "live listing failed, using fallback list");
                self.fallback_models()
            }
        }
    }

    async fn get_model(&self, id: &str) -> Result<ModelInfo> {
        match self.fetch_model(id).await {
            Ok(model) => Ok(model),
            Err(e) => {
                tracing::warn!(provider = "google", model = id, error = %e, "live lookup failed");
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
        let wire = build_request(request);
        let url = self.generate_url(&request.model);
        let response = self.send_generate(&url, &wire).await?;
        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::provider(format!("failed to parse gemini response: {e}")))?;
        Ok(normalize_response(&parsed, &request.model))
    }

    async fn create_stream_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream> {
        let wire = build_request(request);
        let url = self.stream_url(&request.model);
        let response = self.send_generate(&url, &wire).await?;

        let ctx = StreamContext::new(&request.model);
        let events = response.bytes_stream().eventsource();
        Ok(Box::pin(translate_stream(events, ctx)))
    }
}
