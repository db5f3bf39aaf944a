//! Canonical OpenAI-compatible request/response/chunk types.
//!
//! Every other component speaks these shapes: the HTTP layer deserializes
//! inbound requests into them, the provider adapters translate them to and
//! from each backend's native wire format. Ordering of `messages` and
//! `choices` is meaningful and preserved throughout.

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// `stop` accepts either a bare string or a list of strings on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    /// Normalize to a sequence; providers that take a list always get one.
    pub fn as_sequence(&self) -> Vec<String> {
        match self {
            StopSequences::One(s) => vec![s.clone()],
            StopSequences::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
}

fn default_temperature() -> f64 {
    1.0
}

impl ChatCompletionRequest {
    /// Range and shape checks the wire format alone cannot enforce.
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(GatewayError::invalid_request(
                "messages must not be empty",
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(GatewayError::invalid_request(
                "temperature must be between 0.0 and 2.0",
            ));
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(GatewayError::invalid_request(
                    "top_p must be between 0.0 and 1.0",
                ));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(GatewayError::invalid_request(
                "max_tokens must be greater than 0",
            ));
        }
        Ok(())
    }

    /// The first system message, if any. Providers that take system
    /// instructions out-of-band use this; later system messages are ignored.
    pub fn system_instruction(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// Conversation turns with system messages removed, original order kept.
    pub fn conversation_turns(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    /// `stop` normalized to a sequence, or `None` if unset.
    pub fn stop_sequences(&self) -> Option<Vec<String>> {
        self.stop.as_ref().map(StopSequences::as_sequence)
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Totals are derived, never reported independently.
    pub fn from_counts(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: Usage,
}

impl ChatCompletionResponse {
    /// A completion with a single assistant choice at index 0.
    pub fn single_choice(
        id: String,
        model: String,
        content: String,
        finish_reason: FinishReason,
        usage: Usage,
    ) -> Self {
        Self {
            id,
            object: "chat.completion".to_string(),
            created: unix_timestamp(),
            model,
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: ChatMessage::assistant(content),
                finish_reason: Some(finish_reason),
            }],
            usage,
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming chunk types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

// ---------------------------------------------------------------------------
// Model listing types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, created: u64, owned_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created,
            owned_by: owned_by.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

impl ModelsResponse {
    pub fn new(data: Vec<ModelInfo>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Error body
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                error_type: error_type.to_string(),
                code: None,
            },
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new("invalid_request_error", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new("not_found_error", msg)
    }

    pub fn api_error(msg: impl Into<String>) -> Self {
        Self::new("api_error", msg)
    }
}

/// Current unix time in seconds; `created` stamps come from the gateway's
/// clock, not the provider's, since not every provider reports one.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_single_string_normalizes_to_sequence() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"stop":"END"}"#,
        )
        .unwrap();
        assert_eq!(req.stop_sequences(), Some(vec!["END".to_string()]));
    }

    #[test]
    fn test_stop_list_passes_through() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"stop":["a","b"]}"#,
        )
        .unwrap();
        assert_eq!(
            req.stop_sequences(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_temperature_defaults_to_one() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert!((req.temperature - 1.0).abs() < f64::EPSILON);
        assert!(!req.stream);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();

        req.temperature = 3.0;
        assert!(req.validate().is_err());

        req.temperature = 1.0;
        req.top_p = Some(1.5);
        assert!(req.validate().is_err());

        req.top_p = None;
        req.max_tokens = Some(0);
        assert!(req.validate().is_err());

        req.max_tokens = None;
        req.messages.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_malformed_role_rejected_at_parse_time() {
        let result = serde_json::from_str::<ChatCompletionRequest>(
            r#"{"model":"m","messages":[{"role":"wizard","content":"hi"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_first_system_message_wins() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"m","messages":[
                {"role":"system","content":"first"},
                {"role":"user","content":"hi"},
                {"role":"system","content":"second"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(req.system_instruction(), Some("first"));
        assert_eq!(req.conversation_turns().count(), 1);
    }

    #[test]
    fn test_usage_total_is_sum() {
        let usage = Usage::from_counts(10, 20);
        assert_eq!(usage.total_tokens, 30);
    }

    #[test]
    fn test_finish_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&FinishReason::ContentFilter).unwrap(),
            "\"content_filter\""
        );
        assert_eq!(
            serde_json::to_string(&FinishReason::Stop).unwrap(),
            "\"stop\""
        );
    }

    #[test]
    fn test_chunk_delta_skips_absent_fields() {
        let chunk = ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: "m".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(FinishReason::Stop),
            }],
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(!json.contains("\"content\""));
        assert!(json.contains("\"finish_reason\":\"stop\""));
    }
}
