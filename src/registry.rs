//! Model registry and provider router.
//!
//! One [`ModelRegistry`] is built at startup from whichever providers have
//! credentials and lives for the process lifetime. It owns model-identity
//! routing, the cross-provider availability cache, and the two completion
//! entrypoints that every request goes through.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::providers::{ChatProvider, ChunkStream, ProviderKind};
use crate::schema::{ChatCompletionRequest, ChatCompletionResponse, ModelInfo};

/// Model-name substrings routed to each provider, checked in this order.
/// The order is deliberate and load-bearing: it is the documented precedence
/// for identifiers that could match more than one rule. Identifiers matching
/// no rule fall through to the first registered provider.
const ROUTING_RULES: &[(&str, ProviderKind)] = &[
    ("grok", ProviderKind::Xai),
    ("gemini", ProviderKind::Google),
    ("claude", ProviderKind::Anthropic),
];

pub struct ModelRegistry {
    providers: Vec<Arc<dyn ChatProvider>>,
    // Rebuilt as a whole and swapped in; readers see the old set or the new
    // one, never a partial union.
    available: RwLock<Option<Arc<HashSet<String>>>>,
}

impl ModelRegistry {
    /// Build from the configured providers. Registration order doubles as
    /// the default-route precedence and the aggregation order.
    pub fn new(providers: Vec<Arc<dyn ChatProvider>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(GatewayError::config(
                "no providers configured; set at least one provider API key",
            ));
        }
        Ok(Self {
            providers,
            available: RwLock::new(None),
        })
    }

    /// Select the provider that owns a model identifier.
    pub fn provider_for(&self, model: &str) -> &Arc<dyn ChatProvider> {
        for (needle, kind) in ROUTING_RULES {
            if model.contains(needle) {
                if let Some(provider) = self.providers.iter().find(|p| p.kind() == *kind) {
                    return provider;
                }
            }
        }
        &self.providers[0]
    }

    /// Aggregate every provider's models in registration order. Duplicate
    /// ids across providers are legal and kept.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let mut all = Vec::new();
        for provider in &self.providers {
            all.extend(provider.list_models().await);
        }
        all
    }

    pub async fn get_model(&self, id: &str) -> Result<ModelInfo> {
        self.provider_for(id).get_model(id).await
    }

    /// Non-streaming completion. Rejects streaming requests; streaming has
    /// its own entrypoint.
    pub async fn create_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        if request.stream {
            return Err(GatewayError::invalid_request(
                "stream=true is not supported on this entrypoint; use the streaming endpoint",
            ));
        }
        request.validate()?;
        self.ensure_available(&request.model).await?;

        let provider = self.provider_for(&request.model);
        tracing::info!(model = %request.model, provider = %provider.kind(), "dispatching completion");
        provider.create_completion(request).await
    }

    /// Streaming completion as a finite, single-pass stream of SSE lines.
    pub async fn create_stream_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream> {
        request.validate()?;
        self.ensure_available(&request.model).await?;

        let provider = self.provider_for(&request.model);
        tracing::info!(model = %request.model, provider = %provider.kind(), "dispatching streaming completion");
        provider.create_stream_completion(request).await
    }

    /// Validate a model id against the memoized availability set. A miss
    /// forces exactly one cache rebuild before failing.
    async fn ensure_available(&self, model: &str) -> Result<()> {
        if let Some(set) = self.available.read().await.as_ref() {
            if set.contains(model) {
                return Ok(());
            }
        }

        let set = self.rebuild_available().await;
        if set.contains(model) {
            Ok(())
        } else {
            tracing::warn!(model, "unknown model requested");
            Err(GatewayError::model_not_found(model))
        }
    }

    async fn rebuild_available(&self) -> Arc<HashSet<String>> {
        let mut ids = HashSet::new();
        for provider in &self.providers {
            ids.extend(provider.list_models().await.into_iter().map(|m| m.id));
        }
        let set = Arc::new(ids);
        *self.available.write().await = Some(Arc::clone(&set));
        set
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::providers::StreamContext;
    use crate::schema::{unix_timestamp, ChatMessage, FinishReason, Role, Usage};

    struct StubProvider {
        kind: ProviderKind,
        models: Vec<&'static str>,
        list_calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(kind: ProviderKind, models: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                models,
                list_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatProvider for StubProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn list_models(&self) -> Vec<ModelInfo> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let created = unix_timestamp();
            self.models
                .iter()
                .map(|id| ModelInfo::new(*id, created, self.kind.name()))
                .collect()
        }

        async fn get_model(&self, id: &str) -> Result<ModelInfo> {
            self.models
                .iter()
                .find(|m| **m == id)
                .map(|m| ModelInfo::new(*m, 0, self.kind.name()))
                .ok_or_else(|| GatewayError::model_not_found(id))
        }

        async fn create_completion(
            &self,
            request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse> {
            Ok(ChatCompletionResponse::single_choice(
                "chatcmpl-stub".to_string(),
                request.model.clone(),
                "stub".to_string(),
                FinishReason::Stop,
                Usage::from_counts(1, 2),
            ))
        }

        async fn create_stream_completion(
            &self,
            request: &ChatCompletionRequest,
        ) -> Result<ChunkStream> {
            let ctx = StreamContext::new(&request.model);
            let lines = vec![
                crate::providers::sse_data(&ctx.content_chunk("stub")),
                crate::providers::sse_data(&ctx.finish_chunk(FinishReason::Stop)),
                Ok(crate::providers::SSE_DONE.to_string()),
            ];
            Ok(Box::pin(futures::stream::iter(lines)))
        }
    }

    fn registry() -> (ModelRegistry, Arc<StubProvider>, Arc<StubProvider>, Arc<StubProvider>) {
        let anthropic = StubProvider::new(
            ProviderKind::Anthropic,
            vec!["claude-sonnet-4-20250514", "claude-3-haiku-20240307"],
        );
        let google = StubProvider::new(ProviderKind::Google, vec!["gemini-1.5-pro"]);
        let xai = StubProvider::new(ProviderKind::Xai, vec!["grok-2"]);
        let registry = ModelRegistry::new(vec![
            anthropic.clone() as Arc<dyn ChatProvider>,
            google.clone() as Arc<dyn ChatProvider>,
            xai.clone() as Arc<dyn ChatProvider>,
        ])
        .unwrap();
        (registry, anthropic, google, xai)
    }

    fn request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: "Hello".to_string(),
            }],
            temperature: 1.0,
            top_p: None,
            max_tokens: None,
            stream: false,
            stop: None,
        }
    }

    #[test]
    fn test_empty_registry_rejected() {
        assert!(ModelRegistry::new(Vec::new()).is_err());
    }

    #[test]
    fn test_routing_precedence() {
        let (registry, ..) = registry();
        assert_eq!(
            registry.provider_for("grok-2-latest").kind(),
            ProviderKind::Xai
        );
        assert_eq!(
            registry.provider_for("gemini-1.5-flash").kind(),
            ProviderKind::Google
        );
        assert_eq!(
            registry.provider_for("claude-3-haiku-20240307").kind(),
            ProviderKind::Anthropic
        );
        // No rule matches: first registered provider wins.
        assert_eq!(
            registry.provider_for("mystery-model").kind(),
            ProviderKind::Anthropic
        );
    }

    #[tokio::test]
    async fn test_list_models_aggregates_in_order() {
        let (registry, ..) = registry();
        let models = registry.list_models().await;
        assert_eq!(models.len(), 4);
        assert_eq!(models[0].owned_by, "anthropic");
        assert_eq!(models[3].owned_by, "xai");
    }

    #[tokio::test]
    async fn test_unknown_model_forces_exactly_one_rebuild() {
        let (registry, anthropic, ..) = registry();

        // Warm the cache.
        registry
            .create_completion(&request("claude-sonnet-4-20250514"))
            .await
            .unwrap();
        let calls_after_warm = anthropic.list_calls.load(Ordering::SeqCst);
        assert_eq!(calls_after_warm, 1);

        let err = registry
            .create_completion(&request("nonexistent-model"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotFound { .. }));
        assert_eq!(anthropic.list_calls.load(Ordering::SeqCst), calls_after_warm + 1);

        // Known models keep hitting the cache without rebuilding.
        registry
            .create_completion(&request("claude-sonnet-4-20250514"))
            .await
            .unwrap();
        assert_eq!(anthropic.list_calls.load(Ordering::SeqCst), calls_after_warm + 1);
    }

    #[tokio::test]
    async fn test_stream_rejected_on_completion_entrypoint() {
        let (registry, ..) = registry();
        let mut req = request("claude-sonnet-4-20250514");
        req.stream = true;
        let err = registry.create_completion(&req).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_usage_total_invariant() {
        let (registry, ..) = registry();
        let resp = registry
            .create_completion(&request("claude-sonnet-4-20250514"))
            .await
            .unwrap();
        assert_eq!(
            resp.usage.total_tokens,
            resp.usage.prompt_tokens + resp.usage.completion_tokens
        );
    }

    #[tokio::test]
    async fn test_get_model_not_found() {
        let (registry, ..) = registry();
        assert!(registry.get_model("claude-3-haiku-20240307").await.is_ok());
        assert!(matches!(
            registry.get_model("claude-imaginary").await.unwrap_err(),
            GatewayError::ModelNotFound { .. }
        ));
    }
}
