use crate::auth::{self, AuthKeys};
use crate::error::GatewayError;
use crate::registry::ModelRegistry;
use crate::schema::{ChatCompletionRequest, ErrorResponse, ModelsResponse};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub auth: Arc<AuthKeys>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_list_models))
        .route("/v1/models/:id", get(handle_get_model))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .layer(axum::middleware::from_fn_with_state(
            state.auth.clone(),
            auth::require_auth,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "chat-bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/v1/models", "/v1/models/{id}", "/v1/chat/completions"],
    }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    Json(ModelsResponse::new(state.registry.list_models().await))
}

async fn handle_get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.registry.get_model(&id).await {
        Ok(model) => Json(model).into_response(),
        Err(e) => {
            let err = ErrorResponse::not_found(e.to_string());
            (StatusCode::NOT_FOUND, Json(err)).into_response()
        }
    }
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse request body");
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {}", e));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    tracing::info!(
        model = %req.model,
        streaming = req.stream,
        messages = req.messages.len(),
        "Incoming completion request"
    );

    if req.stream {
        handle_streaming(state, req).await
    } else {
        handle_non_streaming(state, req).await
    }
}

async fn handle_non_streaming(state: Arc<AppState>, req: ChatCompletionRequest) -> Response {
    match state.registry.create_completion(&req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_streaming(state: Arc<AppState>, mut req: ChatCompletionRequest) -> Response {
    // The registry's non-streaming entrypoint rejects stream=true; the
    // streaming one takes the request as-is.
    req.stream = true;

    match state.registry.create_stream_completion(&req).await {
        Ok(stream) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("connection", "keep-alive")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => error_response(e),
    }
}

/// Map a gateway error to an HTTP status and OpenAI-style error body.
fn error_response(e: GatewayError) -> Response {
    match e {
        GatewayError::InvalidRequest { .. } | GatewayError::ModelNotFound { .. } => {
            let err = ErrorResponse::invalid_request(e.to_string());
            (StatusCode::BAD_REQUEST, Json(err)).into_response()
        }
        other => {
            tracing::error!(error = %other, "Upstream failure");
            let err = ErrorResponse::api_error(other.to_string());
            (StatusCode::BAD_GATEWAY, Json(err)).into_response()
        }
    }
}
