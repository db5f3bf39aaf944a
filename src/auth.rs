//! Bearer-token access control for the gateway itself.
//!
//! Gateway tokens are independent of the upstream provider keys. The table
//! comes from the `API_KEYS` environment variable or the config file as
//! `user:token;user2:token2`. An empty table disables auth entirely.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::schema::ErrorResponse;

#[derive(Debug, Clone, Default)]
pub struct AuthKeys {
    // token -> username, so lookup is a single get on the hot path
    tokens: HashMap<String, String>,
}

impl AuthKeys {
    /// Parse a `user:token;user2:token2` table. Malformed pairs are logged
    /// and skipped rather than failing startup.
    pub fn parse(raw: &str) -> Self {
        let mut tokens = HashMap::new();
        for pair in raw.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once(':') {
                Some((user, token)) if !user.is_empty() && !token.is_empty() => {
                    tokens.insert(token.to_string(), user.to_string());
                }
                _ => {
                    tracing::warn!(pair, "Skipping malformed api_keys entry, expected user:token");
                }
            }
        }
        Self { tokens }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Look up a bearer token, returning the username it belongs to.
    pub fn authenticate(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(String::as_str)
    }
}

/// Routes that stay reachable without a token.
fn is_public(path: &str) -> bool {
    path == "/" || path == "/health"
}

pub async fn require_auth(
    State(keys): State<Arc<AuthKeys>>,
    request: Request,
    next: Next,
) -> Response {
    if !keys.is_enabled() || is_public(request.uri().path()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token.and_then(|t| keys.authenticate(t)) {
        Some(user) => {
            tracing::debug!(user, path = %request.uri().path(), "Authenticated request");
            next.run(request).await
        }
        None => {
            tracing::warn!(path = %request.uri().path(), "Rejected unauthenticated request");
            let err = ErrorResponse::invalid_request("Invalid or missing API key");
            (StatusCode::UNAUTHORIZED, Json(err)).into_response()
        }
    }
}
