use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    operators: Arc<HashMap<String, String>>,
}

/// Name of the operator whose key authenticated the request.
#[derive(Clone, Debug)]
pub struct Operator(pub String);

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("OPERATOR_API_KEYS").unwrap_or_default();
        Self::from_keys(&raw)
    }

    /// Parse comma separated `name:key` pairs.
    pub fn from_keys(raw: &str) -> Self {
        let mut operators = HashMap::new();
        for token in raw.split(',') {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut parts = trimmed.splitn(2, ':');
            let name = parts.next().map(str::trim).filter(|s| !s.is_empty());
            let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
            match (name, key) {
                (Some(name), Some(key)) => {
                    operators.insert(key.to_string(), name.to_string());
                }
                _ => warn!(
                    target = "bulk.api",
                    "ignored malformed OPERATOR_API_KEYS entry"
                ),
            }
        }
        if operators.is_empty() {
            warn!(
                target = "bulk.api",
                "OPERATOR_API_KEYS produced no keys; operator routes will reject every request"
            );
        } else {
            info!(
                target = "bulk.api",
                key_count = operators.len(),
                "loaded operator keys"
            );
        }
        Self {
            operators: Arc::new(operators),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<Operator> {
        self.operators.get(presented).cloned().map(Operator)
    }
}

pub async fn require_operator(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Operator-Key or Bearer token",
        ));
    };
    let Some(operator) = state.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };
    request.extensions_mut().insert(operator);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Operator-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}
