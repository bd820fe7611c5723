//! Authentication middleware for Axum

use std::net::SocketAddr;

use agora_shared::PrincipalId;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use super::jwt::JwtManager;

/// Authenticated principal extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub principal_id: PrincipalId,
    pub email: Option<String>,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Client address from proxy headers, falling back to the socket peer
pub fn client_address(request: &Request) -> Option<String> {
    let headers = request.headers();
    // X-Forwarded-For may hold a chain; the first hop is the client
    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|h| h.to_str().ok()) {
        if let Some(first) = xff.split(',').next().map(str::trim) {
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    if let Some(ip) = headers.get("X-Real-IP").and_then(|h| h.to_str().ok()) {
        return Some(ip.to_string());
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

fn authenticate(auth_state: &AuthState, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
    let token = match headers.get(AUTHORIZATION) {
        None => return Err(AuthError::MissingAuth),
        Some(_) => extract_bearer_token(headers).ok_or(AuthError::InvalidAuthFormat)?,
    };
    let claims = auth_state
        .jwt_manager
        .validate_access_token(token)
        .map_err(|e| {
            tracing::debug!(error = %e, "Bearer token rejected");
            AuthError::InvalidToken
        })?;

    Ok(AuthUser {
        principal_id: claims.principal_id(),
        email: claims.email,
    })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&auth_state, request.headers()) {
        Ok(auth_user) => {
            tracing::debug!(
                path = %request.uri().path(),
                principal_id = %auth_user.principal_id,
                "Request authenticated"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %request.uri().path(), error = %err, "Authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that authenticates when a token is present and otherwise
/// lets the request through anonymously
pub async fn optional_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Ok(auth_user) = authenticate(&auth_state, request.headers()) {
        request.extensions_mut().insert(auth_user);
    }
    next.run(request).await
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": "unauthorized"
        }));

        (status, body).into_response()
    }
}
