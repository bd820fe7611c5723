//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Bearer token authentication (valid, expired, malformed, missing)
//! - Optional authentication on public routes
//! - Client address extraction

#[cfg(test)]
mod tests {
    use super::super::jwt::JwtManager;
    use super::super::middleware::*;
    use agora_shared::PrincipalId;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
        Extension, Router,
    };
    use time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    fn auth_state() -> AuthState {
        AuthState {
            jwt_manager: JwtManager::new(SECRET),
        }
    }

    fn protected_app() -> Router {
        Router::new()
            .route(
                "/me",
                get(|Extension(user): Extension<AuthUser>| async move {
                    user.principal_id.to_string()
                }),
            )
            .layer(from_fn_with_state(auth_state(), require_auth))
    }

    fn public_app() -> Router {
        Router::new()
            .route(
                "/whoami",
                get(|request: Request<Body>| async move {
                    request
                        .extensions()
                        .get::<AuthUser>()
                        .map(|u| u.principal_id.to_string())
                        .unwrap_or_else(|| "anonymous".to_string())
                }),
            )
            .layer(from_fn_with_state(auth_state(), optional_auth))
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(path: &str, authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_reaches_handler() {
        let principal = PrincipalId::new();
        let token = auth_state()
            .jwt_manager
            .issue(principal, None, Duration::hours(1))
            .unwrap();

        let response = protected_app()
            .oneshot(request("/me", Some(&format!("Bearer {}", token))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, principal.to_string());
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let response = protected_app().oneshot(request("/me", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_text(response).await.contains("Authentication required"));
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_is_unauthorized() {
        let response = protected_app()
            .oneshot(request("/me", Some("Basic dXNlcjpwYXNz")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_text(response)
            .await
            .contains("Invalid authentication format"));
    }

    #[tokio::test]
    async fn test_expired_token_is_unauthorized() {
        let token = auth_state()
            .jwt_manager
            .issue(PrincipalId::new(), None, Duration::hours(-2))
            .unwrap();
        let response = protected_app()
            .oneshot(request("/me", Some(&format!("Bearer {}", token))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_optional_auth_admits_anonymous() {
        let response = public_app()
            .oneshot(request("/whoami", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "anonymous");

        // A bad token degrades to anonymous rather than failing
        let response = public_app()
            .oneshot(request("/whoami", Some("Bearer not-a-jwt")))
            .await
            .unwrap();
        assert_eq!(body_text(response).await, "anonymous");
    }

    #[tokio::test]
    async fn test_optional_auth_attaches_principal() {
        let principal = PrincipalId::new();
        let token = auth_state()
            .jwt_manager
            .issue(principal, None, Duration::hours(1))
            .unwrap();
        let response = public_app()
            .oneshot(request("/whoami", Some(&format!("Bearer {}", token))))
            .await
            .unwrap();
        assert_eq!(body_text(response).await, principal.to_string());
    }

    #[test]
    fn test_client_address_prefers_first_forwarded_hop() {
        let request = Request::builder()
            .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .header("X-Real-IP", "10.0.0.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_address(&request).as_deref(), Some("203.0.113.7"));

        let request = Request::builder()
            .header("X-Real-IP", "198.51.100.4")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_address(&request).as_deref(), Some("198.51.100.4"));

        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_address(&request), None);
    }
}
