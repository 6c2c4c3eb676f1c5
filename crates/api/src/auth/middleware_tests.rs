//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Missing and malformed bearer tokens
//! - Expired tokens
//! - Admin-only routes

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Extension, Router,
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::super::jwt::{JwtManager, ROLE_ADMIN, ROLE_CLIENT};
    use super::super::middleware::*;

    const TEST_SECRET: &str = "test-jwt-secret-key-for-testing-only";

    fn auth_state() -> AuthState {
        AuthState {
            jwt_manager: JwtManager::new(TEST_SECRET),
        }
    }

    async fn whoami(Extension(user): Extension<AuthUser>) -> String {
        user.user_id.to_string()
    }

    fn app() -> Router {
        let state = auth_state();
        Router::new()
            .route(
                "/me",
                get(whoami).layer(middleware::from_fn_with_state(state.clone(), require_auth)),
            )
            .route(
                "/admin",
                get(whoami).layer(middleware::from_fn_with_state(state, require_admin)),
            )
    }

    fn token(role: &str, ttl: time::Duration) -> (Uuid, String) {
        let user = Uuid::new_v4();
        let token = JwtManager::new(TEST_SECRET)
            .issue(user, "a@x.com", role, ttl)
            .unwrap();
        (user, token)
    }

    async fn call(path: &str, token: Option<&str>) -> StatusCode {
        let mut request = Request::builder().uri(path);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        app()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        assert_eq!(call("/me", None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_garbage_token_is_unauthorized() {
        assert_eq!(call("/me", Some("not-a-jwt")).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_expired_token_is_unauthorized() {
        let (_, token) = token(ROLE_CLIENT, time::Duration::hours(-2));
        assert_eq!(call("/me", Some(&token)).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_token_reaches_handler() {
        let (_, token) = token(ROLE_CLIENT, time::Duration::hours(1));
        assert_eq!(call("/me", Some(&token)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_client_cannot_reach_admin_route() {
        let (_, client) = token(ROLE_CLIENT, time::Duration::hours(1));
        assert_eq!(call("/admin", Some(&client)).await, StatusCode::FORBIDDEN);

        let (_, admin) = token(ROLE_ADMIN, time::Duration::hours(1));
        assert_eq!(call("/admin", Some(&admin)).await, StatusCode::OK);
    }
}
