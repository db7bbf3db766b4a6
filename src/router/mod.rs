//! HTTP control plane
//!
//! The authenticated JSON surface the controller drives: instance
//! lifecycle, SSH key provisioning, shutdown and emergency destruct.

mod extract;
mod handlers;
mod middleware;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::Configuration;
use crate::instance::InstanceManager;
use crate::storage::SecretStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Instance lifecycle manager
    pub manager: Arc<InstanceManager>,

    /// Agent secret store backing the auth middleware
    pub secrets: Arc<SecretStore>,

    /// Global configuration
    pub config: Arc<Configuration>,
}

/// Build the HTTP router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/ssh", post(handlers::add_ssh_key))
        .route(
            "/instances",
            get(handlers::get_instances)
                .post(handlers::create_instance)
                .put(handlers::manage_instance)
                .delete(handlers::delete_instance),
        )
        .route("/shutdown", post(handlers::shutdown))
        .route("/emergency", post(handlers::emergency))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_secret,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Once;
    use tower::ServiceExt;

    use crate::api::ControllerClient;

    static MOCK: Once = Once::new();

    const SECRET: &str = "router-test-secret";

    fn test_state(dir: &std::path::Path) -> AppState {
        MOCK.call_once(|| {
            keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        });

        let mut config = Configuration::default();
        config.system.authorized_keys_path = dir.join("ssh/authorized_keys");
        config.system.keyring_file = dir.join("qudata-agent.keyring");
        config.resolve_paths(dir);
        config.ensure_directories().unwrap();
        let config = Arc::new(config);

        let secrets = SecretStore::with_service("qudata-agent-test-router").unwrap();
        secrets.set_agent_secret(SECRET).unwrap();

        let client = Arc::new(ControllerClient::new(&config.remote, &secrets).unwrap());
        let manager = Arc::new(InstanceManager::new(config.clone(), client));

        AppState {
            manager,
            secrets: Arc::new(secrets),
            config,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ping_needs_no_auth() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_missing_secret_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/instances")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/instances")
                    .header("X-Agent-Secret", "guess")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_get_instances_with_secret() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/instances")
                    .header("X-Agent-Secret", SECRET)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["status"], "destroyed");
    }

    #[tokio::test]
    async fn test_ssh_missing_field_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ssh")
                    .header("X-Agent-Secret", SECRET)
                    .header("Content-Type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_malformed_json_body_is_enveloped() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/instances")
                    .header("X-Agent-Secret", SECRET)
                    .header("Content-Type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert!(!body["error"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_content_type_is_enveloped() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ssh")
                    .header("X-Agent-Secret", SECRET)
                    .body(Body::from(r#"{"ssh_pubkey":"ssh-ed25519 AAAA op"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("application/json"));
    }

    #[tokio::test]
    async fn test_ssh_add_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let keys_path = state.config.system.authorized_keys_path.clone();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ssh")
                    .header("X-Agent-Secret", SECRET)
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        r#"{"ssh_pubkey":"ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAAAA op"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(std::fs::read_to_string(keys_path)
            .unwrap()
            .contains("ssh-ed25519"));
    }

    #[tokio::test]
    async fn test_manage_without_instance_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/instances")
                    .header("X-Agent-Secret", SECRET)
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"action":"stop"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("No active instance"));
    }

    #[tokio::test]
    async fn test_shutdown_is_accepted() {
        // The SIGINT is scheduled a second out and this process has no
        // handler-relevant behavior in tests; only the response matters.
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/shutdown")
                    .header("X-Agent-Secret", SECRET)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
