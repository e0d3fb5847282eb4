//! Shared test setup: a router wired to a loopback mock provider.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tempfile::TempDir;

use muse::api::routes::create_router;
use muse::api::state::AppState;
use muse::settings::Settings;

pub const TEST_API_KEY: &str = "test-service-key";
pub const TEST_JWT_SECRET: &str = "test-jwt-secret";

/// Canned behavior for the mock upstream provider.
#[derive(Clone)]
pub enum Upstream {
    /// Answer 200 with this raw SSE body.
    Sse(String),
    /// Answer this status with a plain body.
    Status(u16, String),
    /// Answer 200 with this JSON body.
    Json(Value),
}

/// Spawn a mock OpenAI-compatible provider on a loopback port and return
/// its base URL.
pub async fn spawn_upstream(behavior: Upstream) -> String {
    let behavior = Arc::new(behavior);
    let app = Router::new().route(
        "/chat/completions",
        post(move || {
            let behavior = behavior.clone();
            async move {
                match behavior.as_ref() {
                    Upstream::Sse(body) => (
                        StatusCode::OK,
                        [("content-type", "text/event-stream")],
                        body.clone(),
                    )
                        .into_response(),
                    Upstream::Status(status, body) => (
                        StatusCode::from_u16(*status).expect("valid status"),
                        body.clone(),
                    )
                        .into_response(),
                    Upstream::Json(value) => Json(value.clone()).into_response(),
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    format!("http://{addr}")
}

/// A fully wired test app with persistence enabled and disk storage in a
/// temp dir. Keep the `TempDir` alive for the duration of the test.
pub struct TestApp {
    pub router: Router,
    _tmp: TempDir,
}

pub async fn test_app(upstream_url: &str) -> TestApp {
    build_app(upstream_url, true).await
}

pub async fn test_app_without_persistence(upstream_url: &str) -> TestApp {
    build_app(upstream_url, false).await
}

async fn build_app(upstream_url: &str, persistence: bool) -> TestApp {
    let tmp = tempfile::tempdir().expect("tempdir");

    let mut settings = Settings::default();
    settings.provider.base_url = upstream_url.to_string();
    settings.provider.api_key = Some("upstream-test-key".to_string());
    settings.auth.jwt_secret = Some(TEST_JWT_SECRET.to_string());
    settings.auth.api_keys = vec![TEST_API_KEY.to_string()];
    settings.storage.root_dir = tmp.path().join("uploads");
    settings.storage.public_base_url = "http://127.0.0.1:8089/uploads".to_string();
    settings.persistence.enabled = persistence;
    settings.persistence.database_path = tmp.path().join("muse.db");

    let state = AppState::from_settings(settings)
        .await
        .expect("building test state");

    TestApp {
        router: create_router(state),
        _tmp: tmp,
    }
}

/// Parse the `data:` payloads out of an SSE response body.
pub fn parse_events(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|block| {
            block
                .lines()
                .find_map(|line| line.strip_prefix("data: "))
                .and_then(|data| serde_json::from_str(data).ok())
        })
        .collect()
}

/// A standard streaming upstream body: the given fragments, then `[DONE]`.
pub fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        body.push_str(&format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{fragment}\"}}}}]}}\n\n"
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}
