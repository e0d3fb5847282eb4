//! API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{
    TEST_API_KEY, TEST_JWT_SECRET, Upstream, parse_events, spawn_upstream, sse_body, test_app,
    test_app_without_persistence,
};

const BODY_LIMIT: usize = 1024 * 1024;

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .uri("/api/chat")
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json")
        .header("apikey", TEST_API_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), BODY_LIMIT)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn bearer_token(sub: &str) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    #[derive(serde::Serialize)]
    struct Claims {
        sub: String,
        exp: i64,
    }

    encode(
        &Header::default(),
        &Claims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
        },
        &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Health endpoint works without authentication.
#[tokio::test]
async fn test_health_endpoint() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&[]))).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Chat rejects callers with neither a bearer token nor an API key.
#[tokio::test]
async fn test_chat_requires_credentials() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&["hi"]))).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/api/chat")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"tool": "chat", "message": "hi", "stream": true}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// A valid bearer token is as good as an API key.
#[tokio::test]
async fn test_chat_accepts_bearer_token() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&["hey"]))).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/api/chat")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", bearer_token("user-7")),
                )
                .body(Body::from(
                    json!({"tool": "chat", "message": "hi", "stream": true}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

/// A body that isn't JSON fails with 400 before any upstream call.
#[tokio::test]
async fn test_malformed_body_is_rejected() {
    // Upstream would fail the test loudly if it were ever reached.
    let upstream = spawn_upstream(Upstream::Status(500, "must not be called".into())).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/api/chat")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .header("apikey", TEST_API_KEY)
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Streamed tokens are re-framed as this app's events, ending in `done`.
#[tokio::test]
async fn test_stream_relays_tokens_in_order() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&["Hel", "lo ", "world"]))).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .oneshot(chat_request(
            json!({"tool": "chat", "message": "greet me", "stream": true}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"))
    );

    let events = parse_events(&body_string(response).await);
    let tokens: Vec<&str> = events
        .iter()
        .filter(|e| e["type"] == "token")
        .map(|e| e["content"].as_str().unwrap())
        .collect();

    assert_eq!(tokens, vec!["Hel", "lo ", "world"]);
    assert_eq!(events.last().unwrap()["type"], "done");
}

/// A malformed upstream chunk is skipped; the stream carries on.
#[tokio::test]
async fn test_malformed_chunk_does_not_kill_the_stream() {
    let body = format!("data: {{bad json}}\n\n{}", sse_body(&["hi"]));
    let upstream = spawn_upstream(Upstream::Sse(body)).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .oneshot(chat_request(
            json!({"tool": "chat", "message": "resilience", "stream": true}),
        ))
        .await
        .unwrap();

    let events = parse_events(&body_string(response).await);
    let tokens: Vec<&str> = events
        .iter()
        .filter(|e| e["type"] == "token")
        .map(|e| e["content"].as_str().unwrap())
        .collect();

    assert_eq!(tokens, vec!["hi"]);
    assert_eq!(events.last().unwrap()["type"], "done");
}

/// `[DONE]` alone produces no token, just the terminal event.
#[tokio::test]
async fn test_done_sentinel_produces_no_token() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&[]))).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .oneshot(chat_request(
            json!({"tool": "chat", "message": "quiet", "stream": true}),
        ))
        .await
        .unwrap();

    let events = parse_events(&body_string(response).await);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "done");
}

/// An upstream rejection becomes a terminal error event, not a dropped
/// connection, and no `done` follows it.
#[tokio::test]
async fn test_upstream_failure_becomes_error_event() {
    let upstream = spawn_upstream(Upstream::Status(429, "rate limited".into())).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .oneshot(chat_request(
            json!({"tool": "chat", "message": "hi", "stream": true}),
        ))
        .await
        .unwrap();

    // The SSE response itself opened fine; the failure is in-band.
    assert_eq!(response.status(), StatusCode::OK);
    let events = parse_events(&body_string(response).await);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "error");
    let message = events[0]["message"].as_str().unwrap();
    assert!(message.contains("429"));
    assert!(message.contains("rate limited"));
}

/// Without `stream`, the proxy collects the reply into plain JSON.
#[tokio::test]
async fn test_non_streaming_fallback() {
    let upstream = spawn_upstream(Upstream::Json(json!({
        "choices": [{"message": {"content": "full reply"}}]
    })))
    .await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .oneshot(chat_request(
            json!({"tool": "chat", "message": "hi", "stream": false}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["reply"], "full reply");
}

fn conversation_payload() -> Value {
    json!({
        "id": "conv-42",
        "title": "Beach captions",
        "messages": [
            {"id": "m-1", "role": "user", "content": "caption my beach pic", "createdAt": 1000},
            {"id": "m-2", "role": "assistant", "content": "Tide and seek.", "createdAt": 2000}
        ],
        "createdAt": 1000,
        "updatedAt": 2000
    })
}

/// Upsert then read back: the ordered message list and title survive.
#[tokio::test]
async fn test_conversation_round_trip() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&[]))).await;
    let app = test_app(&upstream).await;
    let payload = conversation_payload();

    let put = Request::builder()
        .uri("/api/conversations/conv-42")
        .method(Method::PUT)
        .header(header::CONTENT_TYPE, "application/json")
        .header("apikey", TEST_API_KEY)
        .body(Body::from(payload.to_string()))
        .unwrap();
    let response = app.router.clone().oneshot(put).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let get = Request::builder()
        .uri("/api/conversations/conv-42")
        .method(Method::GET)
        .header("apikey", TEST_API_KEY)
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let loaded: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(loaded, payload);
}

/// The path id wins over a mismatched body id.
#[tokio::test]
async fn test_conversation_id_mismatch_is_rejected() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&[]))).await;
    let app = test_app(&upstream).await;

    let put = Request::builder()
        .uri("/api/conversations/other-id")
        .method(Method::PUT)
        .header(header::CONTENT_TYPE, "application/json")
        .header("apikey", TEST_API_KEY)
        .body(Body::from(conversation_payload().to_string()))
        .unwrap();
    let response = app.router.oneshot(put).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Persistence requested with no database configured is a loud 500, not a
/// silent no-op.
#[tokio::test]
async fn test_persist_without_database_is_a_config_error() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&["hi"]))).await;
    let app = test_app_without_persistence(&upstream).await;

    let response = app
        .router
        .oneshot(chat_request(json!({
            "tool": "chat", "message": "hi", "stream": true, "persist": true
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

/// Streamed tokens are best-effort persisted to the conversation store.
#[tokio::test]
async fn test_streamed_tokens_are_persisted() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&["Hel", "lo"]))).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .clone()
        .oneshot(chat_request(json!({
            "tool": "chat",
            "message": "hi",
            "stream": true,
            "persist": true,
            "conversationId": "conv-stream"
        })))
        .await
        .unwrap();

    // Reading the body to the end means the relay task has finished,
    // including its persistence writes.
    let events = parse_events(&body_string(response).await);
    assert_eq!(events.last().unwrap()["type"], "done");

    let get = Request::builder()
        .uri("/api/conversations/conv-stream")
        .method(Method::GET)
        .header("apikey", TEST_API_KEY)
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let loaded: Value = serde_json::from_str(&body_string(response).await).unwrap();
    let messages = loaded["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "assistant");
    assert_eq!(messages[0]["content"], "Hello");
}

fn multipart_request(path: &str, upsert: bool, file_name: &str, data: &str) -> Request<Body> {
    let boundary = "muse-test-boundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
         Content-Type: image/png\r\n\r\n\
         {data}\r\n\
         --{boundary}--\r\n"
    );

    Request::builder()
        .uri(format!("/api/uploads?path={path}&upsert={upsert}"))
        .method(Method::POST)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .header("apikey", TEST_API_KEY)
        .body(Body::from(body))
        .unwrap()
}

/// Upload, read back, and collide: the conflict is distinct from other
/// failures so the caller knows to pick a fresh name.
#[tokio::test]
async fn test_upload_readback_and_conflict() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&[]))).await;
    let app = test_app(&upstream).await;

    let response = app
        .router
        .clone()
        .oneshot(multipart_request("pic.png", false, "pic.png", "PNGDATA"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stored: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(stored["path"], "pic.png");
    assert!(stored["url"].as_str().unwrap().ends_with("/pic.png"));

    // Serve the object back.
    let get = Request::builder()
        .uri("/uploads/pic.png")
        .method(Method::GET)
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "PNGDATA");

    // Same name again without upsert: conflict.
    let response = app
        .router
        .oneshot(multipart_request("pic.png", false, "pic.png", "OTHER"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["code"], "CONFLICT");
}

/// Uploads need credentials like everything else under /api.
#[tokio::test]
async fn test_upload_requires_credentials() {
    let upstream = spawn_upstream(Upstream::Sse(sse_body(&[]))).await;
    let app = test_app(&upstream).await;

    let mut request = multipart_request("x.png", false, "x.png", "DATA");
    request.headers_mut().remove("apikey");

    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
