#[path = "common/mod.rs"]
mod common;

use axum::http::{Request, StatusCode};
use axum::Router;
use common::EnvGuard;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tower::ServiceExt; // for oneshot

use pagefill::{app, build_state_from_env};

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn page_body() -> Vec<u8> {
    let payload = serde_json::json!({
        "questions": [{"index": 0, "qtext": "Your name", "type": "text"}]
    });
    serde_json::to_vec(&payload).unwrap()
}

fn post_request(origin: Option<&str>) -> Request<axum::body::Body> {
    let body = page_body();
    let mut builder = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json");
    if let Some(o) = origin {
        builder = builder.header("origin", o);
    }
    builder.body(axum::body::Body::from(body)).unwrap()
}

fn allow_origin_header(resp: &axum::response::Response) -> Option<String> {
    resp.headers()
        .get("access-control-allow-origin")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[tokio::test]
async fn unset_allow_list_permits_any_origin() {
    let _lock = ENV_MUTEX.lock().await;
    let mut env = EnvGuard::new();
    env.clear_service_env();
    let state = build_state_from_env().unwrap();
    let app: Router = app(state);

    let resp = app
        .oneshot(post_request(Some("https://anything.example")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(allow_origin_header(&resp).as_deref(), Some("*"));
}

#[tokio::test]
async fn listed_origin_is_echoed_back() {
    let _lock = ENV_MUTEX.lock().await;
    let mut env = EnvGuard::new();
    env.clear_service_env();
    env.set("ALLOWED_ORIGINS", "https://a.example,https://b.example");
    let state = build_state_from_env().unwrap();
    let app: Router = app(state);

    let resp = app
        .oneshot(post_request(Some("https://b.example")))
        .await
        .unwrap();
    assert_eq!(
        allow_origin_header(&resp).as_deref(),
        Some("https://b.example")
    );
}

#[tokio::test]
async fn unlisted_origin_gets_first_configured_origin() {
    let _lock = ENV_MUTEX.lock().await;
    let mut env = EnvGuard::new();
    env.clear_service_env();
    env.set("ALLOWED_ORIGINS", "https://a.example,https://b.example");
    let state = build_state_from_env().unwrap();
    let app: Router = app(state);

    let resp = app
        .oneshot(post_request(Some("https://evil.example")))
        .await
        .unwrap();
    assert_eq!(
        allow_origin_header(&resp).as_deref(),
        Some("https://a.example")
    );
}

#[tokio::test]
async fn preflight_returns_no_content_with_cors_headers() {
    let _lock = ENV_MUTEX.lock().await;
    let mut env = EnvGuard::new();
    env.clear_service_env();
    let state = build_state_from_env().unwrap();
    let app: Router = app(state);

    let req = Request::builder()
        .method("OPTIONS")
        .uri("/")
        .header("origin", "https://anything.example")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(allow_origin_header(&resp).as_deref(), Some("*"));
    assert_eq!(
        resp.headers()
            .get("access-control-allow-methods")
            .and_then(|v| v.to_str().ok()),
        Some("POST, OPTIONS")
    );
    assert_eq!(
        resp.headers()
            .get("access-control-allow-headers")
            .and_then(|v| v.to_str().ok()),
        Some("Content-Type, Authorization")
    );
}

#[tokio::test]
async fn error_responses_also_carry_cors_headers() {
    let _lock = ENV_MUTEX.lock().await;
    let mut env = EnvGuard::new();
    env.clear_service_env();
    env.set("ALLOWED_ORIGINS", "https://a.example");
    let state = build_state_from_env().unwrap();
    let app: Router = app(state);

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json")
        .header("origin", "https://a.example")
        .body(axum::body::Body::from("{ not json"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        allow_origin_header(&resp).as_deref(),
        Some("https://a.example")
    );
}
