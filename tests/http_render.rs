use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header::CONTENT_TYPE},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use renderpool::application::render::{RenderService, RenderSettings};
use renderpool::engine::memory::{MemoryEngine, PLACEHOLDER_PDF, PLACEHOLDER_PNG};
use renderpool::infra::http::{FAILED_REQUESTS_HEADER, HttpState, build_router};
use renderpool::pool::{ResolverConfig, ResolverRegistry};

const BODY_LIMIT: usize = 64 * 1024;

fn router_with(engine: &MemoryEngine) -> Router {
    let registry = Arc::new(ResolverRegistry::new(
        Arc::new(engine.clone()),
        ResolverConfig::default(),
    ));
    let render = RenderService::new(registry, RenderSettings::default());
    build_router(HttpState { render }, BODY_LIMIT)
}

fn render_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/render")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

#[tokio::test]
async fn healthz_answers_no_content() {
    let router = router_with(&MemoryEngine::new());
    let response = router
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn render_html_returns_png() {
    let router = router_with(&MemoryEngine::new());
    let response = router
        .oneshot(render_request(json!({ "html": "<h1>report</h1>" })))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
    assert_eq!(response.headers()[FAILED_REQUESTS_HEADER], "false");
    assert_eq!(body_bytes(response).await, PLACEHOLDER_PNG);
}

#[tokio::test]
async fn render_url_as_pdf() {
    let router = router_with(&MemoryEngine::new());
    let response = router
        .oneshot(render_request(json!({
            "url": "https://example.com/",
            "format": "pdf",
            "isolated": true,
        })))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
    assert_eq!(body_bytes(response).await, PLACEHOLDER_PDF);
}

#[tokio::test]
async fn render_requires_exactly_one_source() {
    let router = router_with(&MemoryEngine::new());

    let response = router
        .clone()
        .oneshot(render_request(json!({ "format": "png" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "exactly one of `url` and `html` is required");

    let response = router
        .oneshot(render_request(json!({
            "url": "https://example.com/",
            "html": "<p>both</p>",
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsupported_scheme_is_a_bad_request() {
    let engine = MemoryEngine::new();
    let router = router_with(&engine);
    let response = router
        .oneshot(render_request(json!({ "url": "ftp://files.example/report" })))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(
        body["error"]
            .as_str()
            .expect("message")
            .contains("unsupported url scheme")
    );
    assert_eq!(engine.launch_count(), 0, "rejected before touching the pool");
}

#[tokio::test]
async fn launch_failure_is_service_unavailable() {
    let engine = MemoryEngine::new();
    engine.fail_next_launch("chromium not found");
    let router = router_with(&engine);

    let response = router
        .clone()
        .oneshot(render_request(json!({ "html": "<p>hi</p>" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert!(
        body["error"]
            .as_str()
            .expect("message")
            .contains("chromium not found")
    );

    let retry = router
        .oneshot(render_request(json!({ "html": "<p>hi</p>" })))
        .await
        .expect("response");
    assert_eq!(retry.status(), StatusCode::OK, "next request relaunches");
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let router = router_with(&MemoryEngine::new());
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/render")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from("{\"html\":"))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let router = router_with(&MemoryEngine::new());
    let html = "x".repeat(BODY_LIMIT * 2);
    let response = router
        .oneshot(render_request(json!({ "html": html })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn pool_lists_resolver_state() {
    let router = router_with(&MemoryEngine::new());
    let response = router
        .clone()
        .oneshot(render_request(json!({ "html": "<p>hi</p>" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/pool")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let resolvers = body["resolvers"].as_array().expect("resolvers");
    assert_eq!(resolvers.len(), 1);
    assert_eq!(resolvers[0]["key"], "default");
    assert_eq!(resolvers[0]["phase"], "ready");
    assert_eq!(resolvers[0]["queued_waiters"], 0);
    assert_eq!(resolvers[0]["state"]["created_page_count"], 1);
    assert_eq!(resolvers[0]["state"]["active_page_count"], 0);
}
