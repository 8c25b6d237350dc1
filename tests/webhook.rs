//! Router-level tests for the webhook shell, driven with `tower::ServiceExt::oneshot`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use pr_cli::model::Trigger;
use pr_cli::processor::Outcome;
use pr_cli::webhook::metrics::Metrics;
use pr_cli::webhook::signature::sign_github;
use pr_cli::webhook::{AppState, TriggerHandler, WebhookConfig, queue, router};

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Trigger>>,
    fail: bool,
}

#[async_trait]
impl TriggerHandler for Recorder {
    async fn handle(&self, trigger: &Trigger) -> anyhow::Result<Outcome> {
        self.seen.lock().unwrap().push(trigger.clone());
        Ok(Outcome { failed: self.fail, ..Default::default() })
    }
}

fn inline_config() -> WebhookConfig {
    WebhookConfig { async_processing: false, ..Default::default() }
}

fn app(config: WebhookConfig, handler: Arc<Recorder>) -> axum::Router {
    router(Arc::new(AppState::new(config, handler, Metrics::new().unwrap(), None)))
}

fn pr_comment_body(owner: &str, repo: &str, text: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "action": "created",
        "repository": { "name": repo, "owner": { "login": owner } },
        "sender": { "login": "bob" },
        "issue": { "number": 7, "pull_request": { "url": "https://api.example.test/pulls/7" } },
        "comment": { "body": text, "user": { "login": "bob" } }
    }))
    .unwrap()
}

fn github_request(event: &str, delivery: &str, body: Vec<u8>, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header("x-github-event", event)
        .header("x-github-delivery", delivery);
    if let Some(sig) = signature {
        builder = builder.header("x-hub-signature-256", sig);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ── Routing and filtering ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_pr_comment_is_processed_inline() {
    let handler = Arc::new(Recorder::default());
    let app = app(inline_config(), handler.clone());

    let response = app
        .oneshot(github_request("issue_comment", "d-1", pr_comment_body("acme", "app", "/lgtm"), None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "processed");
    let seen = handler.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].trigger_text, "/lgtm");
    assert_eq!(seen[0].event_id.as_deref(), Some("d-1"));
}

#[tokio::test]
async fn test_failed_outcome_returns_500() {
    let handler = Arc::new(Recorder { fail: true, ..Default::default() });
    let response = app(inline_config(), handler)
        .oneshot(github_request("issue_comment", "d-1", pr_comment_body("acme", "app", "/merge"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_unrelated_event_is_ignored() {
    let handler = Arc::new(Recorder::default());
    let body = serde_json::to_vec(&json!({
        "action": "started",
        "repository": { "name": "app", "owner": { "login": "acme" } }
    }))
    .unwrap();

    let response = app(inline_config(), handler.clone())
        .oneshot(github_request("watch", "d-2", body, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ignored");
    assert!(handler.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_source_is_bad_request() {
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .body(Body::from("{}"))
        .unwrap();
    let response = app(inline_config(), Arc::new(Recorder::default()))
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_gitlab_note_is_routed() {
    let handler = Arc::new(Recorder::default());
    let body = serde_json::to_vec(&json!({
        "object_kind": "note",
        "user": { "username": "bob" },
        "project": { "path_with_namespace": "acme/app" },
        "object_attributes": { "noteable_type": "MergeRequest", "note": "/check" },
        "merge_request": { "iid": 3 }
    }))
    .unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("x-gitlab-event", "Note Hook")
        .header("x-gitlab-event-uuid", "uuid-1")
        .body(Body::from(body))
        .unwrap();

    let response = app(inline_config(), handler.clone()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let seen = handler.seen.lock().unwrap();
    assert_eq!(seen[0].pr_number, 3);
    assert_eq!(seen[0].repo_owner, "acme");
}

// ── Admission control ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_signature_required() {
    let config = WebhookConfig {
        require_signature: true,
        secret: Some("s3cret".to_string()),
        ..inline_config()
    };
    let handler = Arc::new(Recorder::default());
    let app = app(config, handler.clone());
    let body = pr_comment_body("acme", "app", "/lgtm");

    let unsigned = app
        .clone()
        .oneshot(github_request("issue_comment", "d-1", body.clone(), None))
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .clone()
        .oneshot(github_request("issue_comment", "d-2", body.clone(), Some(sign_github("nope", &body))))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let signed = app
        .oneshot(github_request("issue_comment", "d-3", body.clone(), Some(sign_github("s3cret", &body))))
        .await
        .unwrap();
    assert_eq!(signed.status(), StatusCode::OK);
    assert_eq!(handler.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_gitlab_token_required() {
    let config = WebhookConfig {
        require_signature: true,
        secret: Some("s3cret".to_string()),
        ..inline_config()
    };
    let body = serde_json::to_vec(&json!({
        "object_kind": "note",
        "user": { "username": "bob" },
        "project": { "path_with_namespace": "acme/app" },
        "object_attributes": { "noteable_type": "MergeRequest", "note": "/check" },
        "merge_request": { "iid": 3 }
    }))
    .unwrap();
    let request = |token: &str| {
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("x-gitlab-event", "Note Hook")
            .header("x-gitlab-token", token)
            .body(Body::from(body.clone()))
            .unwrap()
    };
    let app = app(config, Arc::new(Recorder::default()));

    let bad = app.clone().oneshot(request("guess")).await.unwrap();
    assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);
    let good = app.oneshot(request("s3cret")).await.unwrap();
    assert_eq!(good.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_repo_outside_allowlist_is_forbidden() {
    let config = WebhookConfig {
        allowed_repos: vec!["acme/*".to_string()],
        ..inline_config()
    };
    let handler = Arc::new(Recorder::default());
    let app = app(config, handler.clone());

    let allowed = app
        .clone()
        .oneshot(github_request("issue_comment", "d-1", pr_comment_body("acme", "tools", "/lgtm"), None))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    let denied = app
        .oneshot(github_request("issue_comment", "d-2", pr_comment_body("other", "app", "/lgtm"), None))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    assert_eq!(handler.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_redelivery_is_deduplicated() {
    let handler = Arc::new(Recorder::default());
    let app = app(inline_config(), handler.clone());
    let body = pr_comment_body("acme", "app", "/lgtm");

    let first = app
        .clone()
        .oneshot(github_request("issue_comment", "same-id", body.clone(), None))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(github_request("issue_comment", "same-id", body, None))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(json_body(second).await["status"], "duplicate");
    assert_eq!(handler.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_rate_limit() {
    let config = WebhookConfig { rate_limit: Some(1), ..inline_config() };
    let app = app(config, Arc::new(Recorder::default()));

    let ok = app
        .clone()
        .oneshot(github_request("issue_comment", "d-1", pr_comment_body("acme", "app", "/lgtm"), None))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let limited = app
        .oneshot(github_request("issue_comment", "d-2", pr_comment_body("acme", "app", "/lgtm"), None))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
}

// ── Async processing, health and metrics ──────────────────────────────────────

#[tokio::test]
async fn test_async_mode_queues_and_returns_202() {
    let handler = Arc::new(Recorder::default());
    let metrics = Metrics::new().unwrap();
    let (q, pool) = queue::start(4, 1, handler.clone(), metrics.clone());
    let state = Arc::new(AppState::new(WebhookConfig::default(), handler.clone(), metrics, Some(q)));
    let app = router(state);

    let response = app
        .oneshot(github_request("issue_comment", "d-1", pr_comment_body("acme", "app", "/lgtm"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await["status"], "queued");

    for _ in 0..100 {
        if !handler.seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(handler.seen.lock().unwrap().len(), 1);
    pool.shutdown(std::time::Duration::from_secs(1)).await;
}

/// Records each trigger, then waits for a permit before finishing it.
struct Gated {
    seen: Mutex<Vec<Trigger>>,
    permits: tokio::sync::Semaphore,
}

#[async_trait]
impl TriggerHandler for Gated {
    async fn handle(&self, trigger: &Trigger) -> anyhow::Result<Outcome> {
        self.seen.lock().unwrap().push(trigger.clone());
        self.permits.acquire().await?.forget();
        Ok(Outcome::default())
    }
}

async fn wait_for(handler: &Gated, count: usize) {
    for _ in 0..200 {
        if handler.seen.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("handler never saw {count} triggers");
}

#[tokio::test]
async fn test_shed_delivery_is_accepted_when_redelivered() {
    let handler = Arc::new(Gated { seen: Mutex::new(Vec::new()), permits: tokio::sync::Semaphore::new(0) });
    let metrics = Metrics::new().unwrap();
    let (q, pool) = queue::start(1, 1, handler.clone(), metrics.clone());
    let app = router(Arc::new(AppState::new(WebhookConfig::default(), handler.clone(), metrics, Some(q))));
    let send = |delivery: &str| {
        app.clone()
            .oneshot(github_request("issue_comment", delivery, pr_comment_body("acme", "app", "/lgtm"), None))
    };

    assert_eq!(send("d-1").await.unwrap().status(), StatusCode::ACCEPTED);
    wait_for(&handler, 1).await;
    assert_eq!(send("d-2").await.unwrap().status(), StatusCode::ACCEPTED);

    let shed = send("d-3").await.unwrap();
    assert_eq!(shed.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(shed).await["status"], "queue_full");

    // Still saturated: the retry is shed again rather than swallowed as a duplicate.
    let retried = send("d-3").await.unwrap();
    assert_eq!(retried.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(retried).await["status"], "queue_full");

    handler.permits.add_permits(8);
    wait_for(&handler, 2).await;
    for _ in 0..200 {
        if send("d-3").await.unwrap().status() == StatusCode::ACCEPTED {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    wait_for(&handler, 3).await;

    let ids: Vec<_> = handler
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|t| t.event_id.clone().unwrap_or_default())
        .collect();
    assert_eq!(ids, vec!["d-1", "d-2", "d-3"]);

    let again = send("d-2").await.unwrap();
    assert_eq!(json_body(again).await["status"], "duplicate");
    pool.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_health_and_metrics_routes() {
    let app = app(inline_config(), Arc::new(Recorder::default()));

    let health = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(json_body(health).await["status"], "ok");

    app.clone()
        .oneshot(github_request("issue_comment", "d-1", pr_comment_body("acme", "app", "/lgtm"), None))
        .await
        .unwrap();

    let metrics = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    let bytes = metrics.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains(r#"pr_cli_webhook_requests_total{result="processed"} 1"#));
    assert!(text.contains("pr_cli_invocation_seconds"));
}
