//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server.
//! The agent runs on the in-memory broker and store, so no external service
//! is needed.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use hookrelay_api::routes::create_router;
use hookrelay_api::state::AppState;
use hookrelay_common::memory::{MemoryBroker, MemoryStore};
use hookrelay_common::types::{FANIN_QUEUE, NotificationRequest};
use hookrelay_notifier::NotifyAgent;

// ============================================================
// Helpers
// ============================================================

fn build_app() -> (Router, MemoryBroker, MemoryStore) {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let agent = NotifyAgent::new(Box::new(broker.clone()), Arc::new(store.clone()));
    let app = create_router(AppState::new(agent));
    (app, broker, store)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(serde_json::to_string(&body).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

// ============================================================
// Tests
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _, _) = build_app();

    let (status, json) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "hookrelay-api");
}

#[tokio::test]
async fn test_immediate_notification_is_queued() {
    let (app, broker, store) = build_app();

    let (status, json) = send(
        &app,
        "POST",
        "/api/notifications",
        Some(json!({"url": "http://x/test", "data": {"id": 1}, "caller": "billing"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({"queued": true}));

    let pushes = broker.pushes_to(FANIN_QUEUE).await;
    assert_eq!(pushes.len(), 1);
    let request = NotificationRequest::from_json(&pushes[0].payload).unwrap();
    assert_eq!(request.caller, "billing");
    assert_eq!(request.data, r#"{"id":1}"#);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_scheduled_notification_is_stored() {
    let (app, broker, store) = build_app();
    let at = chrono::Utc::now() + chrono::Duration::hours(2);

    let (status, json) = send(
        &app,
        "POST",
        "/api/notifications",
        Some(json!({"url": "http://x/test", "scheduledTime": at})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["queued"], false);
    let id = json["id"].as_i64().unwrap();
    assert!(store.get(id).await.is_some());
    assert!(broker.pushes().await.is_empty());
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let (app, broker, _) = build_app();

    let (status, json) = send(
        &app,
        "POST",
        "/api/notifications",
        Some(json!({"url": "http://x/test", "contentType": "text/plain"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "unsupported Http Content-Type");

    let (status, _) = send(
        &app,
        "POST",
        "/api/notifications",
        Some(json!({"url": "http://x/test", "sendImmediate": false})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    assert!(broker.pushes().await.is_empty());
}

#[tokio::test]
async fn test_trigger_and_cancel_flow() {
    let (app, broker, store) = build_app();

    for key in ["order-1", "order-2"] {
        let (status, _) = send(
            &app,
            "POST",
            "/api/notifications",
            Some(json!({
                "url": "http://x/test",
                "sendImmediate": false,
                "externalKey": key,
                "data": {"order": key}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(store.len().await, 2);

    // Trigger merges the body into the stored payload
    let (status, json) = send(
        &app,
        "POST",
        "/api/notifications/order-1/trigger",
        Some(json!({"state": "paid"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["triggered"], true);

    let pushes = broker.pushes_to(FANIN_QUEUE).await;
    assert_eq!(pushes.len(), 1);
    let request = NotificationRequest::from_json(&pushes[0].payload).unwrap();
    assert_eq!(
        serde_json::from_str::<Value>(&request.data).unwrap(),
        json!({"order": "order-1", "state": "paid"})
    );

    // Trigger without a body releases the payload unchanged
    let (status, _) = send(&app, "POST", "/api/notifications/order-2/trigger", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(broker.pushes_to(FANIN_QUEUE).await.len(), 2);
    assert!(store.is_empty().await);

    // Already released keys are gone
    let (status, _) = send(&app, "POST", "/api/notifications/order-1/trigger", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "DELETE", "/api/notifications/order-2", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_removes_stored_notification() {
    let (app, broker, store) = build_app();

    send(
        &app,
        "POST",
        "/api/notifications",
        Some(json!({"url": "http://x/test", "sendImmediate": false, "externalKey": "k-1"})),
    )
    .await;

    let (status, json) = send(&app, "DELETE", "/api/notifications/k-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], true);
    assert!(store.is_empty().await);
    assert!(broker.pushes().await.is_empty());
}
