//! Notification endpoint driven through the router, without a socket.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;

use inbox_drafter::config::ServerConfig;
use inbox_drafter::pipeline::types::{ChangeType, NotificationSource};
use inbox_drafter::webhook::{channel, webhook_routes};

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

fn notify(payload: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/graph-notifications")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn created(message_id: &str) -> serde_json::Value {
    serde_json::json!({
        "subscriptionId": "sub-1",
        "changeType": "created",
        "resource": format!("Users/owner/Messages/{message_id}"),
        "clientState": "shh",
        "resourceData": {"id": message_id}
    })
}

#[tokio::test]
async fn health_reports_success() {
    let (tx, _source) = channel(4);
    let app = webhook_routes(tx, &ServerConfig::default());

    let response = app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["status"], "success");
    assert!(json["time"].as_str().is_some());
}

#[tokio::test]
async fn validation_token_is_echoed_as_plain_text() {
    let (tx, _source) = channel(4);
    let app = webhook_routes(tx, &ServerConfig::default());

    let response = app
        .oneshot(
            Request::post("/api/graph-notifications?validationToken=Validation%3A%20Token%201")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    assert_eq!(body_bytes(response).await, b"Validation: Token 1");
}

#[tokio::test]
async fn notifications_are_queued_and_accepted() {
    let (tx, mut source) = channel(8);
    let app = webhook_routes(tx, &ServerConfig::default());

    let response = app
        .oneshot(notify(&serde_json::json!({
            "value": [created("m1"), created("m2")]
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let first = source.next().await.unwrap();
    assert_eq!(first.message_id, "m1");
    assert_eq!(first.change_type, ChangeType::Created);
    assert_eq!(first.subscription_id, "sub-1");
    assert_eq!(source.next().await.unwrap().message_id, "m2");
}

#[tokio::test]
async fn malformed_payload_is_bad_request() {
    let (tx, _source) = channel(4);
    let app = webhook_routes(tx, &ServerConfig::default());

    let response = app
        .oneshot(
            Request::post("/api/graph-notifications")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mismatched_client_state_is_dropped() {
    let (tx, mut source) = channel(4);
    let config = ServerConfig {
        client_state: Some("expected".into()),
        ..ServerConfig::default()
    };
    let app = webhook_routes(tx, &config);

    let response = app
        .oneshot(notify(&serde_json::json!({ "value": [created("m1")] })))
        .await
        .unwrap();

    // Accepted so the provider does not retry, but nothing reaches the pipeline.
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(source.next().await.is_none());
}

#[tokio::test]
async fn non_message_resources_are_dropped() {
    let (tx, mut source) = channel(4);
    let app = webhook_routes(tx, &ServerConfig::default());

    let response = app
        .oneshot(notify(&serde_json::json!({
            "value": [{"subscriptionId": "s", "changeType": "created", "resource": "Users/owner/Events/e1"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(source.next().await.is_none());
}

#[tokio::test]
async fn full_queue_asks_for_redelivery() {
    let (tx, _source) = channel(1);
    let app = webhook_routes(tx, &ServerConfig::default());

    let response = app
        .oneshot(notify(&serde_json::json!({
            "value": [created("m1"), created("m2")]
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn permissive_cors_answers_preflight() {
    let (tx, _source) = channel(4);
    let config = ServerConfig {
        cors_permissive: true,
        ..ServerConfig::default()
    };
    let app = webhook_routes(tx, &config);

    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/health")
                .header(header::ORIGIN, "http://localhost:3000")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
    );
}
